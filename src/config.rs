use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;


#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// maximum number of messages waiting for transmission; the oldest one is dropped when a
    ///  message is enqueued into a full queue
    pub outbound_queue_capacity: usize,
    /// maximum number of received messages waiting for dispatch, drop-oldest like the outbound
    ///  queue
    pub inbound_queue_capacity: usize,

    /// number of consecutive unacknowledged exchanges after which the link is reported as lost
    pub retry_budget: u32,
    pub link_quality_window: usize,

    /// number of consecutive exchanges without downlink data after which the pump starts to
    ///  throttle keep-alive traffic
    pub empty_response_cap: u32,
    pub idle_backoff: Duration,
    pub inbound_poll_interval: Duration,

    pub safelink_attempts: u32,

    pub loop_start_timeout: Duration,
    pub loop_stop_timeout: Duration,

    /// default interval for re-sending a message until its answer arrives
    pub resend_interval: Duration,

    pub toc_fetch_timeout: Duration,
    pub toc_cache_dir: Option<PathBuf>,

    pub protocol_probe_timeout: Duration,

    pub param_stop_timeout: Duration,
    pub param_request_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::new()
    }
}

impl LinkConfig {
    pub fn new() -> LinkConfig {
        LinkConfig {
            outbound_queue_capacity: 20,
            inbound_queue_capacity: 100,
            retry_budget: 100,
            link_quality_window: 100,
            empty_response_cap: 10,
            idle_backoff: Duration::from_millis(10),
            inbound_poll_interval: Duration::from_millis(100),
            safelink_attempts: 10,
            loop_start_timeout: Duration::from_secs(5),
            loop_stop_timeout: Duration::from_secs(4),
            resend_interval: Duration::from_millis(250),
            toc_fetch_timeout: Duration::from_secs(40),
            toc_cache_dir: None,
            protocol_probe_timeout: Duration::from_secs(5),
            param_stop_timeout: Duration::from_secs(2),
            param_request_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outbound_queue_capacity == 0 || self.inbound_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        if self.retry_budget == 0 {
            bail!("retry budget must be positive");
        }
        if self.link_quality_window == 0 {
            bail!("link quality window must hold at least one sample");
        }
        if self.resend_interval.is_zero() {
            bail!("resend interval must be positive");
        }
        if self.inbound_poll_interval.is_zero() {
            bail!("inbound poll interval must be positive");
        }
        if let Some(dir) = &self.toc_cache_dir {
            if dir.exists() && !dir.is_dir() {
                bail!("TOC cache location {:?} is not a directory", dir);
            }
        }

        Ok(())
    }
}
