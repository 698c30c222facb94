use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::crtp::communicator::{CrtpCommunicator, CrtpSender, MessageMatcher};
use crate::crtp::crtp_message::{CrtpMessage, ExchangeResult};
use crate::crtp::drop_oldest_queue::DropOldestQueue;
use crate::crtp::event_registry::{EventRegistry, HandlerId, MessageHandler};
use crate::crtp::link_events::{LinkEvent, LinkEventNotifier};
use crate::crtp::link_quality::LinkQualityTracker;
use crate::crtp::reliable_request::ReliableRequest;
use crate::crtp::safelink::{is_safelink_confirmation, SafeLinkState, SAFELINK_ENABLE_REQUEST};
use crate::radio::RadioLink;


impl CrtpSender for DropOldestQueue<CrtpMessage> {
    fn send(&self, message: CrtpMessage) {
        trace!(?message, "enqueueing");
        self.push(message);
    }
}


struct RunningLoops {
    running: Arc<AtomicBool>,
    dispatch: JoinHandle<()>,
    exchange: JoinHandle<()>,
}

/// kept outside the async lifecycle lock so the loops can be killed from synchronous code
struct LoopKillSwitch {
    running: Arc<AtomicBool>,
    dispatch: AbortHandle,
    exchange: AbortHandle,
}

/// The MessagePump keeps the radio busy: it exchanges queued messages (or keep-alive packets
///  if there are none) with the copter in an endless loop, and distributes received messages
///  to registered handlers in a second loop.
pub struct MessagePump {
    config: Arc<LinkConfig>,
    radio: Arc<dyn RadioLink>,
    outbound: Arc<DropOldestQueue<CrtpMessage>>,
    inbound: Arc<DropOldestQueue<CrtpMessage>>,
    registry: Arc<EventRegistry>,
    reliable: Arc<ReliableRequest>,
    link_events: Arc<LinkEventNotifier>,
    loops: tokio::sync::Mutex<Option<RunningLoops>>,
    kill_switch: parking_lot::Mutex<Option<LoopKillSwitch>>,
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.abort();
    }
}

impl MessagePump {
    pub fn new(radio: Arc<dyn RadioLink>, config: Arc<LinkConfig>) -> MessagePump {
        let outbound = Arc::new(DropOldestQueue::new("outbound", config.outbound_queue_capacity));
        let inbound = Arc::new(DropOldestQueue::new("inbound", config.inbound_queue_capacity));
        let reliable = Arc::new(ReliableRequest::new(outbound.clone()));

        let registry = Arc::new(EventRegistry::new());
        {
            let reliable = reliable.clone();
            registry.register_all_ports_handler(Arc::new(move |msg: &CrtpMessage| {
                reliable.on_message_received(msg);
            }));
        }

        MessagePump {
            config,
            radio,
            outbound,
            inbound,
            registry,
            reliable,
            link_events: Arc::new(LinkEventNotifier::new()),
            loops: Default::default(),
            kill_switch: Default::default(),
        }
    }

    pub fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let Ok(mut loops) = self.loops.try_lock() else {
            bail!("message pump is being started or stopped concurrently");
        };
        if loops.is_some() {
            bail!("message pump is already running");
        }
        if !self.radio.is_open().await {
            bail!("cannot start message pump: radio link is not open");
        }
        if self.radio.settings().await.channel.is_none() {
            bail!("cannot start message pump: no radio channel selected");
        }

        let running = Arc::new(AtomicBool::new(true));

        let (dispatch_ready, dispatch_ready_rx) = oneshot::channel();
        let dispatch_loop = DispatchLoop {
            running: running.clone(),
            inbound: self.inbound.clone(),
            registry: self.registry.clone(),
            poll_interval: self.config.inbound_poll_interval,
        };
        let dispatch = tokio::spawn(dispatch_loop.run(dispatch_ready));
        if !matches!(timeout(self.config.loop_start_timeout, dispatch_ready_rx).await, Ok(Ok(()))) {
            running.store(false, Ordering::Release);
            dispatch.abort();
            bail!("dispatch loop did not start within {:?}", self.config.loop_start_timeout);
        }

        let (exchange_ready, exchange_ready_rx) = oneshot::channel();
        let exchange_loop = ExchangeLoop::new(
            self.config.clone(),
            running.clone(),
            self.radio.clone(),
            self.outbound.clone(),
            self.inbound.clone(),
            self.link_events.clone(),
        );
        let exchange = tokio::spawn(exchange_loop.run(exchange_ready));
        if !matches!(timeout(self.config.loop_start_timeout, exchange_ready_rx).await, Ok(Ok(()))) {
            running.store(false, Ordering::Release);
            dispatch.abort();
            exchange.abort();
            bail!("exchange loop did not start within {:?}", self.config.loop_start_timeout);
        }

        *self.kill_switch.lock() = Some(LoopKillSwitch {
            running: running.clone(),
            dispatch: dispatch.abort_handle(),
            exchange: exchange.abort_handle(),
        });
        *loops = Some(RunningLoops {
            running,
            dispatch,
            exchange,
        });
        info!("message pump started");
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut loops = self.loops.lock().await;
        let Some(running_loops) = loops.take() else {
            bail!("message pump is not running");
        };
        self.kill_switch.lock().take();

        running_loops.running.store(false, Ordering::Release);
        self.inbound.wake_consumer();
        self.outbound.wake_consumer();

        self.join("dispatch loop", running_loops.dispatch).await;
        self.join("exchange loop", running_loops.exchange).await;

        self.reliable.cancel_all();
        self.outbound.clear();
        self.inbound.clear();

        info!("message pump stopped");
        Ok(())
    }

    /// Stops both loops immediately without waiting for them, and drops everything that is still
    ///  queued or awaiting an answer. No radio exchange is started after this returns; an exchange
    ///  that is in progress on another thread may still complete.
    pub fn abort(&self) {
        let Some(kill_switch) = self.kill_switch.lock().take() else {
            return;
        };
        warn!("aborting message pump");
        kill_switch.running.store(false, Ordering::Release);
        kill_switch.dispatch.abort();
        kill_switch.exchange.abort();

        self.reliable.cancel_all();
        self.outbound.clear();
        self.inbound.clear();
    }

    async fn join(&self, name: &str, mut handle: JoinHandle<()>) {
        match timeout(self.config.loop_stop_timeout, &mut handle).await {
            Ok(Ok(())) => debug!("{} terminated", name),
            Ok(Err(e)) if e.is_cancelled() => debug!("{} was aborted", name),
            Ok(Err(e)) => error!("{} terminated abnormally: {}", name, e),
            Err(_) => {
                warn!("{} did not terminate within {:?} - aborting it", name, self.config.loop_stop_timeout);
                handle.abort();
            }
        }
    }
}

impl CrtpSender for MessagePump {
    fn send(&self, message: CrtpMessage) {
        self.outbound.send(message);
    }
}

impl CrtpCommunicator for MessagePump {
    fn send_expecting_answer(&self, message: CrtpMessage, matcher: MessageMatcher, resend_interval: Duration) {
        self.reliable.register_expectation(message.clone(), matcher, resend_interval);
        self.outbound.send(message);
    }

    fn default_resend_interval(&self) -> Duration {
        self.config.resend_interval
    }

    fn register_handler(&self, port: u8, handler: MessageHandler) -> HandlerId {
        self.registry.register_handler(port, handler)
    }

    fn register_all_ports_handler(&self, handler: MessageHandler) -> HandlerId {
        self.registry.register_all_ports_handler(handler)
    }

    fn remove_handler(&self, port: u8, id: HandlerId) -> bool {
        self.registry.remove_handler(port, id)
    }

    fn remove_all_ports_handler(&self, id: HandlerId) -> bool {
        self.registry.remove_all_ports_handler(id)
    }
}


struct DispatchLoop {
    running: Arc<AtomicBool>,
    inbound: Arc<DropOldestQueue<CrtpMessage>>,
    registry: Arc<EventRegistry>,
    poll_interval: Duration,
}
impl DispatchLoop {
    async fn run(self, ready: oneshot::Sender<()>) {
        info!("dispatch loop started");
        let _ = ready.send(());

        while self.running.load(Ordering::Acquire) {
            if let Some(message) = self.inbound.pop_timeout(self.poll_interval).await {
                self.registry.notify(&message);
            }
        }
        info!("dispatch loop stopped");
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ExchangeOutcome {
    /// the message was not delivered and must be sent again
    Retry,
    Delivered { idle: bool },
}

struct ExchangeLoop {
    config: Arc<LinkConfig>,
    running: Arc<AtomicBool>,
    radio: Arc<dyn RadioLink>,
    outbound: Arc<DropOldestQueue<CrtpMessage>>,
    inbound: Arc<DropOldestQueue<CrtpMessage>>,
    link_events: Arc<LinkEventNotifier>,

    safelink: Option<SafeLinkState>,
    link_quality: LinkQualityTracker,
    retries_left: u32,
    num_empty_responses: u32,
}
impl ExchangeLoop {
    fn new(
        config: Arc<LinkConfig>,
        running: Arc<AtomicBool>,
        radio: Arc<dyn RadioLink>,
        outbound: Arc<DropOldestQueue<CrtpMessage>>,
        inbound: Arc<DropOldestQueue<CrtpMessage>>,
        link_events: Arc<LinkEventNotifier>,
    ) -> ExchangeLoop {
        ExchangeLoop {
            link_quality: LinkQualityTracker::new(config.link_quality_window),
            retries_left: config.retry_budget,
            config,
            running,
            radio,
            outbound,
            inbound,
            link_events,
            safelink: None,
            num_empty_responses: 0,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn run(mut self, ready: oneshot::Sender<()>) {
        info!("exchange loop started");
        self.safelink = self.negotiate_safelink().await;
        let _ = ready.send(());

        let mut unsent = None;
        while self.is_running() {
            let message = unsent.take()
                .or_else(|| self.outbound.try_pop())
                .unwrap_or_else(CrtpMessage::keep_alive);

            match self.exchange(&message).await {
                ExchangeOutcome::Retry => unsent = Some(message),
                ExchangeOutcome::Delivered { idle: true } => {
                    self.outbound.wait_for_item(self.config.idle_backoff).await;
                }
                ExchangeOutcome::Delivered { idle: false } => {}
            }
            tokio::task::yield_now().await;
        }
        info!("exchange loop stopped");
    }

    async fn negotiate_safelink(&self) -> Option<SafeLinkState> {
        for attempt in 1..=self.config.safelink_attempts {
            if !self.is_running() {
                break;
            }

            match self.radio.transmit(Bytes::from_static(&SAFELINK_ENABLE_REQUEST)).await {
                Ok(response) if is_safelink_confirmation(&response) => {
                    info!(attempt, "safelink enabled");
                    return Some(SafeLinkState::new());
                }
                Ok(response) => debug!(attempt, ?response, "no safelink confirmation"),
                Err(e) => debug!(attempt, "error requesting safelink: {}", e),
            }
        }
        info!("safelink not confirmed - continuing without it");
        None
    }

    async fn exchange(&mut self, message: &CrtpMessage) -> ExchangeOutcome {
        let packet = match &self.safelink {
            Some(safelink) => safelink.stamp(message),
            None => message.clone(),
        }.to_packet();

        let raw_response = match self.radio.transmit(packet).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("radio exchange failed: {}", e);
                self.link_events.send_error(format!("radio exchange failed: {}", e), false);
                tokio::time::sleep(self.config.idle_backoff).await;
                return ExchangeOutcome::Retry;
            }
        };

        let result = ExchangeResult::parse(&raw_response);
        let quality = self.link_quality.record(result.retry_count);
        self.link_events.send_event(LinkEvent::LinkQuality(quality));

        if !result.ack {
            self.retries_left = self.retries_left.saturating_sub(1);
            if self.retries_left == 0 {
                error!("too many unacknowledged packets - the copter seems to be out of reach");
                self.link_events.send_error("too many packets lost", true);
                self.retries_left = self.config.retry_budget;
            }
            return ExchangeOutcome::Retry;
        }
        self.retries_left = self.config.retry_budget;

        if let Some(safelink) = &mut self.safelink {
            safelink.on_acknowledged(result.received.as_ref().map(|msg| msg.header()));
        }

        match result.into_content() {
            Some(received) => {
                trace!(?received, "received");
                self.inbound.push(received);
                self.num_empty_responses = 0;
                ExchangeOutcome::Delivered { idle: false }
            }
            None => {
                self.num_empty_responses = (self.num_empty_responses + 1).min(self.config.empty_response_cap);
                ExchangeOutcome::Delivered { idle: self.num_empty_responses >= self.config.empty_response_cap }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::time::sleep;

    use crate::crtp::crtp_message::CrtpPort;
    use crate::crtp::link_events::LinkErrorData;
    use crate::radio::{MockRadioLink, RadioChannel, RadioSettings};
    use crate::test_util::radio::SimulatedCrazyflie;
    use super::*;

    fn settings_with_channel() -> RadioSettings {
        RadioSettings {
            channel: Some(RadioChannel::new(80).unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_open_radio() {
        let mut radio = MockRadioLink::new();
        radio.expect_is_open().returning(|| false);
        radio.expect_transmit().never();

        let pump = MessagePump::new(Arc::new(radio), Arc::new(LinkConfig::new()));
        assert!(pump.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_channel() {
        let mut radio = MockRadioLink::new();
        radio.expect_is_open().returning(|| true);
        radio.expect_settings().returning(RadioSettings::default);
        radio.expect_transmit().never();

        let pump = MessagePump::new(Arc::new(radio), Arc::new(LinkConfig::new()));
        assert!(pump.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_and_stop() {
        let mut radio = MockRadioLink::new();
        radio.expect_is_open().returning(|| true);
        radio.expect_settings().returning(settings_with_channel);
        radio.expect_transmit().returning(|_| Ok(Bytes::from_static(&[0x01])));

        let pump = MessagePump::new(Arc::new(radio), Arc::new(LinkConfig::new()));
        assert!(pump.stop().await.is_err());

        pump.start().await.unwrap();
        assert!(pump.start().await.is_err());
        pump.stop().await.unwrap();
        assert!(pump.stop().await.is_err());

        // restarting after a completed stop is fine
        pump.start().await.unwrap();
        pump.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_radio_traffic() {
        let copter = Arc::new(SimulatedCrazyflie::new(4));
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));
        pump.start().await.unwrap();
        pump.send_expecting_prefix(CrtpMessage::new(CrtpPort::Console, 0, vec![1]), Bytes::from_static(&[1]));
        sleep(Duration::from_millis(50)).await;

        pump.abort();
        let num_transmits = copter.uplink_headers().len();
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(copter.uplink_headers().len(), num_transmits);

        pump.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_a_running_pump_stops_radio_traffic() {
        let copter = Arc::new(SimulatedCrazyflie::new(4));
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));
        pump.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        drop(pump);
        let num_transmits = copter.uplink_headers().len();
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(copter.uplink_headers().len(), num_transmits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safelink_bits_on_the_wire() {
        let copter = Arc::new(SimulatedCrazyflie::new(4));
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));
        pump.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        pump.stop().await.unwrap();

        let uplink = copter.uplink_headers();
        assert!(uplink.len() > 4);
        // first packet: keep-alive with up=0, down=1; every ack flips up
        assert_eq!(uplink[0], 0xf7);
        assert_eq!(uplink[1] & 0x08, 0x08);
        assert_eq!(uplink[2] & 0x08, 0x00);
        assert_eq!(uplink[3] & 0x08, 0x08);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_safelink_headers_are_unchanged() {
        let copter = Arc::new(SimulatedCrazyflie::new(4).without_safelink());
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));
        pump.start().await.unwrap();
        pump.send(CrtpMessage::new(CrtpPort::Console, 0, vec![1]));
        sleep(Duration::from_millis(50)).await;
        pump.stop().await.unwrap();

        let uplink = copter.uplink_headers();
        assert!(uplink.iter().all(|&h| h == 0xff || h == 0x0c));
        assert!(uplink.contains(&0x0c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_messages_are_dispatched() {
        let copter = Arc::new(SimulatedCrazyflie::new(4));
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            pump.register_handler(CrtpPort::LinkCtrl.into(), Arc::new(move |msg: &CrtpMessage| {
                received.lock().push(msg.clone());
            }));
        }

        pump.start().await.unwrap();
        pump.send(CrtpMessage::new(CrtpPort::LinkCtrl, 1, vec![0]));
        sleep(Duration::from_millis(200)).await;
        pump.stop().await.unwrap();

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].channel(), 1);
        assert!(received[0].payload().starts_with(b"Bitcraze Crazyflie"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_expecting_answer_resends_until_answered() {
        let copter = Arc::new(SimulatedCrazyflie::new(4).ignoring_first_requests(2));
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));
        pump.start().await.unwrap();

        let request = CrtpMessage::new(CrtpPort::Platform, 1, vec![0]);
        pump.send_expecting_prefix(request, Bytes::from_static(&[0]));
        sleep(Duration::from_millis(2000)).await;
        pump.stop().await.unwrap();

        assert_eq!(copter.num_requests_on(CrtpPort::Platform, 1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_fatal_but_keeps_going() {
        let copter = Arc::new(SimulatedCrazyflie::new(4).without_safelink());
        let mut config = LinkConfig::new();
        config.retry_budget = 3;
        let pump = MessagePump::new(copter.clone(), Arc::new(config));
        let mut events = pump.subscribe_link_events();

        pump.start().await.unwrap();
        copter.set_acknowledging(false);
        sleep(Duration::from_millis(20)).await;

        let mut num_fatal = 0;
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::LinkError(LinkErrorData { fatal: true, .. }) = event {
                num_fatal += 1;
            }
        }
        assert!(num_fatal >= 2);

        copter.set_acknowledging(true);
        pump.send(CrtpMessage::new(CrtpPort::Console, 0, vec![9]));
        sleep(Duration::from_millis(20)).await;
        pump.stop().await.unwrap();
        assert_eq!(copter.num_requests_on(CrtpPort::Console, 0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retries_same_message() {
        let copter = Arc::new(SimulatedCrazyflie::new(4).without_safelink());
        let pump = MessagePump::new(copter.clone(), Arc::new(LinkConfig::new()));
        let mut events = pump.subscribe_link_events();
        pump.start().await.unwrap();

        copter.fail_next_transmits(3);
        pump.send(CrtpMessage::new(CrtpPort::Console, 0, vec![5]));
        sleep(Duration::from_millis(100)).await;
        pump.stop().await.unwrap();

        assert_eq!(copter.num_requests_on(CrtpPort::Console, 0), 1);
        let mut num_non_fatal = 0;
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::LinkError(LinkErrorData { fatal: false, .. }) = event {
                num_non_fatal += 1;
            }
        }
        assert_eq!(num_non_fatal, 3);
    }
}
