use std::sync::Arc;

use anyhow::bail;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::crtp::link_events::LinkEvent;
use crate::crtp::message_pump::MessagePump;
use crate::param::param_configurator::ParamConfigurator;
use crate::param::parameter_synchronizer::ParameterSynchronizer;
use crate::platform::platform_service::PlatformService;
use crate::radio::radio_registry::RadioLease;
use crate::toc::toc::TocKind;
use crate::toc::toc_cache::{FileTocStore, NoTocStore, TocCache, TocCacheStore};
use crate::toc::toc_container::TocContainer;


/// A connection to a single Crazyflie over a leased radio. The session owns the message pump
///  and everything that talks through it; the radio lease is released when the session is
///  disconnected or dropped.
///
/// Dropping a session without disconnecting it aborts all radio traffic before the lease is
///  released, but it leaves the radio open.
pub struct Crazyflie {
    lease: RadioLease,
    pump: Arc<MessagePump>,
    platform: Arc<PlatformService>,
    log_toc: Arc<TocContainer>,
    param_toc: Arc<TocContainer>,
    synchronizer: Arc<ParameterSynchronizer>,
    params: Arc<ParamConfigurator>,
}

impl Drop for Crazyflie {
    fn drop(&mut self) {
        self.synchronizer.abort_processing();
        self.pump.abort();
    }
}

impl Crazyflie {
    pub async fn connect(lease: RadioLease, config: LinkConfig) -> anyhow::Result<Crazyflie> {
        config.validate()?;
        let config = Arc::new(config);

        let radio = lease.radio();
        if !radio.is_open().await {
            radio.open().await?;
        }
        let pump = match Self::start_pump(&lease, &config).await {
            Ok(pump) => pump,
            Err(e) => {
                warn!("connecting failed: {}", e);
                if let Err(close_err) = radio.close().await {
                    warn!("error closing radio after failed connect: {}", close_err);
                }
                return Err(e);
            }
        };

        let platform = Arc::new(PlatformService::new(pump.clone(), config.protocol_probe_timeout));
        let log_toc = Arc::new(TocContainer::new(TocKind::Log, pump.clone(), Self::toc_cache(TocKind::Log, &config), config.toc_fetch_timeout));
        let param_toc = Arc::new(TocContainer::new(TocKind::Param, pump.clone(), Self::toc_cache(TocKind::Param, &config), config.toc_fetch_timeout));
        let synchronizer = Arc::new(ParameterSynchronizer::new(pump.clone(), config.param_stop_timeout));
        let params = Arc::new(ParamConfigurator::new(param_toc.clone(), synchronizer.clone(), config.param_request_timeout));

        let session = Crazyflie {
            lease,
            pump,
            platform,
            log_toc,
            param_toc,
            synchronizer,
            params,
        };

        match session.initialize().await {
            Ok(()) => {
                info!(radio = session.lease.index(), "connected");
                Ok(session)
            }
            Err(e) => {
                warn!("connecting failed: {}", e);
                if let Err(shutdown_err) = session.shutdown().await {
                    warn!("error cleaning up after failed connect: {}", shutdown_err);
                }
                Err(e)
            }
        }
    }

    async fn start_pump(lease: &RadioLease, config: &Arc<LinkConfig>) -> anyhow::Result<Arc<MessagePump>> {
        let radio = lease.radio();
        let Some(channel) = radio.settings().await.channel else {
            bail!("cannot connect via radio #{}: no radio channel selected", lease.index());
        };
        info!(radio = lease.index(), ?channel, "connecting");

        let pump = Arc::new(MessagePump::new(radio, config.clone()));
        pump.start().await?;
        Ok(pump)
    }

    fn toc_cache(kind: TocKind, config: &LinkConfig) -> Arc<TocCache> {
        let store: Box<dyn TocCacheStore> = match &config.toc_cache_dir {
            Some(dir) => Box::new(FileTocStore::new(kind, dir.clone())),
            None => Box::new(NoTocStore),
        };
        Arc::new(TocCache::new(store))
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.platform.fetch_protocol_version().await;
        let use_v2 = self.platform.use_v2_protocol();
        self.log_toc.set_use_v2(use_v2);
        self.param_toc.set_use_v2(use_v2);
        self.synchronizer.set_use_v2(use_v2);

        tokio::try_join!(
            self.params.refresh_toc(),
            self.log_toc.refresh_toc(),
        )?;

        self.synchronizer.start_processing().await
    }

    pub async fn disconnect(self) -> anyhow::Result<()> {
        info!(radio = self.lease.index(), "disconnecting");
        self.shutdown().await
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        // fails if connecting did not get as far as starting the synchronizer
        let _ = self.synchronizer.stop_processing().await;
        let pump_result = self.pump.stop().await;
        self.lease.radio().close().await?;
        pump_result
    }

    pub fn params(&self) -> &ParamConfigurator {
        &self.params
    }

    pub fn log_toc(&self) -> &TocContainer {
        &self.log_toc
    }

    pub fn platform(&self) -> &PlatformService {
        &self.platform
    }

    pub fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.pump.subscribe_link_events()
    }
}
