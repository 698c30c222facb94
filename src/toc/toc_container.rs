use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::info;

use crate::crtp::communicator::CrtpCommunicator;
use crate::toc::toc::{Toc, TocKind};
use crate::toc::toc_cache::TocCache;
use crate::toc::toc_fetcher::TocFetcher;


/// Holds the current TOC of one kind and refreshes it on demand
pub struct TocContainer {
    kind: TocKind,
    comm: Arc<dyn CrtpCommunicator>,
    cache: Arc<TocCache>,
    fetch_timeout: Duration,
    use_v2: AtomicBool,
    current: Mutex<Option<Arc<Toc>>>,
}

impl TocContainer {
    pub fn new(kind: TocKind, comm: Arc<dyn CrtpCommunicator>, cache: Arc<TocCache>, fetch_timeout: Duration) -> TocContainer {
        TocContainer {
            kind,
            comm,
            cache,
            fetch_timeout,
            use_v2: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> TocKind {
        self.kind
    }

    pub fn set_use_v2(&self, use_v2: bool) {
        self.use_v2.store(use_v2, Ordering::Release);
    }

    pub fn current_toc(&self) -> Option<Arc<Toc>> {
        self.current.lock().clone()
    }

    pub async fn refresh_toc(&self) -> anyhow::Result<Arc<Toc>> {
        *self.current.lock() = None;

        let fetcher = TocFetcher::start(self.kind, self.use_v2.load(Ordering::Acquire), self.comm.clone(), self.cache.clone());
        let toc = timeout(self.fetch_timeout, fetcher.completion()).await
            .map_err(|_| anyhow!("timeout fetching {} TOC after {:?}", self.kind.name(), self.fetch_timeout))??;

        info!(?toc, "refreshed TOC");
        *self.current.lock() = Some(toc.clone());
        Ok(toc)
    }
}
