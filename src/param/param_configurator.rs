use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::param::parameter_synchronizer::{ParamEvent, ParameterSynchronizer};
use crate::toc::toc::{Toc, TocEntry};
use crate::toc::toc_container::TocContainer;
use crate::toc::toc_types::TocValue;


/// Name-based access to the copter's parameters, with a local copy of the values that were
///  read or written most recently
pub struct ParamConfigurator {
    container: Arc<TocContainer>,
    synchronizer: Arc<ParameterSynchronizer>,
    request_timeout: Duration,
    loaded_values: Mutex<FxHashMap<u16, TocValue>>,
}

impl ParamConfigurator {
    pub fn new(container: Arc<TocContainer>, synchronizer: Arc<ParameterSynchronizer>, request_timeout: Duration) -> ParamConfigurator {
        ParamConfigurator {
            container,
            synchronizer,
            request_timeout,
            loaded_values: Default::default(),
        }
    }

    pub fn current_toc(&self) -> Option<Arc<Toc>> {
        self.container.current_toc()
    }

    pub async fn refresh_toc(&self) -> anyhow::Result<Arc<Toc>> {
        let toc = self.container.refresh_toc().await?;
        self.loaded_values.lock().clear();
        Ok(toc)
    }

    fn entry(&self, full_name: &str) -> anyhow::Result<(Arc<Toc>, TocEntry)> {
        let Some((group, name)) = full_name.split_once('.') else {
            bail!("parameter names have the form 'group.name', was {:?}", full_name);
        };
        if group.is_empty() || name.is_empty() || name.contains('.') {
            bail!("parameter names have the form 'group.name', was {:?}", full_name);
        }

        let toc = self.container.current_toc()
            .ok_or_else(|| anyhow!("the parameter TOC was not loaded"))?;
        let entry = toc.find(full_name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown parameter {:?}", full_name))?;
        Ok((toc, entry))
    }

    /// the most recently read or written value, without talking to the copter
    pub fn get_loaded_value(&self, full_name: &str) -> anyhow::Result<Option<TocValue>> {
        let (_, entry) = self.entry(full_name)?;
        Ok(self.loaded_values.lock().get(&entry.id).copied())
    }

    /// reads a parameter's current value from the copter
    pub async fn refresh_parameter_value(&self, full_name: &str) -> anyhow::Result<TocValue> {
        let (_, entry) = self.entry(full_name)?;
        let mut events = self.synchronizer.subscribe();
        self.synchronizer.request_read(entry.id);

        let received = timeout(self.request_timeout, async {
            loop {
                if let ParamEvent::ParameterReceived { id, value } = next_event(&mut events).await? {
                    if id == entry.id {
                        return Ok::<_, anyhow::Error>(value);
                    }
                }
            }
        }).await
            .map_err(|_| anyhow!("timeout reading parameter {:?}", full_name))??;

        self.store_received(&entry, received)
    }

    pub async fn set_value(&self, full_name: &str, value: TocValue) -> anyhow::Result<()> {
        let (_, entry) = self.entry(full_name)?;
        if entry.is_read_only() {
            bail!("parameter {:?} is read-only", full_name);
        }
        if value.value_type() != entry.value_type {
            bail!("parameter {:?} has type {:?}, value {} is {:?}", full_name, entry.value_type, value, value.value_type());
        }

        let mut events = self.synchronizer.subscribe();
        self.synchronizer.request_write(entry.id, value.to_bytes());

        timeout(self.request_timeout, async {
            loop {
                if let ParamEvent::ParameterStored { id } = next_event(&mut events).await? {
                    if id == entry.id {
                        return Ok::<_, anyhow::Error>(());
                    }
                }
            }
        }).await
            .map_err(|_| anyhow!("timeout writing parameter {:?}", full_name))??;

        debug!(full_name, %value, "parameter stored");
        self.loaded_values.lock().insert(entry.id, value);
        Ok(())
    }

    /// Reads the values of all parameters in the TOC. This resolves when every value was
    ///  received, or fails when the copter stops answering for the configured request timeout.
    pub async fn update_all_params(&self) -> anyhow::Result<()> {
        let toc = self.container.current_toc()
            .ok_or_else(|| anyhow!("the parameter TOC was not loaded"))?;

        let mut events = self.synchronizer.subscribe();
        let mut outstanding = FxHashSet::default();
        for entry in toc.entries() {
            outstanding.insert(entry.id);
            self.synchronizer.request_read(entry.id);
        }

        while !outstanding.is_empty() {
            let event = timeout(self.request_timeout, next_event(&mut events)).await
                .map_err(|_| anyhow!("timeout reading parameters, {} values missing", outstanding.len()))??;

            if let ParamEvent::ParameterReceived { id, value } = event {
                if !outstanding.remove(&id) {
                    continue;
                }
                match toc.get(id) {
                    Some(entry) => { self.store_received(entry, value)?; }
                    None => warn!(id, "received value for a parameter that is not in the TOC"),
                }
            }
        }
        Ok(())
    }

    fn store_received(&self, entry: &TocEntry, value: Bytes) -> anyhow::Result<TocValue> {
        let mut buf = value;
        let value = entry.value_type.decode(&mut buf)
            .map_err(|e| anyhow!("malformed value for parameter {}: {}", entry.full_name(), e))?;
        self.loaded_values.lock().insert(entry.id, value);
        Ok(value)
    }
}

async fn next_event(events: &mut broadcast::Receiver<ParamEvent>) -> anyhow::Result<ParamEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(RecvError::Lagged(n)) => warn!("missed {} parameter events", n),
            Err(RecvError::Closed) => bail!("parameter event channel closed"),
        }
    }
}
