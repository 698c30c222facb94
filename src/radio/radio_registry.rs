use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use tracing::debug;

use crate::radio::RadioLink;


struct RadioSlot {
    radio: Arc<dyn RadioLink>,
    leased: bool,
}

/// The radios available to this process. Each radio can be leased by at most one session at a
///  time; dropping the [RadioLease] makes it available again.
#[derive(Clone)]
pub struct RadioRegistry {
    slots: Arc<Mutex<Vec<RadioSlot>>>,
}
impl RadioRegistry {
    pub fn new(radios: Vec<Arc<dyn RadioLink>>) -> RadioRegistry {
        RadioRegistry {
            slots: Arc::new(Mutex::new(radios.into_iter()
                .map(|radio| RadioSlot { radio, leased: false })
                .collect()
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn acquire(&self, index: usize) -> anyhow::Result<RadioLease> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(index) else {
            bail!("there is no radio #{}", index);
        };
        if slot.leased {
            bail!("radio #{} is already in use", index);
        }

        slot.leased = true;
        debug!(index, "leased radio");
        Ok(RadioLease {
            index,
            radio: slot.radio.clone(),
            slots: self.slots.clone(),
        })
    }

    /// leases the first radio that is not currently in use
    pub fn acquire_first(&self) -> anyhow::Result<RadioLease> {
        let index = self.slots.lock().iter()
            .position(|slot| !slot.leased)
            .ok_or_else(|| anyhow!("no radio available"))?;
        self.acquire(index)
    }
}


pub struct RadioLease {
    index: usize,
    radio: Arc<dyn RadioLink>,
    slots: Arc<Mutex<Vec<RadioSlot>>>,
}
impl RadioLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn radio(&self) -> Arc<dyn RadioLink> {
        self.radio.clone()
    }
}
impl Debug for RadioLease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RadioLease{{#{}}}", self.index)
    }
}
impl Drop for RadioLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slots.lock().get_mut(self.index) {
            slot.leased = false;
        }
        debug!(index = self.index, "released radio");
    }
}

#[cfg(test)]
mod tests {
    use crate::radio::MockRadioLink;
    use super::*;

    fn registry(num_radios: usize) -> RadioRegistry {
        RadioRegistry::new((0..num_radios)
            .map(|_| Arc::new(MockRadioLink::new()) as Arc<dyn RadioLink>)
            .collect())
    }

    #[test]
    fn test_lease_is_exclusive() {
        let registry = registry(2);
        let lease = registry.acquire(1).unwrap();
        assert_eq!(lease.index(), 1);
        assert!(registry.acquire(1).is_err());
        assert_eq!(registry.acquire_first().unwrap().index(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let registry = registry(1);
        let lease = registry.acquire_first().unwrap();
        assert!(registry.acquire_first().is_err());

        drop(lease);
        assert_eq!(registry.acquire_first().unwrap().index(), 0);
    }

    #[test]
    fn test_acquire_out_of_range() {
        assert!(registry(1).acquire(1).is_err());
        assert!(registry(0).acquire_first().is_err());
    }
}
