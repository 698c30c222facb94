//! The radio dongle as seen by the transport: a half-duplex link where every transmission is
//!  also the only opportunity to receive data.

pub mod radio_registry;

use std::fmt::{Debug, Formatter};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};


#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct RadioChannel(u8);
impl RadioChannel {
    pub const MAX: u8 = 125;

    pub fn new(channel: u8) -> anyhow::Result<RadioChannel> {
        if channel > Self::MAX {
            bail!("radio channel {} is out of range (0 to {})", channel, Self::MAX);
        }
        Ok(RadioChannel(channel))
    }

    pub fn number(&self) -> u8 {
        self.0
    }
}
impl Debug for RadioChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DataRate {
    Rate250K = 0,
    Rate1M = 1,
    Rate2M = 2,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RadioSettings {
    pub channel: Option<RadioChannel>,
    pub data_rate: DataRate,
    pub address: [u8; 5],
}
impl Default for RadioSettings {
    fn default() -> Self {
        RadioSettings {
            channel: None,
            data_rate: DataRate::Rate2M,
            address: [0xe7; 5],
        }
    }
}


/// A radio dongle. Implementations wrapping blocking USB drivers are expected to move the
///  blocking calls to `tokio::task::spawn_blocking`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RadioLink: Send + Sync + 'static {
    async fn is_open(&self) -> bool;
    async fn open(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;

    async fn settings(&self) -> RadioSettings;
    async fn configure(&self, settings: RadioSettings) -> anyhow::Result<()>;

    /// Sends a single packet and returns the dongle's response: a status byte, followed by the
    ///  packet the copter sent back with its acknowledgement (if any)
    async fn transmit(&self, packet: Bytes) -> anyhow::Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_range() {
        assert_eq!(RadioChannel::new(0).unwrap().number(), 0);
        assert_eq!(RadioChannel::new(125).unwrap().number(), 125);
        assert!(RadioChannel::new(126).is_err());
    }
}
