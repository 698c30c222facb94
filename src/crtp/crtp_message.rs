use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};


/// Well-known CRTP ports. The header has room for 16 ports, so a message's port is kept as a raw
///  number and only mapped to this enum where a component cares about a specific port.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CrtpPort {
    Console = 0x00,
    Param = 0x02,
    Commander = 0x03,
    Mem = 0x04,
    Logging = 0x05,
    Localization = 0x06,
    CommanderGeneric = 0x07,
    SetpointHl = 0x08,
    Platform = 0x0D,
    DebugDriver = 0x0E,
    LinkCtrl = 0x0F,
}

/// A CRTP packet: one header byte followed by the payload.
///
/// ```ascii
///  7  6  5  4  3  2  1  0
/// [  port    ][res.][ch.]
/// ```
///
/// The two reserved bits belong to the link layer. Messages created on this side set them to
///  `11`; safelink overwrites them with its toggle bits right before transmission.
#[derive(Clone, Eq, PartialEq)]
pub struct CrtpMessage {
    header: u8,
    payload: Bytes,
}

impl CrtpMessage {
    pub const RESERVED_BITS: u8 = 0x0C;

    pub fn new(port: impl Into<u8>, channel: u8, payload: impl Into<Bytes>) -> CrtpMessage {
        let port: u8 = port.into();
        CrtpMessage {
            header: ((port & 0x0f) << 4) | Self::RESERVED_BITS | (channel & 0x03),
            payload: payload.into(),
        }
    }

    pub fn from_header(header: u8, payload: impl Into<Bytes>) -> CrtpMessage {
        CrtpMessage {
            header,
            payload: payload.into(),
        }
    }

    /// The null packet sent whenever there is nothing queued: the link only delivers downlink
    ///  data as part of an exchange, so the pump keeps exchanging these to poll the copter.
    pub fn keep_alive() -> CrtpMessage {
        Self::from_header(0xff, Bytes::new())
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    pub fn port(&self) -> u8 {
        (self.header & 0xf0) >> 4
    }

    pub fn known_port(&self) -> Option<CrtpPort> {
        CrtpPort::try_from(self.port()).ok()
    }

    pub fn channel(&self) -> u8 {
        self.header & 0x03
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// the copter's counterpart to [CrtpMessage::keep_alive], carrying no data
    pub fn is_null_packet(&self) -> bool {
        self.header & 0xf3 == 0xf3 && self.payload.is_empty()
    }

    pub fn is_on(&self, port: impl Into<u8>, channel: u8) -> bool {
        self.port() == port.into() && self.channel() == channel
    }

    /// returns a copy with the header's link-control bits replaced
    pub fn with_link_bits(&self, link_bits: u8) -> CrtpMessage {
        CrtpMessage {
            header: (self.header & !Self::RESERVED_BITS) | ((link_bits << 2) & Self::RESERVED_BITS),
            payload: self.payload.clone(),
        }
    }

    pub fn to_packet(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

impl Debug for CrtpMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.known_port() {
            Some(port) => write!(f, "CrtpMessage{{{:?}/{} {:02x?}}}", port, self.channel(), self.payload.as_ref()),
            None => write!(f, "CrtpMessage{{port {}/{} {:02x?}}}", self.port(), self.channel(), self.payload.as_ref()),
        }
    }
}


/// The outcome of one exchange with the radio dongle, decoded from its status framing:
///
/// ```ascii
/// 0: status - bit 0: ack, bit 1: power detected, bits 4-7: retry count
/// 1: header of the received CRTP packet (if any)
/// *: payload of the received CRTP packet
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExchangeResult {
    pub ack: bool,
    pub power_detected: bool,
    pub retry_count: u8,
    pub received: Option<CrtpMessage>,
}

impl ExchangeResult {
    pub fn parse(raw: &[u8]) -> ExchangeResult {
        let status = raw.first().copied().unwrap_or(0);
        let received = raw.get(1).map(|&header| {
            CrtpMessage::from_header(header, Bytes::copy_from_slice(&raw[2..]))
        });

        ExchangeResult {
            ack: status & 0x01 != 0,
            power_detected: status & 0x02 != 0,
            retry_count: status >> 4,
            received,
        }
    }

    /// the received packet if it carries data, i.e. unless it is a null packet
    pub fn into_content(self) -> Option<CrtpMessage> {
        self.received
            .filter(|msg| !msg.is_null_packet())
    }
}
