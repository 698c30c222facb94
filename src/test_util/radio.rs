use std::collections::VecDeque;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::Mutex;

use crate::crtp::crtp_message::{CrtpMessage, CrtpPort};
use crate::crtp::safelink::SAFELINK_ENABLE_REQUEST;
use crate::param::parameter_synchronizer::{READ_CHANNEL, WRITE_CHANNEL};
use crate::radio::{RadioChannel, RadioLink, RadioSettings};
use crate::toc::toc::TocKind;
use crate::toc::toc_fetcher::{CMD_TOC_ELEMENT, CMD_TOC_INFO, CMD_TOC_INFO_V2, CMD_TOC_ITEM_V2, TOC_CHANNEL};
use crate::toc::toc_types::{LogVarType, ParamVarType, TocValue, ValueType};
use crate::util::buf_ext::{BufExt, BufMutExt};


const EXCHANGE_DURATION: Duration = Duration::from_millis(1);

const STATUS_ACK: u8 = 0x01;
const STATUS_NACK_MAX_RETRIES: u8 = 0xa0;

struct SimVar {
    group: String,
    name: String,
    type_byte: u8,
    value_type: ValueType,
    value: Option<TocValue>,
}

struct SimState {
    protocol_version: u8,
    safelink: bool,
    open: bool,
    settings: RadioSettings,
    acknowledging: bool,
    failures_left: u32,
    requests_to_ignore: u32,
    continuous_wave: bool,

    log_vars: Vec<SimVar>,
    params: Vec<SimVar>,

    downlink: VecDeque<CrtpMessage>,
    uplink_headers: Vec<u8>,
    requests: Vec<CrtpMessage>,
}

/// A radio with a simulated Crazyflie behind it. It implements enough of the firmware's
///  protocols for end-to-end tests: safelink, the platform / protocol version queries, both
///  TOCs, and reading and writing parameters.
///
/// Every exchange takes a millisecond, so tests with paused time can advance through it.
pub struct SimulatedCrazyflie {
    state: Mutex<SimState>,
}

impl SimulatedCrazyflie {
    pub fn new(protocol_version: u8) -> SimulatedCrazyflie {
        let settings = RadioSettings {
            channel: RadioChannel::new(80).ok(),
            ..Default::default()
        };

        SimulatedCrazyflie {
            state: Mutex::new(SimState {
                protocol_version,
                safelink: true,
                open: true,
                settings,
                acknowledging: true,
                failures_left: 0,
                requests_to_ignore: 0,
                continuous_wave: false,
                log_vars: Vec::new(),
                params: Vec::new(),
                downlink: VecDeque::new(),
                uplink_headers: Vec::new(),
                requests: Vec::new(),
            }),
        }
    }

    pub fn without_safelink(self) -> Self {
        self.state.lock().safelink = false;
        self
    }

    /// a radio that still needs to be opened
    pub fn closed(self) -> Self {
        self.state.lock().open = false;
        self
    }

    /// acknowledges but does not answer the first `n` requests
    pub fn ignoring_first_requests(self, n: u32) -> Self {
        self.state.lock().requests_to_ignore = n;
        self
    }

    pub fn with_log_var(self, group: &str, name: &str, var_type: LogVarType) -> Self {
        self.state.lock().log_vars.push(SimVar {
            group: group.to_string(),
            name: name.to_string(),
            type_byte: var_type.into(),
            value_type: var_type.value_type(),
            value: None,
        });
        self
    }

    pub fn with_param(self, group: &str, name: &str, var_type: ParamVarType, read_only: bool, value: TocValue) -> Self {
        let type_code: u8 = var_type.into();
        self.state.lock().params.push(SimVar {
            group: group.to_string(),
            name: name.to_string(),
            type_byte: if read_only { type_code | ParamVarType::READ_ONLY_FLAG } else { type_code },
            value_type: var_type.value_type(),
            value: Some(value),
        });
        self
    }

    pub fn set_acknowledging(&self, acknowledging: bool) {
        self.state.lock().acknowledging = acknowledging;
    }

    pub fn fail_next_transmits(&self, n: u32) {
        self.state.lock().failures_left = n;
    }

    /// headers of all acknowledged packets, including keep-alives, in the order they arrived
    pub fn uplink_headers(&self) -> Vec<u8> {
        self.state.lock().uplink_headers.clone()
    }

    pub fn num_requests_on(&self, port: CrtpPort, channel: u8) -> usize {
        self.state.lock().requests.iter()
            .filter(|m| m.is_on(port, channel))
            .count()
    }

    pub fn num_toc_element_requests(&self, kind: TocKind) -> usize {
        self.state.lock().requests.iter()
            .filter(|m| m.is_on(kind.port(), TOC_CHANNEL))
            .filter(|m| matches!(m.payload().first(), Some(&CMD_TOC_ELEMENT) | Some(&CMD_TOC_ITEM_V2)))
            .count()
    }

    pub fn param_value(&self, full_name: &str) -> Option<TocValue> {
        self.state.lock().params.iter()
            .find(|p| format!("{}.{}", p.group, p.name) == full_name)
            .and_then(|p| p.value)
    }

    pub fn is_continuous_wave(&self) -> bool {
        self.state.lock().continuous_wave
    }

    /// the CRC the simulated firmware reports for a TOC
    pub fn toc_crc(&self, kind: TocKind) -> u32 {
        self.state.lock().toc_crc(kind)
    }
}

impl SimState {
    fn use_v2(&self) -> bool {
        self.protocol_version >= 4
    }

    fn toc(&self, kind: TocKind) -> &[SimVar] {
        match kind {
            TocKind::Log => &self.log_vars,
            TocKind::Param => &self.params,
        }
    }

    fn toc_crc(&self, kind: TocKind) -> u32 {
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let mut digest = crc.digest();
        for var in self.toc(kind) {
            digest.update(var.group.as_bytes());
            digest.update(var.name.as_bytes());
            digest.update(&[var.type_byte]);
        }
        digest.finalize()
    }

    fn handle(&mut self, request: &CrtpMessage) -> Option<CrtpMessage> {
        let port = request.known_port()?;
        let channel = request.channel();
        let payload = request.payload();

        match (port, channel) {
            (CrtpPort::LinkCtrl, 1) if payload.first() == Some(&0) => {
                Some(CrtpMessage::new(CrtpPort::LinkCtrl, 1, &b"Bitcraze Crazyflie"[..]))
            }
            (CrtpPort::Platform, 1) if payload.first() == Some(&0) => {
                Some(CrtpMessage::new(CrtpPort::Platform, 1, vec![0, self.protocol_version]))
            }
            (CrtpPort::Platform, 0) if payload.first() == Some(&0) => {
                self.continuous_wave = payload.get(1).copied().unwrap_or(0) != 0;
                None
            }
            (CrtpPort::Logging, TOC_CHANNEL) => self.handle_toc(TocKind::Log, request),
            (CrtpPort::Param, TOC_CHANNEL) => self.handle_toc(TocKind::Param, request),
            (CrtpPort::Param, READ_CHANNEL) => self.handle_param_read(request),
            (CrtpPort::Param, WRITE_CHANNEL) => self.handle_param_write(request),
            _ => None,
        }
    }

    fn handle_toc(&self, kind: TocKind, request: &CrtpMessage) -> Option<CrtpMessage> {
        let mut buf = request.payload().clone();
        let cmd = buf.try_read_u8().ok()?;
        let toc = self.toc(kind);

        let mut reply = BytesMut::new();
        reply.put_u8(cmd);
        match cmd {
            CMD_TOC_INFO => {
                reply.put_u8(toc.len() as u8);
                reply.put_u32_le(self.toc_crc(kind));
            }
            CMD_TOC_INFO_V2 => {
                reply.put_u16_le(toc.len() as u16);
                reply.put_u32_le(self.toc_crc(kind));
            }
            CMD_TOC_ELEMENT | CMD_TOC_ITEM_V2 => {
                let wide = cmd == CMD_TOC_ITEM_V2;
                let idx = buf.try_read_id(wide).ok()?;
                let var = toc.get(idx as usize)?;
                reply.put_id(idx, wide);
                reply.put_u8(var.type_byte);
                reply.put_slice(var.group.as_bytes());
                reply.put_u8(0);
                reply.put_slice(var.name.as_bytes());
                reply.put_u8(0);
            }
            _ => return None,
        }
        Some(CrtpMessage::new(kind.port(), TOC_CHANNEL, reply.freeze()))
    }

    fn handle_param_read(&self, request: &CrtpMessage) -> Option<CrtpMessage> {
        let wide = self.use_v2();
        let mut buf = request.payload().clone();
        let id = buf.try_read_id(wide).ok()?;
        let value = self.params.get(id as usize)?.value?;

        let mut reply = BytesMut::new();
        reply.put_id(id, wide);
        if wide {
            reply.put_u8(0);
        }
        value.encode(&mut reply);
        Some(CrtpMessage::new(CrtpPort::Param, READ_CHANNEL, reply.freeze()))
    }

    fn handle_param_write(&mut self, request: &CrtpMessage) -> Option<CrtpMessage> {
        let wide = self.use_v2();
        let mut buf = request.payload().clone();
        let id = buf.try_read_id(wide).ok()?;
        let param = self.params.get_mut(id as usize)?;
        if param.type_byte & ParamVarType::READ_ONLY_FLAG != 0 {
            return None;
        }
        param.value = Some(param.value_type.decode(&mut buf).ok()?);

        Some(CrtpMessage::new(CrtpPort::Param, WRITE_CHANNEL, request.payload().clone()))
    }
}

#[async_trait]
impl RadioLink for SimulatedCrazyflie {
    async fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn open(&self) -> anyhow::Result<()> {
        self.state.lock().open = true;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.lock().open = false;
        Ok(())
    }

    async fn settings(&self) -> RadioSettings {
        self.state.lock().settings.clone()
    }

    async fn configure(&self, settings: RadioSettings) -> anyhow::Result<()> {
        self.state.lock().settings = settings;
        Ok(())
    }

    async fn transmit(&self, packet: Bytes) -> anyhow::Result<Bytes> {
        tokio::time::sleep(EXCHANGE_DURATION).await;

        let mut state = self.state.lock();
        if !state.open {
            bail!("radio is closed");
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            bail!("simulated USB error");
        }
        if packet.as_ref() == SAFELINK_ENABLE_REQUEST {
            let mut response = BytesMut::new();
            response.put_u8(STATUS_ACK);
            if state.safelink {
                response.put_slice(&SAFELINK_ENABLE_REQUEST);
            }
            return Ok(response.freeze());
        }
        if !state.acknowledging {
            return Ok(Bytes::from_static(&[STATUS_NACK_MAX_RETRIES]));
        }

        let mut raw = packet;
        if raw.has_remaining() {
            let request = CrtpMessage::from_header(raw.get_u8(), raw);
            state.uplink_headers.push(request.header());

            if !request.is_null_packet() {
                state.requests.push(request.clone());
                if state.requests_to_ignore > 0 {
                    state.requests_to_ignore -= 1;
                }
                else if let Some(reply) = state.handle(&request) {
                    state.downlink.push_back(reply);
                }
            }
        }

        let mut response = BytesMut::new();
        response.put_u8(STATUS_ACK);
        if let Some(reply) = state.downlink.pop_front() {
            response.put_slice(&reply.to_packet());
        }
        Ok(response.freeze())
    }
}
