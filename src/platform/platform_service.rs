use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::crtp::communicator::{prefix_matcher, CrtpCommunicator};
use crate::crtp::crtp_message::{CrtpMessage, CrtpPort};


const LINKCTRL_CHANNEL: u8 = 1;
const PLATFORM_COMMAND_CHANNEL: u8 = 0;
const PLATFORM_VERSION_CHANNEL: u8 = 1;

const CMD_GET_PROTOCOL_VERSION: u8 = 0;
const CMD_SET_CONTINUOUS_WAVE: u8 = 0;

const CRAZYFLIE_GREETING: &[u8] = b"Bitcraze Crazyflie";

/// protocol version of firmware that uses 16 bit TOC indices and parameter ids
const V2_PROTOCOL_VERSION: i32 = 4;

pub const UNKNOWN_PROTOCOL_VERSION: i32 = -1;


/// Queries the copter's platform information. The protocol version determines which framing
///  the TOC and parameter protocols use.
pub struct PlatformService {
    comm: Arc<dyn CrtpCommunicator>,
    probe_timeout: Duration,
    protocol_version: AtomicI32,
}

impl PlatformService {
    pub fn new(comm: Arc<dyn CrtpCommunicator>, probe_timeout: Duration) -> PlatformService {
        PlatformService {
            comm,
            probe_timeout,
            protocol_version: AtomicI32::new(UNKNOWN_PROTOCOL_VERSION),
        }
    }

    /// the protocol version found by the last call to [PlatformService::fetch_protocol_version]
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub fn use_v2_protocol(&self) -> bool {
        self.protocol_version() >= V2_PROTOCOL_VERSION
    }

    /// Asks a Crazyflie for its protocol version. Copters that do not identify as Crazyflie,
    ///  and copters that do not answer in time, have an unknown version (-1).
    pub async fn fetch_protocol_version(&self) -> i32 {
        let (sender, receiver) = oneshot::channel::<i32>();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let complete = move |version: i32| {
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(version);
            }
        };

        let link_ctrl_handler = {
            let comm = self.comm.clone();
            let complete = complete.clone();
            self.comm.register_handler(CrtpPort::LinkCtrl.into(), Arc::new(move |msg: &CrtpMessage| {
                if msg.channel() != LINKCTRL_CHANNEL {
                    return;
                }
                if msg.payload().starts_with(CRAZYFLIE_GREETING) {
                    debug!("copter identifies as Crazyflie - querying protocol version");
                    let request = CrtpMessage::new(CrtpPort::Platform, PLATFORM_VERSION_CHANNEL, vec![CMD_GET_PROTOCOL_VERSION]);
                    comm.send_expecting_prefix(request, Bytes::from_static(&[CMD_GET_PROTOCOL_VERSION]));
                }
                else {
                    debug!(payload = ?msg.payload(), "copter is not a Crazyflie");
                    complete(UNKNOWN_PROTOCOL_VERSION);
                }
            }))
        };

        let platform_handler = {
            let complete = complete.clone();
            self.comm.register_handler(CrtpPort::Platform.into(), Arc::new(move |msg: &CrtpMessage| {
                if msg.channel() != PLATFORM_VERSION_CHANNEL {
                    return;
                }
                if let [CMD_GET_PROTOCOL_VERSION, version, ..] = &msg.payload()[..] {
                    complete(*version as i32);
                }
            }))
        };

        let request = CrtpMessage::new(CrtpPort::LinkCtrl, LINKCTRL_CHANNEL, vec![0]);
        let matcher = prefix_matcher(&request, Bytes::new());
        self.comm.send_expecting_answer(request, matcher, self.comm.default_resend_interval());

        let version = match timeout(self.probe_timeout, receiver).await {
            Ok(Ok(version)) => version,
            _ => {
                warn!("no protocol version received within {:?}", self.probe_timeout);
                UNKNOWN_PROTOCOL_VERSION
            }
        };

        self.comm.remove_handler(CrtpPort::LinkCtrl.into(), link_ctrl_handler);
        self.comm.remove_handler(CrtpPort::Platform.into(), platform_handler);

        info!(version, "protocol version");
        self.protocol_version.store(version, Ordering::Release);
        version
    }

    /// Puts the radio into a test mode that transmits a continuous carrier wave - this
    ///  interferes with other 2.4GHz devices, and the link is lost while it is active
    pub fn set_continuous_wave(&self, enabled: bool) {
        self.comm.send(CrtpMessage::new(CrtpPort::Platform, PLATFORM_COMMAND_CHANNEL, vec![CMD_SET_CONTINUOUS_WAVE, enabled as u8]));
    }
}
