use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::crtp::communicator::{CrtpCommunicator, CrtpSender, MessageMatcher};
use crate::crtp::crtp_message::CrtpMessage;
use crate::crtp::event_registry::{EventRegistry, HandlerId, MessageHandler};
use crate::crtp::reliable_request::ReliableRequest;


/// Records every message 'sent' through it, in order
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<CrtpMessage>>,
}
impl RecordingSender {
    pub fn new() -> RecordingSender {
        Default::default()
    }

    pub fn sent(&self) -> Vec<CrtpMessage> {
        self.sent.lock().clone()
    }
}
impl CrtpSender for RecordingSender {
    fn send(&self, message: CrtpMessage) {
        self.sent.lock().push(message);
    }
}


/// A [CrtpCommunicator] without a radio: sent messages (including re-sends) are recorded, and
///  tests inject received messages through [RecordingCommunicator::deliver]. Handler dispatch
///  and at-least-once semantics work the same as in the real message pump.
pub struct RecordingCommunicator {
    sender: Arc<RecordingSender>,
    registry: EventRegistry,
    reliable: Arc<ReliableRequest>,
    num_port_handlers: AtomicUsize,
    resend_interval: Duration,
}
impl Default for RecordingCommunicator {
    fn default() -> Self {
        RecordingCommunicator::new()
    }
}
impl RecordingCommunicator {
    pub fn new() -> RecordingCommunicator {
        Self::with_resend_interval(Duration::from_millis(250))
    }

    pub fn with_resend_interval(resend_interval: Duration) -> RecordingCommunicator {
        let sender = Arc::new(RecordingSender::new());
        let reliable = Arc::new(ReliableRequest::new(sender.clone()));

        let registry = EventRegistry::new();
        {
            let reliable = reliable.clone();
            registry.register_all_ports_handler(Arc::new(move |msg: &CrtpMessage| {
                reliable.on_message_received(msg);
            }));
        }

        RecordingCommunicator {
            sender,
            registry,
            reliable,
            num_port_handlers: AtomicUsize::new(0),
            resend_interval,
        }
    }

    pub fn sent(&self) -> Vec<CrtpMessage> {
        self.sender.sent()
    }

    /// simulates the arrival of a message from the copter
    pub fn deliver(&self, message: &CrtpMessage) {
        self.registry.notify(message);
    }

    pub fn num_handlers(&self) -> usize {
        self.num_port_handlers.load(Ordering::Acquire)
    }

    pub fn num_pending_expectations(&self) -> usize {
        self.reliable.num_pending()
    }
}

impl CrtpSender for RecordingCommunicator {
    fn send(&self, message: CrtpMessage) {
        self.sender.send(message);
    }
}

impl CrtpCommunicator for RecordingCommunicator {
    fn send_expecting_answer(&self, message: CrtpMessage, matcher: MessageMatcher, resend_interval: Duration) {
        self.reliable.register_expectation(message.clone(), matcher, resend_interval);
        self.sender.send(message);
    }

    fn default_resend_interval(&self) -> Duration {
        self.resend_interval
    }

    fn register_handler(&self, port: u8, handler: MessageHandler) -> HandlerId {
        self.num_port_handlers.fetch_add(1, Ordering::AcqRel);
        self.registry.register_handler(port, handler)
    }

    fn register_all_ports_handler(&self, handler: MessageHandler) -> HandlerId {
        self.registry.register_all_ports_handler(handler)
    }

    fn remove_handler(&self, port: u8, id: HandlerId) -> bool {
        let removed = self.registry.remove_handler(port, id);
        if removed {
            self.num_port_handlers.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn remove_all_ports_handler(&self, id: HandlerId) -> bool {
        self.registry.remove_all_ports_handler(id)
    }
}
