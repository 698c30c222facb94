use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::crtp::crtp_message::CrtpMessage;


pub type MessageHandler = Arc<dyn Fn(&CrtpMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct HandlerId(u64);


#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_port: FxHashMap<u8, Vec<(HandlerId, MessageHandler)>>,
    all_ports: Vec<(HandlerId, MessageHandler)>,
}
impl Handlers {
    fn new_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

/// Distributes received messages to the handlers registered for their port. Handlers are called
///  on the dispatching task, without any lock held, so they may register / remove handlers or
///  send messages themselves.
#[derive(Default)]
pub struct EventRegistry {
    handlers: Mutex<Handlers>,
}
impl EventRegistry {
    pub fn new() -> EventRegistry {
        Default::default()
    }

    pub fn register_handler(&self, port: impl Into<u8>, handler: MessageHandler) -> HandlerId {
        let port = port.into();
        let mut handlers = self.handlers.lock();
        let id = handlers.new_id();
        handlers.by_port.entry(port)
            .or_default()
            .push((id, handler));
        trace!(port, ?id, "registered handler");
        id
    }

    pub fn register_all_ports_handler(&self, handler: MessageHandler) -> HandlerId {
        let mut handlers = self.handlers.lock();
        let id = handlers.new_id();
        handlers.all_ports.push((id, handler));
        trace!(?id, "registered all-ports handler");
        id
    }

    /// returns `false` if there was no such handler
    pub fn remove_handler(&self, port: impl Into<u8>, id: HandlerId) -> bool {
        let port = port.into();
        let mut handlers = self.handlers.lock();
        let Some(for_port) = handlers.by_port.get_mut(&port) else {
            return false;
        };

        let len_before = for_port.len();
        for_port.retain(|(h, _)| *h != id);
        let removed = for_port.len() != len_before;
        if for_port.is_empty() {
            handlers.by_port.remove(&port);
        }
        removed
    }

    pub fn remove_all_ports_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let len_before = handlers.all_ports.len();
        handlers.all_ports.retain(|(h, _)| *h != id);
        handlers.all_ports.len() != len_before
    }

    pub fn notify(&self, message: &CrtpMessage) {
        let snapshot = {
            let handlers = self.handlers.lock();
            let mut snapshot = handlers.all_ports.iter()
                .map(|(_, h)| h.clone())
                .collect::<Vec<_>>();
            if let Some(for_port) = handlers.by_port.get(&message.port()) {
                snapshot.extend(for_port.iter().map(|(_, h)| h.clone()));
            }
            snapshot
        };

        trace!(?message, num_handlers = snapshot.len(), "dispatching");
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(?message, "message handler panicked - skipping it");
            }
        }
    }
}
