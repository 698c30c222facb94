use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::crtp::communicator::{CrtpSender, MessageMatcher};
use crate::crtp::crtp_message::CrtpMessage;


struct PendingRequest {
    id: u64,
    message: CrtpMessage,
    matcher: MessageMatcher,
    resend_handle: JoinHandle<()>,
}


/// At-least-once delivery on top of fire-and-forget sending: a registered message is re-sent
///  periodically until some received message satisfies its matcher.
///
/// Every received message must be passed to [ReliableRequest::on_message_received], typically
///  through an all-ports handler.
pub struct ReliableRequest {
    sender: Arc<dyn CrtpSender>,
    pending: Arc<Mutex<Vec<PendingRequest>>>,
    next_id: AtomicU64,
}

impl Drop for ReliableRequest {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl ReliableRequest {
    pub fn new(sender: Arc<dyn CrtpSender>) -> ReliableRequest {
        ReliableRequest {
            sender,
            pending: Default::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers the expectation and starts its resend timer. This does *not* send the message
    ///  for the first time, that is the caller's job.
    pub fn register_expectation(&self, message: CrtpMessage, matcher: MessageMatcher, resend_interval: Duration) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(id, ?message, ?resend_interval, "registering expectation");

        let resend_handle = tokio::spawn(Self::resend_loop(
            id,
            Arc::downgrade(&self.pending),
            self.sender.clone(),
            resend_interval,
        ));

        self.pending.lock().push(PendingRequest {
            id,
            message,
            matcher,
            resend_handle,
        });
    }

    async fn resend_loop(id: u64, pending: Weak<Mutex<Vec<PendingRequest>>>, sender: Arc<dyn CrtpSender>, resend_interval: Duration) {
        let mut ticks = interval_at(Instant::now() + resend_interval, resend_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            let Some(pending) = pending.upgrade() else {
                return;
            };
            let message = pending.lock().iter()
                .find(|p| p.id == id)
                .map(|p| p.message.clone());

            match message {
                Some(message) => {
                    debug!(id, ?message, "no answer yet - re-sending");
                    sender.send(message);
                }
                None => return,
            }
        }
    }

    /// Checks a received message against the pending expectations. The first matching
    ///  expectation is resolved and its timer cancelled; returns `true` if there was a match.
    pub fn on_message_received(&self, message: &CrtpMessage) -> bool {
        let resolved = {
            let mut pending = self.pending.lock();
            match pending.iter().position(|p| (p.matcher)(message)) {
                Some(idx) => Some(pending.remove(idx)),
                None => None,
            }
        };

        match resolved {
            Some(request) => {
                trace!(id = request.id, ?message, "expectation resolved");
                request.resend_handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn cancel_all(&self) {
        for request in self.pending.lock().drain(..) {
            request.resend_handle.abort();
        }
    }
}
