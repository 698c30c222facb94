use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::crtp::crtp_message::CrtpMessage;
use crate::crtp::event_registry::{HandlerId, MessageHandler};


pub type MessageMatcher = Arc<dyn Fn(&CrtpMessage) -> bool + Send + Sync>;

/// The standard way of recognizing an answer: same port, same channel, and a payload starting
///  with the given prefix (typically a command byte and / or an id)
pub fn prefix_matcher(request: &CrtpMessage, prefix: impl Into<Bytes>) -> MessageMatcher {
    let port = request.port();
    let channel = request.channel();
    let prefix: Bytes = prefix.into();

    Arc::new(move |msg: &CrtpMessage| {
        msg.is_on(port, channel) && msg.payload().starts_with(&prefix)
    })
}


/// Fire-and-forget enqueueing of a message for transmission
pub trait CrtpSender: Send + Sync + 'static {
    fn send(&self, message: CrtpMessage);
}


/// The API higher-level protocols use to talk to the copter: sending (optionally with
///  at-least-once semantics) and subscribing to received messages.
pub trait CrtpCommunicator: CrtpSender {
    /// Sends a message and keeps re-sending it every `resend_interval` until a received message
    ///  satisfies the matcher. There is no limit on the number of attempts, and a reply racing
    ///  a resend may cause a duplicate transmission.
    fn send_expecting_answer(&self, message: CrtpMessage, matcher: MessageMatcher, resend_interval: Duration);

    fn default_resend_interval(&self) -> Duration;

    fn send_expecting_prefix(&self, message: CrtpMessage, prefix: Bytes) {
        let matcher = prefix_matcher(&message, prefix);
        self.send_expecting_answer(message, matcher, self.default_resend_interval());
    }

    fn register_handler(&self, port: u8, handler: MessageHandler) -> HandlerId;
    fn register_all_ports_handler(&self, handler: MessageHandler) -> HandlerId;
    fn remove_handler(&self, port: u8, id: HandlerId) -> bool;
    fn remove_all_ports_handler(&self, id: HandlerId) -> bool;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::crtp::crtp_message::CrtpPort;
    use super::*;

    #[rstest]
    #[case::exact(CrtpPort::Param, 1, vec![7], true)]
    #[case::longer(CrtpPort::Param, 1, vec![7, 1, 2], true)]
    #[case::wrong_prefix(CrtpPort::Param, 1, vec![8, 7], false)]
    #[case::too_short(CrtpPort::Param, 1, vec![], false)]
    #[case::wrong_channel(CrtpPort::Param, 2, vec![7], false)]
    #[case::wrong_port(CrtpPort::Logging, 1, vec![7], false)]
    fn test_prefix_matcher(#[case] port: CrtpPort, #[case] channel: u8, #[case] payload: Vec<u8>, #[case] expected: bool) {
        let request = CrtpMessage::new(CrtpPort::Param, 1, vec![7]);
        let matcher = prefix_matcher(&request, vec![7]);
        assert_eq!(matcher(&CrtpMessage::new(port, channel, payload)), expected);
    }

    #[test]
    fn test_received_link_bits_are_ignored() {
        let request = CrtpMessage::new(CrtpPort::Param, 1, vec![7]);
        let matcher = prefix_matcher(&request, vec![7]);
        assert!(matcher(&CrtpMessage::from_header(0x21, vec![7, 0])));
    }
}
