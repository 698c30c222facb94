use tokio::sync::broadcast;
use tracing::trace;


#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    /// percentage (0 to 100) of successful exchanges, smoothed over recent exchanges
    LinkQuality(f32),
    /// A problem on the radio link. Non-fatal errors are transient and the link keeps working on
    ///  its own, while a fatal error means the copter stopped acknowledging traffic.
    LinkError(LinkErrorData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkErrorData {
    pub message: String,
    pub fatal: bool,
}


pub struct LinkEventNotifier {
    sender: broadcast::Sender<LinkEvent>,
}
impl Default for LinkEventNotifier {
    fn default() -> Self {
        LinkEventNotifier::new()
    }
}
impl LinkEventNotifier {
    pub fn new() -> LinkEventNotifier {
        let (sender, _) = broadcast::channel(128);

        LinkEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: LinkEvent) {
        trace!("link event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn send_error(&self, message: impl Into<String>, fatal: bool) {
        self.send_event(LinkEvent::LinkError(LinkErrorData {
            message: message.into(),
            fatal,
        }));
    }
}
