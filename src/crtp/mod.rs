pub mod communicator;
pub mod crtp_message;
pub mod drop_oldest_queue;
pub mod event_registry;
pub mod link_events;
pub mod link_quality;
pub mod message_pump;
pub mod reliable_request;
pub mod safelink;
