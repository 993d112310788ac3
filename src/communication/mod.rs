pub mod amqp_bridge;
pub mod channel;
pub mod messages;

pub use channel::{phase_topic, Address, Mailbox, MessageBus};
pub use messages::{Destination, Envelope, MessageType, Payload};
