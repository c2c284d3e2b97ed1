//! Async message bus — connects channel adapters to the agent loop.

pub mod queue;
pub mod types;

pub use queue::{MessageBus, RecvTimeout};
pub use types::{InboundMessage, Metadata, OutboundMessage};
