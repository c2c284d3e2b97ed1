//! Oxibot Core — event types, message bus, session store, config, and utilities.
//!
//! This crate is the routing and coordination core: the pieces every other
//! Oxibot crate depends on but that don't themselves talk to an LLM or a
//! chat channel.

pub mod bus;
pub mod config;
pub mod groups;
pub mod heartbeat;
pub mod paths;
pub mod relay;
pub mod routing;
pub mod session;
pub mod transcript;
pub mod types;
pub mod utils;

pub use paths::Paths;
pub use routing::{FilterChain, RouteDecision, RoutingFilter, SessionContext};
