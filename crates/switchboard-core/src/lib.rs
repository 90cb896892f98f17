// Request routing and escalation core: envelopes, broker channels, sessions,
// the agent runtime and the gateway dispatcher.

pub mod agent;
pub mod agents;
pub mod channel;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod session;
pub mod test_utils;
pub mod types;

pub use context::ServiceContext;
pub use error::{Error, Result};
