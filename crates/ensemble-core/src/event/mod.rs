//! Audit trail and live event distribution.
//!
//! `EventLog` persists every `WorkflowEvent` through the store and fans it
//! out on an `EventBus` (a `tokio::sync::broadcast` channel).

pub mod bus;
pub mod log;

pub use bus::EventBus;
pub use log::EventLog;
