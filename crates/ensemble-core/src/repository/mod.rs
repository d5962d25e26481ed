//! Repository trait definitions (ports).
//!
//! The storage interface that the infrastructure layer (ensemble-infra)
//! implements. An in-memory implementation lives here for tests and
//! embedding without a database.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowStore;
pub use workflow::{
    CommitOutcome, ContextCommit, ContextWrite, InstanceCommit, InstanceGuard, WorkflowStore,
};
