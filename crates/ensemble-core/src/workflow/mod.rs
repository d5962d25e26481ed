//! Workflow engine: definitions, shared context, checkpoints, queued
//! inputs, step execution and the instance lifecycle.

pub mod agent;
pub mod catalog;
pub mod checkpoint;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod input_queue;
pub mod manager;

pub use agent::{AgentError, AgentInvoker, AgentRegistry, AgentRequest, AgentResponse, BoxAgentInvoker};
pub use catalog::WorkflowCatalog;
pub use checkpoint::CheckpointStore;
pub use context::SharedContextStore;
pub use coordinator::StepExecutionCoordinator;
pub use definition::DefinitionError;
pub use input_queue::InputQueue;
pub use manager::WorkflowInstanceManager;
