//! Agent invocation port and capability routing.
//!
//! The engine never decides how a step's output is produced. It hands an
//! `AgentRequest` to whatever `AgentInvoker` is registered for the step's
//! capability and records what comes back.
//!
//! Dynamic dispatch follows the usual blanket-impl pattern:
//! 1. `AgentInvokerDyn` is an object-safe mirror of `AgentInvoker` with boxed futures
//! 2. Every `T: AgentInvoker` gets `AgentInvokerDyn` for free
//! 3. `BoxAgentInvoker` wraps `Box<dyn AgentInvokerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ensemble_types::context::SharedContext;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an agent receives for one step attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub instance_id: Uuid,
    pub step_id: String,
    pub capability: String,
    /// Snapshot of the shared context at dispatch time.
    pub context: SharedContext,
    /// Bounded prompt view of the context (summary when one exists).
    pub prompt_context: String,
    pub user_input: Option<serde_json::Value>,
    /// Fires when the instance is cancelled while the agent is working.
    pub cancellation: CancellationToken,
}

/// What an agent hands back on success.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    /// Short summary kept verbatim in condensed contexts.
    pub summary: String,
    pub content: serde_json::Value,
}

/// Failures of the agent collaborator.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("no agent registered for capability '{0}'")]
    NoHandler(String),
}

/// Produces the output of one workflow step.
///
/// Implementations should observe `request.cancellation`; the coordinator
/// stops waiting once it fires regardless.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<AgentResponse, AgentError>> + Send;
}

/// Object-safe version of [`AgentInvoker`] with boxed futures.
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + 'a>>;
}

impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased agent invoker for runtime capability routing.
pub struct BoxAgentInvoker {
    inner: Box<dyn AgentInvokerDyn + Send + Sync>,
}

impl BoxAgentInvoker {
    pub fn new<T: AgentInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        self.inner.invoke_boxed(request).await
    }
}

/// Registry of agent invokers, indexed by capability.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    invokers: HashMap<String, Arc<BoxAgentInvoker>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker for a capability, replacing any previous one.
    pub fn register<T: AgentInvoker + 'static>(&mut self, capability: impl Into<String>, invoker: T) {
        self.invokers
            .insert(capability.into(), Arc::new(BoxAgentInvoker::new(invoker)));
    }

    /// Builder-style [`AgentRegistry::register`].
    pub fn with<T: AgentInvoker + 'static>(mut self, capability: impl Into<String>, invoker: T) -> Self {
        self.register(capability, invoker);
        self
    }

    pub fn get(&self, capability: &str) -> Option<Arc<BoxAgentInvoker>> {
        self.invokers.get(capability).cloned()
    }

    pub fn capabilities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.invokers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
