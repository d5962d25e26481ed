//! Executes the current step of an instance through its agent.
//!
//! Execution flow:
//! 1. Require a running instance and resolve `steps[current_step_index]`.
//! 2. Write an in-progress history record for the attempt and log `step_started`.
//! 3. Dispatch to the agent registered for the step's capability, bounded by
//!    the step timeout and the instance's cancellation token. No lock is held
//!    while the agent works.
//! 4. On failure: finalize the record as failed; cursor and context untouched.
//! 5. On success: commit the context write, cursor advance, finalized record
//!    and events in one guarded commit, retrying on races. An attempt whose
//!    cursor moved underneath it is recorded as superseded.
//! 6. Capture an automatic checkpoint when the policy asks for one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ensemble_types::config::{CheckpointPolicy, EngineConfig};
use ensemble_types::context::StepOutput;
use ensemble_types::error::WorkflowError;
use ensemble_types::event::{SYSTEM_ACTOR, WorkflowEvent, WorkflowEventType};
use ensemble_types::workflow::{
    CheckpointType, InstanceStatus, LifecycleAction, StepExecution, StepHistoryRecord,
    StepHistoryStatus, WorkflowInstance,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agent::{AgentError, AgentRegistry, AgentRequest, AgentResponse};
use super::catalog::WorkflowCatalog;
use super::checkpoint::CheckpointStore;
use super::context::SharedContextStore;
use crate::event::EventLog;
use crate::repository::{CommitOutcome, ContextWrite, InstanceCommit, InstanceGuard, WorkflowStore};

/// Prefix of the error recorded for attempts overtaken by navigation.
const SUPERSEDED: &str = "superseded";

/// Error recorded for attempts whose execution was dropped before an outcome.
const ABANDONED: &str = "abandoned before completion";

/// Runs the current step of an instance and records the outcome.
pub struct StepExecutionCoordinator<S: WorkflowStore> {
    store: Arc<S>,
    events: Arc<EventLog<S>>,
    contexts: Arc<SharedContextStore<S>>,
    checkpoints: Arc<CheckpointStore<S>>,
    catalog: Arc<WorkflowCatalog>,
    agents: AgentRegistry,
    /// Attempt ID -> (instance ID, token) for every dispatched agent call.
    in_flight: DashMap<Uuid, (Uuid, CancellationToken)>,
    step_timeout_secs: u64,
    write_attempts: u32,
    checkpoint_policy: CheckpointPolicy,
}

impl<S: WorkflowStore> StepExecutionCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<EventLog<S>>,
        contexts: Arc<SharedContextStore<S>>,
        checkpoints: Arc<CheckpointStore<S>>,
        catalog: Arc<WorkflowCatalog>,
        agents: AgentRegistry,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            contexts,
            checkpoints,
            catalog,
            agents,
            in_flight: DashMap::new(),
            step_timeout_secs: config.step_timeout_secs.max(1),
            write_attempts: config.context_write_attempts.max(1),
            checkpoint_policy: config.checkpoint_policy,
        }
    }

    /// Fire the cancellation token of every in-flight attempt of an instance.
    ///
    /// Returns how many attempts were signalled.
    pub fn cancel_in_flight(&self, instance_id: &Uuid) -> usize {
        let mut cancelled = 0;
        for entry in self.in_flight.iter() {
            let (owner, token) = entry.value();
            if owner == instance_id {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(instance_id = %instance_id, cancelled, "cancelled in-flight steps");
        }
        cancelled
    }

    /// Number of agent calls currently awaited for an instance.
    pub fn in_flight_count(&self, instance_id: &Uuid) -> usize {
        self.in_flight
            .iter()
            .filter(|entry| entry.value().0 == *instance_id)
            .count()
    }

    #[tracing::instrument(name = "execute_step", skip_all, fields(instance_id = %instance_id))]
    pub async fn execute_current_step(
        &self,
        instance_id: &Uuid,
        user_input: Option<Value>,
    ) -> Result<StepExecution, WorkflowError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::instance_not_found(*instance_id))?;
        if !instance.status.permits(LifecycleAction::Execute) {
            return Err(WorkflowError::InvalidTransition {
                instance_id: *instance_id,
                from: instance.status,
                action: LifecycleAction::Execute,
            });
        }

        let definition = self.catalog.get(&instance.definition_id)?;
        let step = definition
            .step_at(instance.current_step_index)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::ValidationError(format!(
                    "instance {instance_id} has no step at position {}",
                    instance.current_step_index
                ))
            })?;

        let prior_attempts = self
            .store
            .list_step_history(instance_id)
            .await?
            .iter()
            .filter(|h| h.step_id == step.id)
            .count() as u32;
        let record = StepHistoryRecord::in_progress(*instance_id, &step.id, prior_attempts + 1);
        self.store.append_step_history(&record).await?;

        let token = CancellationToken::new();
        let mut guard = AttemptGuard::register(self, record.clone(), token.clone());
        self.events
            .append(WorkflowEvent::new(
                *instance_id,
                WorkflowEventType::StepStarted,
                SYSTEM_ACTOR,
                json!({
                    "step_id": step.id,
                    "attempt": record.attempt,
                    "capability": step.agent_capability,
                }),
            ))
            .await?;

        let context = self.contexts.get(instance_id).await?;
        let request = AgentRequest {
            instance_id: *instance_id,
            step_id: step.id.clone(),
            capability: step.agent_capability.clone(),
            prompt_context: context.prompt_view(),
            context,
            user_input,
            cancellation: token.clone(),
        };
        let timeout_secs = step.timeout_secs.unwrap_or(self.step_timeout_secs);

        let dispatched = self.dispatch(&request, &token, timeout_secs).await;
        guard.unregister();

        let response = match dispatched {
            Ok(response) => response,
            Err(e) => {
                guard.settle();
                self.record_failure(&record, &e.to_string()).await?;
                return Err(WorkflowError::ExecutionFailure {
                    step_id: step.id,
                    message: e.to_string(),
                });
            }
        };

        let output_value = json!({
            "summary": response.summary,
            "content": response.content,
        });
        let step_output = StepOutput {
            step_id: step.id.clone(),
            capability: step.agent_capability.clone(),
            summary: response.summary,
            content: response.content,
            completed_at: Utc::now(),
        };

        let mut attempt = 1;
        let (advanced, context_version) = loop {
            let current = self
                .store
                .get_instance(instance_id)
                .await?
                .ok_or_else(|| WorkflowError::instance_not_found(*instance_id))?;
            if let Some(reason) = superseded_reason(&instance, &current) {
                guard.settle();
                self.record_failure(&record, &reason).await?;
                return Err(WorkflowError::ExecutionFailure {
                    step_id: step.id,
                    message: reason,
                });
            }

            let context = self.contexts.get(instance_id).await?;
            let next_context = self.contexts.with_step_output(&context, step_output.clone());
            let context_version = next_context.version;

            let advanced = current.advanced(definition.step_count(), Utc::now());
            let mut events = vec![WorkflowEvent::new(
                *instance_id,
                WorkflowEventType::StepCompleted,
                SYSTEM_ACTOR,
                json!({
                    "step_id": step.id,
                    "attempt": record.attempt,
                    "summary": step_output.summary,
                    "context_version": context_version,
                }),
            )];
            if advanced.status == InstanceStatus::Completed {
                events.push(WorkflowEvent::new(
                    *instance_id,
                    WorkflowEventType::Completed,
                    SYSTEM_ACTOR,
                    json!({ "last_step_id": step.id }),
                ));
            }

            let commit = InstanceCommit {
                guard: InstanceGuard::from(&current),
                instance: advanced,
                context: Some(ContextWrite {
                    expected_version: context.version,
                    context: next_context,
                }),
                history: Some(record.completed(output_value.clone())),
                events,
            };

            match self.store.commit(&commit).await? {
                CommitOutcome::Committed => {
                    guard.settle();
                    self.events.announce(commit.events);
                    break (commit.instance, context_version);
                }
                outcome if attempt < self.write_attempts => {
                    tracing::debug!(?outcome, attempt, step_id = %step.id, "step commit raced, retrying");
                    attempt += 1;
                }
                outcome => {
                    let detail = format!("step '{}' result could not be committed ({outcome:?})", step.id);
                    guard.settle();
                    self.record_failure(&record, &detail).await?;
                    return Err(WorkflowError::ConcurrencyConflict {
                        instance_id: *instance_id,
                        detail,
                    });
                }
            }
        };

        tracing::info!(
            step_id = %step.id,
            attempt = record.attempt,
            step_index = advanced.current_step_index,
            status = %advanced.status,
            context_version,
            "step completed"
        );

        if self.checkpoint_policy.after_completed() {
            if let Err(e) = self
                .checkpoints
                .create_checkpoint(instance_id, &step.id, CheckpointType::Automatic, SYSTEM_ACTOR)
                .await
            {
                tracing::warn!(step_id = %step.id, error = %e, "automatic checkpoint failed");
            }
        }

        Ok(StepExecution {
            step_id: step.id,
            instance: advanced,
            output: output_value,
            context_version,
        })
    }

    async fn dispatch(
        &self,
        request: &AgentRequest,
        token: &CancellationToken,
        timeout_secs: u64,
    ) -> Result<AgentResponse, AgentError> {
        let invoker = self
            .agents
            .get(&request.capability)
            .ok_or_else(|| AgentError::NoHandler(request.capability.clone()))?;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), invoker.invoke(request)) => {
                result.unwrap_or(Err(AgentError::Timeout(timeout_secs)))
            }
        }
    }

    async fn record_failure(&self, record: &StepHistoryRecord, reason: &str) -> Result<(), WorkflowError> {
        record_failure(self.store.as_ref(), &self.events, record, reason).await
    }
}

/// Finalize an attempt as failed and log `step_failed`.
async fn record_failure<S: WorkflowStore>(
    store: &S,
    events: &EventLog<S>,
    record: &StepHistoryRecord,
    reason: &str,
) -> Result<(), WorkflowError> {
    let failed = record.failed(reason);
    store.update_step_history(&failed).await?;
    tracing::warn!(
        instance_id = %record.instance_id,
        step_id = %record.step_id,
        attempt = record.attempt,
        error = reason,
        "step failed"
    );
    events
        .append(WorkflowEvent::new(
            record.instance_id,
            WorkflowEventType::StepFailed,
            SYSTEM_ACTOR,
            json!({
                "step_id": record.step_id,
                "attempt": record.attempt,
                "error": reason,
            }),
        ))
        .await
}

/// One registered attempt, from its in-progress record to its outcome.
///
/// Dropping the guard removes the attempt's cancellation token. An attempt
/// dropped before it was settled (the caller abandoned the future, or a
/// store error cut it short) is finalized as failed on a background task.
struct AttemptGuard<'a, S: WorkflowStore> {
    in_flight: &'a DashMap<Uuid, (Uuid, CancellationToken)>,
    store: Arc<S>,
    events: Arc<EventLog<S>>,
    record: StepHistoryRecord,
    settled: bool,
}

impl<'a, S: WorkflowStore> AttemptGuard<'a, S> {
    fn register(
        coordinator: &'a StepExecutionCoordinator<S>,
        record: StepHistoryRecord,
        token: CancellationToken,
    ) -> Self {
        coordinator
            .in_flight
            .insert(record.id, (record.instance_id, token));
        Self {
            in_flight: &coordinator.in_flight,
            store: coordinator.store.clone(),
            events: coordinator.events.clone(),
            record,
            settled: false,
        }
    }

    fn unregister(&self) {
        self.in_flight.remove(&self.record.id);
    }

    /// The outcome is being recorded by the caller.
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<S: WorkflowStore> Drop for AttemptGuard<'_, S> {
    fn drop(&mut self) {
        self.unregister();
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                instance_id = %self.record.instance_id,
                step_id = %self.record.step_id,
                "abandoned attempt left in progress: no runtime"
            );
            return;
        };
        let store = self.store.clone();
        let events = self.events.clone();
        let record = self.record.clone();
        handle.spawn(async move {
            // the commit may have landed before the future was dropped
            let pending = match store.list_step_history(&record.instance_id).await {
                Ok(history) => history
                    .iter()
                    .any(|h| h.id == record.id && h.status == StepHistoryStatus::InProgress),
                Err(_) => true,
            };
            if !pending {
                return;
            }
            if let Err(e) = record_failure(store.as_ref(), &events, &record, ABANDONED).await {
                tracing::warn!(
                    instance_id = %record.instance_id,
                    step_id = %record.step_id,
                    error = %e,
                    "could not finalize abandoned attempt"
                );
            }
        });
    }
}

/// Why a finished attempt must not land, if it must not.
fn superseded_reason(dispatched: &WorkflowInstance, current: &WorkflowInstance) -> Option<String> {
    if !matches!(current.status, InstanceStatus::Running | InstanceStatus::Paused) {
        return Some(format!("{SUPERSEDED}: instance is {}", current.status));
    }
    if current.current_step_index != dispatched.current_step_index {
        return Some(format!(
            "{SUPERSEDED}: cursor moved from {} to {}",
            dispatched.current_step_index, current.current_step_index
        ));
    }
    None
}

/// True for history records of attempts overtaken by navigation or cancellation.
pub fn is_superseded(record: &StepHistoryRecord) -> bool {
    record.status == StepHistoryStatus::Failed
        && record
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with(SUPERSEDED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::InMemoryWorkflowStore;
    use crate::workflow::agent::AgentInvoker;
    use crate::workflow::input_queue::InputQueue;
    use ensemble_types::workflow::{StepDefinition, WorkflowDefinition};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    // -----------------------------------------------------------------------
    // Mock agents
    // -----------------------------------------------------------------------

    struct Scripted {
        calls: Arc<AtomicUsize>,
    }

    impl AgentInvoker for Scripted {
        async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResponse {
                summary: format!("{} done", request.step_id),
                content: json!({ "input": request.user_input }),
            })
        }
    }

    struct Failing;

    impl AgentInvoker for Failing {
        async fn invoke(&self, _request: &AgentRequest) -> Result<AgentResponse, AgentError> {
            Err(AgentError::Failed("model unavailable".to_string()))
        }
    }

    /// Adds a `started` permit, then waits for a `release` permit (or cancellation).
    struct Gated {
        started: Arc<Semaphore>,
        release: Arc<Semaphore>,
    }

    impl AgentInvoker for Gated {
        async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
            self.started.add_permits(1);
            tokio::select! {
                _ = request.cancellation.cancelled() => Err(AgentError::Cancelled),
                permit = self.release.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    Ok(AgentResponse {
                        summary: "gated done".to_string(),
                        content: json!(null),
                    })
                }
            }
        }
    }

    fn gated() -> (AgentRegistry, Arc<Semaphore>, Arc<Semaphore>) {
        let started = Arc::new(Semaphore::new(0));
        let release = Arc::new(Semaphore::new(0));
        let registry = AgentRegistry::new().with(
            "pm",
            Gated {
                started: started.clone(),
                release: release.clone(),
            },
        );
        (registry, started, release)
    }

    async fn wait_started(started: &Semaphore) {
        started.acquire().await.unwrap().forget();
    }

    struct Sleepy;

    impl AgentInvoker for Sleepy {
        async fn invoke(&self, _request: &AgentRequest) -> Result<AgentResponse, AgentError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentResponse {
                summary: "late".to_string(),
                content: json!(null),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Fixture
    // -----------------------------------------------------------------------

    fn definition(capabilities: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "flow".to_string(),
            name: "Flow".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            steps: capabilities
                .iter()
                .enumerate()
                .map(|(i, cap)| StepDefinition {
                    id: format!("s{}", i + 1),
                    name: None,
                    agent_capability: cap.to_string(),
                    required: true,
                    can_skip: false,
                    timeout_secs: (*cap == "sleepy").then_some(1),
                })
                .collect(),
            metadata: HashMap::new(),
        }
    }

    struct Fixture {
        store: Arc<InMemoryWorkflowStore>,
        coordinator: Arc<StepExecutionCoordinator<InMemoryWorkflowStore>>,
        instance: WorkflowInstance,
    }

    async fn fixture(capabilities: &[&str], agents: AgentRegistry) -> Fixture {
        let config = EngineConfig::default();
        let store = Arc::new(InMemoryWorkflowStore::new());
        let events = Arc::new(EventLog::new(store.clone(), EventBus::new(64)));
        let contexts = Arc::new(SharedContextStore::new(store.clone(), events.clone(), &config));
        let inputs = Arc::new(InputQueue::new(store.clone(), events.clone(), contexts.clone(), &config));
        let mut catalog = WorkflowCatalog::new();
        catalog.register(definition(capabilities)).unwrap();
        let catalog = Arc::new(catalog);
        let checkpoints = Arc::new(CheckpointStore::new(
            store.clone(),
            events.clone(),
            contexts.clone(),
            inputs,
            catalog.clone(),
            &config,
        ));

        let coordinator = Arc::new(StepExecutionCoordinator::new(
            store.clone(),
            events,
            contexts.clone(),
            checkpoints,
            catalog,
            agents,
            &config,
        ));

        let mut instance = WorkflowInstance::new("flow", "user-1");
        instance.status = InstanceStatus::Running;
        instance.current_step_index = 1;
        let seeded = contexts.seed(instance.id, json!(null));
        let created = WorkflowEvent::new(instance.id, WorkflowEventType::Created, "user-1", json!({}));
        store.insert_instance(&instance, &seeded, &created).await.unwrap();

        Fixture {
            store,
            coordinator,
            instance,
        }
    }

    async fn set_instance(f: &Fixture, change: impl FnOnce(&mut WorkflowInstance)) {
        let current = f.store.get_instance(&f.instance.id).await.unwrap().unwrap();
        let mut next = current.clone();
        change(&mut next);
        let outcome = f
            .store
            .commit(&InstanceCommit {
                guard: InstanceGuard::from(&current),
                instance: next,
                context: None,
                history: None,
                events: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
    }

    fn scripted() -> (AgentRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = AgentRegistry::new()
            .with("pm", Scripted { calls: calls.clone() })
            .with("architect", Scripted { calls: calls.clone() });
        (registry, calls)
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn success_records_output_and_advances() {
        let (agents, calls) = scripted();
        let f = fixture(&["pm", "architect"], agents).await;

        let execution = f
            .coordinator
            .execute_current_step(&f.instance.id, Some(json!("build a todo app")))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(execution.step_id, "s1");
        assert_eq!(execution.instance.current_step_index, 2);
        assert_eq!(execution.context_version, 2);
        assert_eq!(execution.output["content"]["input"], json!("build a todo app"));

        let history = f.store.list_step_history(&f.instance.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StepHistoryStatus::Completed);

        let ctx = f.store.get_context(&f.instance.id).await.unwrap().unwrap();
        assert_eq!(ctx.content.step_outputs["s1"].summary, "s1 done");

        // automatic checkpoint after the completed step
        assert_eq!(f.store.count_checkpoints(&f.instance.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_step_completes_instance() {
        let (agents, _) = scripted();
        let f = fixture(&["pm"], agents).await;

        let execution = f
            .coordinator
            .execute_current_step(&f.instance.id, None)
            .await
            .unwrap();
        assert_eq!(execution.instance.status, InstanceStatus::Completed);
        assert_eq!(execution.instance.current_step_index, 1);

        let types: Vec<_> = f
            .store
            .list_events(&f.instance.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&WorkflowEventType::Completed));
        assert!(types.contains(&WorkflowEventType::CheckpointCreated));

        let err = f
            .coordinator
            .execute_current_step(&f.instance.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn failure_leaves_cursor_and_context() {
        let f = fixture(&["pm"], AgentRegistry::new().with("pm", Failing)).await;

        let err = f
            .coordinator
            .execute_current_step(&f.instance.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ExecutionFailure { .. }));
        assert!(err.to_string().contains("model unavailable"));

        let instance = f.store.get_instance(&f.instance.id).await.unwrap().unwrap();
        assert_eq!(instance.current_step_index, 1);
        assert_eq!(instance.status, InstanceStatus::Running);
        let ctx = f.store.get_context(&f.instance.id).await.unwrap().unwrap();
        assert_eq!(ctx.version, 1);

        let history = f.store.list_step_history(&f.instance.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StepHistoryStatus::Failed);
        assert_eq!(history[0].attempt, 1);
    }

    #[tokio::test]
    async fn missing_handler_is_execution_failure() {
        let f = fixture(&["qa"], AgentRegistry::new()).await;
        let err = f
            .coordinator
            .execute_current_step(&f.instance.id, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no agent registered for capability 'qa'"));

        let history = f.store.list_step_history(&f.instance.id).await.unwrap();
        assert_eq!(history[0].status, StepHistoryStatus::Failed);
    }

    #[tokio::test]
    async fn retry_after_failure_counts_attempts() {
        let f = fixture(&["pm"], AgentRegistry::new().with("pm", Failing)).await;
        for _ in 0..2 {
            let _ = f.coordinator.execute_current_step(&f.instance.id, None).await;
        }
        let attempts: Vec<_> = f
            .store
            .list_step_history(&f.instance.id)
            .await
            .unwrap()
            .iter()
            .map(|h| h.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn step_timeout_is_execution_failure() {
        let f = fixture(&["sleepy"], AgentRegistry::new().with("sleepy", Sleepy)).await;
        let err = f
            .coordinator
            .execute_current_step(&f.instance.id, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"));
        assert_eq!(f.coordinator.in_flight_count(&f.instance.id), 0);
    }

    #[tokio::test]
    async fn cancellation_records_failure() {
        let (agents, started, _release) = gated();
        let f = fixture(&["pm"], agents).await;

        let coordinator = f.coordinator.clone();
        let id = f.instance.id;
        let handle = tokio::spawn(async move { coordinator.execute_current_step(&id, None).await });

        wait_started(&started).await;
        assert_eq!(f.coordinator.in_flight_count(&id), 1);
        assert_eq!(f.coordinator.cancel_in_flight(&id), 1);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        let history = f.store.list_step_history(&id).await.unwrap();
        assert_eq!(history[0].status, StepHistoryStatus::Failed);
        assert_eq!(history[0].error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn abandoned_execution_is_unregistered_and_failed() {
        let (agents, started, _release) = gated();
        let f = fixture(&["pm"], agents).await;

        let coordinator = f.coordinator.clone();
        let id = f.instance.id;
        let handle = tokio::spawn(async move { coordinator.execute_current_step(&id, None).await });

        wait_started(&started).await;
        assert_eq!(f.coordinator.in_flight_count(&id), 1);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(f.coordinator.in_flight_count(&id), 0);

        // finalization runs on a background task
        let mut history = f.store.list_step_history(&id).await.unwrap();
        for _ in 0..50 {
            if history[0].status != StepHistoryStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            history = f.store.list_step_history(&id).await.unwrap();
        }
        assert_eq!(history[0].status, StepHistoryStatus::Failed);
        assert_eq!(
            history[0].error_message.as_deref(),
            Some("abandoned before completion")
        );
        let instance = f.store.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.current_step_index, 1);
    }

    #[tokio::test]
    async fn step_landing_while_paused_advances_and_stays_paused() {
        let (agents, started, release) = gated();
        let f = fixture(&["pm", "pm"], agents).await;

        let coordinator = f.coordinator.clone();
        let id = f.instance.id;
        let handle = tokio::spawn(async move { coordinator.execute_current_step(&id, None).await });

        wait_started(&started).await;
        set_instance(&f, |i| {
            i.status = InstanceStatus::Paused;
            i.paused_at = Some(Utc::now());
        })
        .await;
        release.add_permits(1);

        let execution = handle.await.unwrap().unwrap();
        assert_eq!(execution.instance.status, InstanceStatus::Paused);
        assert_eq!(execution.instance.current_step_index, 2);
    }

    #[tokio::test]
    async fn navigation_during_dispatch_supersedes_attempt() {
        let (agents, started, release) = gated();
        let f = fixture(&["pm", "pm", "pm"], agents).await;

        let coordinator = f.coordinator.clone();
        let id = f.instance.id;
        let handle = tokio::spawn(async move { coordinator.execute_current_step(&id, None).await });

        wait_started(&started).await;
        set_instance(&f, |i| i.current_step_index = 3).await;
        release.add_permits(1);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("superseded"));

        let instance = f.store.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.current_step_index, 3);
        let ctx = f.store.get_context(&id).await.unwrap().unwrap();
        assert!(ctx.content.step_outputs.is_empty());
        let history = f.store.list_step_history(&id).await.unwrap();
        assert!(is_superseded(&history[0]));
    }

    #[tokio::test]
    async fn concurrent_completions_advance_once() {
        let (agents, started, release) = gated();
        let f = fixture(&["pm", "pm", "pm"], agents).await;
        let id = f.instance.id;

        let first = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.execute_current_step(&id, None).await })
        };
        wait_started(&started).await;
        let second = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.execute_current_step(&id, None).await })
        };
        wait_started(&started).await;

        release.add_permits(2);
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );
        let instance = f.store.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.current_step_index, 2);
        let history = f.store.list_step_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history
                .iter()
                .filter(|h| h.status == StepHistoryStatus::Completed)
                .count(),
            1
        );
    }
}
