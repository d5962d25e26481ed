//! Workflow instance lifecycle and engine facade.
//!
//! `WorkflowInstanceManager` owns the lifecycle state machine
//! (Created -> Running <-> Paused; Running/Paused -> Cancelled; Running ->
//! Completed) and composes the catalog, context store, input queue,
//! checkpoint store and step coordinator behind one API.
//!
//! Every transition is computed from a fresh read of the instance and
//! committed together with its events (and, for skips, its history record)
//! under a guard on the observed status and cursor.

use std::sync::Arc;

use chrono::Utc;
use ensemble_types::config::EngineConfig;
use ensemble_types::context::{ArtifactReference, DecisionRecord, SharedContext};
use ensemble_types::error::WorkflowError;
use ensemble_types::event::{SYSTEM_ACTOR, WorkflowEvent, WorkflowEventType};
use ensemble_types::workflow::{
    CheckpointType, InstanceStatus, LifecycleAction, Page, QueuedInput, StepExecution,
    StepHistoryRecord, WorkflowCheckpoint, WorkflowDefinition, WorkflowInstance,
};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::agent::AgentRegistry;
use super::catalog::WorkflowCatalog;
use super::checkpoint::CheckpointStore;
use super::context::SharedContextStore;
use super::coordinator::StepExecutionCoordinator;
use super::input_queue::InputQueue;
use crate::event::{EventBus, EventLog};
use crate::repository::{CommitOutcome, InstanceCommit, InstanceGuard, WorkflowStore};

/// The outcome a lifecycle operation wants to commit.
struct Transition {
    instance: WorkflowInstance,
    history: Option<StepHistoryRecord>,
    events: Vec<WorkflowEvent>,
}

impl Transition {
    fn new(instance: WorkflowInstance, event: WorkflowEvent) -> Self {
        Self {
            instance,
            history: None,
            events: vec![event],
        }
    }
}

/// Engine facade over a `WorkflowStore`.
pub struct WorkflowInstanceManager<S: WorkflowStore> {
    store: Arc<S>,
    catalog: Arc<WorkflowCatalog>,
    events: Arc<EventLog<S>>,
    contexts: Arc<SharedContextStore<S>>,
    inputs: Arc<InputQueue<S>>,
    checkpoints: Arc<CheckpointStore<S>>,
    coordinator: Arc<StepExecutionCoordinator<S>>,
    config: EngineConfig,
}

impl<S: WorkflowStore> WorkflowInstanceManager<S> {
    /// Wire every engine component over one store.
    pub fn new(
        store: Arc<S>,
        catalog: WorkflowCatalog,
        agents: AgentRegistry,
        config: EngineConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let events = Arc::new(EventLog::new(
            store.clone(),
            EventBus::new(config.event_bus_capacity),
        ));
        let contexts = Arc::new(SharedContextStore::new(store.clone(), events.clone(), &config));
        let inputs = Arc::new(InputQueue::new(
            store.clone(),
            events.clone(),
            contexts.clone(),
            &config,
        ));
        let checkpoints = Arc::new(CheckpointStore::new(
            store.clone(),
            events.clone(),
            contexts.clone(),
            inputs.clone(),
            catalog.clone(),
            &config,
        ));
        let coordinator = Arc::new(StepExecutionCoordinator::new(
            store.clone(),
            events.clone(),
            contexts.clone(),
            checkpoints.clone(),
            catalog.clone(),
            agents,
            &config,
        ));

        Self {
            store,
            catalog,
            events,
            contexts,
            inputs,
            checkpoints,
            coordinator,
            config,
        }
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &StepExecutionCoordinator<S> {
        &self.coordinator
    }

    /// Live stream of every event the engine commits from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create an instance in `Created` with its context seeded at version 1.
    ///
    /// Fails `NotFound` if the definition is missing or does not validate.
    pub async fn create(
        &self,
        definition_id: &str,
        owner_id: &str,
        initial_context: Value,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let definition = self.catalog.get(definition_id)?;
        if !self.catalog.validate(definition_id) {
            return Err(WorkflowError::NotFound(format!(
                "valid workflow definition {definition_id}"
            )));
        }

        let instance = WorkflowInstance::new(definition_id, owner_id);
        let context = self.contexts.seed(instance.id, initial_context);
        let event = WorkflowEvent::new(
            instance.id,
            WorkflowEventType::Created,
            owner_id,
            json!({
                "definition_id": definition.id,
                "definition_version": definition.version,
            }),
        );
        self.store
            .insert_instance(&instance, &context, &event)
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            definition_id,
            owner_id,
            "workflow instance created"
        );
        self.events.announce([event]);
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Lifecycle transitions
    // -----------------------------------------------------------------------

    /// Re-read, check the transition table, build, and commit under a guard.
    ///
    /// A guard failure re-evaluates on a fresh read, so an action that is no
    /// longer permitted fails `InvalidTransition` rather than a conflict.
    /// With `with_history`, the step history is re-read on every attempt too.
    async fn transition<F>(
        &self,
        instance_id: &Uuid,
        action: LifecycleAction,
        with_history: bool,
        build: F,
    ) -> Result<InstanceCommit, WorkflowError>
    where
        F: Fn(
            &WorkflowInstance,
            &WorkflowDefinition,
            &[StepHistoryRecord],
        ) -> Result<Transition, WorkflowError>,
    {
        let mut attempt = 1;
        loop {
            let current = self.require(instance_id, action).await?;
            let definition = self.catalog.get(&current.definition_id)?;
            let history = if with_history {
                self.store.list_step_history(instance_id).await?
            } else {
                Vec::new()
            };
            let transition = build(&current, &definition, &history)?;

            let commit = InstanceCommit {
                guard: InstanceGuard::from(&current),
                instance: transition.instance,
                context: None,
                history: transition.history,
                events: transition.events,
            };
            match self.store.commit(&commit).await? {
                CommitOutcome::Committed => {
                    tracing::info!(
                        instance_id = %instance_id,
                        %action,
                        from = %current.status,
                        to = %commit.instance.status,
                        step_index = commit.instance.current_step_index,
                        "workflow transition"
                    );
                    self.events.announce(commit.events.iter().cloned());
                    return Ok(commit);
                }
                outcome if attempt < self.config.context_write_attempts => {
                    tracing::debug!(instance_id = %instance_id, %action, ?outcome, attempt, "transition raced, retrying");
                    attempt += 1;
                }
                outcome => {
                    return Err(WorkflowError::ConcurrencyConflict {
                        instance_id: *instance_id,
                        detail: format!("{action} lost a race ({outcome:?})"),
                    });
                }
            }
        }
    }

    /// Load an instance and check that `action` is permitted in its status.
    async fn require(
        &self,
        instance_id: &Uuid,
        action: LifecycleAction,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let instance = self.get_instance(instance_id).await?;
        if !instance.status.permits(action) {
            return Err(WorkflowError::InvalidTransition {
                instance_id: *instance_id,
                from: instance.status,
                action,
            });
        }
        Ok(instance)
    }

    /// Created -> Running, cursor on the first step.
    pub async fn start(&self, instance_id: &Uuid, actor_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        let commit = self
            .transition(instance_id, LifecycleAction::Start, false, |current, definition, _| {
                let first = definition.step_at(1).ok_or_else(|| {
                    WorkflowError::ValidationError(format!(
                        "workflow {} has no steps",
                        definition.id
                    ))
                })?;
                let mut next = current.clone();
                next.status = InstanceStatus::Running;
                next.current_step_index = 1;
                next.updated_at = Utc::now();
                let event = WorkflowEvent::new(
                    current.id,
                    WorkflowEventType::Started,
                    actor_id,
                    json!({ "step_id": first.id }),
                );
                Ok(Transition::new(next, event))
            })
            .await?;
        Ok(commit.instance)
    }

    /// Running -> Paused. Blocks new executions; in-flight steps still land.
    pub async fn pause(&self, instance_id: &Uuid, actor_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        let commit = self
            .transition(instance_id, LifecycleAction::Pause, false, |current, _, _| {
                let now = Utc::now();
                let mut next = current.clone();
                next.status = InstanceStatus::Paused;
                next.paused_at = Some(now);
                next.updated_at = now;
                let event = WorkflowEvent::new(
                    current.id,
                    WorkflowEventType::Paused,
                    actor_id,
                    json!({ "step_index": current.current_step_index }),
                );
                Ok(Transition::new(next, event))
            })
            .await?;
        Ok(commit.instance)
    }

    /// Paused -> Running.
    pub async fn resume(&self, instance_id: &Uuid, actor_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        let commit = self
            .transition(instance_id, LifecycleAction::Resume, false, |current, _, _| {
                let mut next = current.clone();
                next.status = InstanceStatus::Running;
                next.paused_at = None;
                next.updated_at = Utc::now();
                let event = WorkflowEvent::new(
                    current.id,
                    WorkflowEventType::Resumed,
                    actor_id,
                    json!({
                        "step_index": current.current_step_index,
                        "paused_at": current.paused_at,
                    }),
                );
                Ok(Transition::new(next, event))
            })
            .await?;
        Ok(commit.instance)
    }

    /// Running/Paused -> Cancelled, then signal any in-flight step.
    pub async fn cancel(&self, instance_id: &Uuid, actor_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        let commit = self
            .transition(instance_id, LifecycleAction::Cancel, false, |current, _, _| {
                let now = Utc::now();
                let mut next = current.clone();
                next.status = InstanceStatus::Cancelled;
                next.cancelled_at = Some(now);
                next.paused_at = None;
                next.updated_at = now;
                let event = WorkflowEvent::new(
                    current.id,
                    WorkflowEventType::Cancelled,
                    actor_id,
                    json!({ "from_status": current.status }),
                );
                Ok(Transition::new(next, event))
            })
            .await?;
        self.coordinator.cancel_in_flight(instance_id);
        Ok(commit.instance)
    }

    /// Move the cursor to a named step. History and context are retained.
    pub async fn go_to_step(
        &self,
        instance_id: &Uuid,
        target_step_id: &str,
        actor_id: &str,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let commit = self
            .transition(instance_id, LifecycleAction::Navigate, false, |current, definition, _| {
                let target = definition.position_of(target_step_id).ok_or_else(|| {
                    WorkflowError::NotFound(format!(
                        "step '{target_step_id}' in workflow {}",
                        definition.id
                    ))
                })?;
                let mut next = current.clone();
                next.current_step_index = target;
                next.updated_at = Utc::now();
                let event = WorkflowEvent::new(
                    current.id,
                    WorkflowEventType::Revisit,
                    actor_id,
                    json!({
                        "step_id": target_step_id,
                        "from_step_index": current.current_step_index,
                        "to_step_index": target,
                    }),
                );
                Ok(Transition::new(next, event))
            })
            .await?;
        Ok(commit.instance)
    }

    /// Skip the current step if it allows skipping, advancing the cursor.
    pub async fn skip_step(
        &self,
        instance_id: &Uuid,
        actor_id: &str,
        reason: &str,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let commit = self
            .transition(instance_id, LifecycleAction::Skip, true, |current, definition, history| {
                let step = definition
                    .step_at(current.current_step_index)
                    .ok_or_else(|| {
                        WorkflowError::ValidationError(format!(
                            "instance {} has no step at position {}",
                            current.id, current.current_step_index
                        ))
                    })?;
                if !step.can_skip {
                    return Err(WorkflowError::StepNotSkippable {
                        step_id: step.id.clone(),
                    });
                }

                let attempt = history.iter().filter(|h| h.step_id == step.id).count() as u32 + 1;
                let record =
                    StepHistoryRecord::skipped(current.id, &step.id, attempt, actor_id, reason);
                let next = current.advanced(definition.step_count(), Utc::now());
                let mut events = vec![WorkflowEvent::new(
                    current.id,
                    WorkflowEventType::StepSkipped,
                    actor_id,
                    json!({ "step_id": step.id, "reason": reason }),
                )];
                if next.status == InstanceStatus::Completed {
                    events.push(WorkflowEvent::new(
                        current.id,
                        WorkflowEventType::Completed,
                        SYSTEM_ACTOR,
                        json!({ "last_step_id": step.id }),
                    ));
                }
                Ok(Transition {
                    instance: next,
                    history: Some(record),
                    events,
                })
            })
            .await?;

        if self.config.checkpoint_policy.after_skipped() {
            if let Some(record) = &commit.history {
                if let Err(e) = self
                    .checkpoints
                    .create_checkpoint(instance_id, &record.step_id, CheckpointType::Automatic, SYSTEM_ACTOR)
                    .await
                {
                    tracing::warn!(instance_id = %instance_id, error = %e, "automatic checkpoint failed");
                }
            }
        }
        Ok(commit.instance)
    }

    // -----------------------------------------------------------------------
    // Execution, checkpoints, inputs
    // -----------------------------------------------------------------------

    pub async fn execute_step(
        &self,
        instance_id: &Uuid,
        user_input: Option<Value>,
    ) -> Result<StepExecution, WorkflowError> {
        self.coordinator
            .execute_current_step(instance_id, user_input)
            .await
    }

    /// Caller-triggered checkpoint referencing the current step.
    pub async fn create_checkpoint(
        &self,
        instance_id: &Uuid,
        actor_id: &str,
    ) -> Result<WorkflowCheckpoint, WorkflowError> {
        let instance = self.get_instance(instance_id).await?;
        let definition = self.catalog.get(&instance.definition_id)?;
        let step_id = definition
            .step_at(instance.current_step_index)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        self.checkpoints
            .create_checkpoint(instance_id, &step_id, CheckpointType::ExplicitSave, actor_id)
            .await
    }

    pub async fn restore_checkpoint(
        &self,
        instance_id: &Uuid,
        checkpoint_id: &Uuid,
        actor_id: &str,
    ) -> Result<WorkflowInstance, WorkflowError> {
        self.checkpoints
            .restore_checkpoint(instance_id, checkpoint_id, actor_id)
            .await
    }

    pub async fn list_checkpoints(
        &self,
        instance_id: &Uuid,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<Page<WorkflowCheckpoint>, WorkflowError> {
        self.checkpoints
            .get_checkpoints(instance_id, page, page_size)
            .await
    }

    pub async fn get_checkpoint(&self, checkpoint_id: &Uuid) -> Result<WorkflowCheckpoint, WorkflowError> {
        self.checkpoints.get_checkpoint(checkpoint_id).await
    }

    pub async fn enqueue_input(
        &self,
        instance_id: &Uuid,
        user_id: &str,
        input_type: &str,
        content: Value,
    ) -> Result<QueuedInput, WorkflowError> {
        self.inputs
            .enqueue(instance_id, user_id, input_type, content)
            .await
    }

    pub async fn pending_inputs(&self, instance_id: &Uuid) -> Result<Vec<QueuedInput>, WorkflowError> {
        self.get_instance(instance_id).await?;
        self.inputs.pending(instance_id).await
    }

    // -----------------------------------------------------------------------
    // Caller-held context mutations
    // -----------------------------------------------------------------------

    pub async fn record_decision(
        &self,
        instance_id: &Uuid,
        actor_id: &str,
        decision_type: &str,
        value: Value,
        step_id: Option<&str>,
    ) -> Result<SharedContext, WorkflowError> {
        self.require(instance_id, LifecycleAction::UpdateContext).await?;
        let contexts = &self.contexts;
        contexts
            .apply_with_retry(instance_id, |current| {
                let decision = DecisionRecord::new(
                    decision_type,
                    value.clone(),
                    step_id.map(str::to_string),
                    actor_id,
                );
                async move { contexts.add_decision(&current, decision).await }
            })
            .await
    }

    pub async fn add_artifact_reference(
        &self,
        instance_id: &Uuid,
        actor_id: &str,
        name: &str,
        uri: &str,
        kind: Option<&str>,
    ) -> Result<SharedContext, WorkflowError> {
        self.require(instance_id, LifecycleAction::UpdateContext).await?;
        let contexts = &self.contexts;
        contexts
            .apply_with_retry(instance_id, |current| {
                let artifact =
                    ArtifactReference::new(name, uri, kind.map(str::to_string), actor_id);
                async move { contexts.add_artifact_reference(&current, artifact).await }
            })
            .await
    }

    pub async fn set_user_preferences(
        &self,
        instance_id: &Uuid,
        actor_id: &str,
        preferences: Value,
    ) -> Result<SharedContext, WorkflowError> {
        self.require(instance_id, LifecycleAction::UpdateContext).await?;
        let contexts = &self.contexts;
        contexts
            .apply_with_retry(instance_id, |current| {
                let preferences = preferences.clone();
                async move {
                    contexts
                        .set_user_preferences(&current, preferences, actor_id)
                        .await
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_instance(&self, instance_id: &Uuid) -> Result<WorkflowInstance, WorkflowError> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::instance_not_found(*instance_id))
    }

    pub async fn list_instances(&self, owner_id: Option<&str>) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        Ok(self.store.list_instances(owner_id).await?)
    }

    pub async fn step_history(&self, instance_id: &Uuid) -> Result<Vec<StepHistoryRecord>, WorkflowError> {
        self.get_instance(instance_id).await?;
        Ok(self.store.list_step_history(instance_id).await?)
    }

    pub async fn events(&self, instance_id: &Uuid) -> Result<Vec<WorkflowEvent>, WorkflowError> {
        self.get_instance(instance_id).await?;
        self.events.list(instance_id).await
    }

    pub async fn context(&self, instance_id: &Uuid) -> Result<SharedContext, WorkflowError> {
        self.contexts.get(instance_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowStore;
    use crate::workflow::agent::{AgentError, AgentInvoker, AgentRequest, AgentResponse};
    use crate::workflow::definition::parse_definition_yaml;
    use ensemble_types::config::CheckpointPolicy;
    use ensemble_types::workflow::StepHistoryStatus;

    const GREENFIELD: &str = r#"
id: greenfield
name: Greenfield
steps:
  - id: brief
    agent_capability: analyst
  - id: prd
    agent_capability: pm
    can_skip: true
  - id: architecture
    agent_capability: architect
"#;

    struct Writer;

    impl AgentInvoker for Writer {
        async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse {
                summary: format!("{} written by {}", request.step_id, request.capability),
                content: json!({ "doc": "x".repeat(120) }),
            })
        }
    }

    fn manager_with(config: EngineConfig) -> WorkflowInstanceManager<InMemoryWorkflowStore> {
        let mut catalog = WorkflowCatalog::new();
        catalog.register(parse_definition_yaml(GREENFIELD).unwrap()).unwrap();
        let agents = AgentRegistry::new()
            .with("analyst", Writer)
            .with("pm", Writer)
            .with("architect", Writer);
        WorkflowInstanceManager::new(Arc::new(InMemoryWorkflowStore::new()), catalog, agents, config)
    }

    fn manager() -> WorkflowInstanceManager<InMemoryWorkflowStore> {
        manager_with(EngineConfig::default())
    }

    fn hollow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "hollow".to_string(),
            name: "Hollow".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            steps: Vec::new(),
            metadata: Default::default(),
        }
    }

    async fn running(m: &WorkflowInstanceManager<InMemoryWorkflowStore>) -> Uuid {
        let instance = m.create("greenfield", "user-1", json!(null)).await.unwrap();
        m.start(&instance.id, "user-1").await.unwrap();
        instance.id
    }

    #[tokio::test]
    async fn create_yields_created_at_zero() {
        let m = manager();
        let instance = m
            .create("greenfield", "user-1", json!({"tone": "formal"}))
            .await
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Created);
        assert_eq!(instance.current_step_index, 0);

        let ctx = m.context(&instance.id).await.unwrap();
        assert_eq!(ctx.version, 1);
        assert_eq!(ctx.content.user_preferences, Some(json!({"tone": "formal"})));
    }

    #[tokio::test]
    async fn create_unknown_or_invalid_definition_is_not_found() {
        let mut catalog = WorkflowCatalog::new();
        catalog.register(hollow()).unwrap();
        let m = WorkflowInstanceManager::new(
            Arc::new(InMemoryWorkflowStore::new()),
            catalog,
            AgentRegistry::new(),
            EngineConfig::default(),
        );

        assert!(matches!(
            m.create("missing", "user-1", json!(null)).await,
            Err(WorkflowError::NotFound(_))
        ));
        assert!(matches!(
            m.create("hollow", "user-1", json!(null)).await,
            Err(WorkflowError::NotFound(_))
        ));
        assert!(m.list_instances(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_without_steps_is_validation_error() {
        let mut catalog = WorkflowCatalog::new();
        catalog.register(hollow()).unwrap();
        let m = WorkflowInstanceManager::new(
            Arc::new(InMemoryWorkflowStore::new()),
            catalog,
            AgentRegistry::new(),
            EngineConfig::default(),
        );

        // create refuses hollow definitions, so plant the instance directly
        let instance = WorkflowInstance::new("hollow", "user-1");
        let context = m.contexts.seed(instance.id, json!(null));
        let created = WorkflowEvent::new(instance.id, WorkflowEventType::Created, "user-1", json!({}));
        m.store.insert_instance(&instance, &context, &created).await.unwrap();

        assert!(matches!(
            m.start(&instance.id, "user-1").await,
            Err(WorkflowError::ValidationError(_))
        ));
        let stored = m.get_instance(&instance.id).await.unwrap();
        assert_eq!(stored.status, InstanceStatus::Created);
        assert_eq!(stored.current_step_index, 0);
    }

    #[tokio::test]
    async fn start_only_from_created_and_leaves_fields_on_failure() {
        let m = manager();
        let id = running(&m).await;

        let paused = m.pause(&id, "user-1").await.unwrap();
        let err = m.start(&id, "user-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { from: InstanceStatus::Paused, .. }));
        assert_eq!(m.get_instance(&id).await.unwrap(), paused);

        m.resume(&id, "user-1").await.unwrap();
        let before = m.get_instance(&id).await.unwrap();
        assert!(m.start(&id, "user-1").await.is_err());
        assert_eq!(m.get_instance(&id).await.unwrap(), before);

        let cancelled = m.cancel(&id, "user-1").await.unwrap();
        assert!(m.start(&id, "user-1").await.is_err());
        assert_eq!(m.get_instance(&id).await.unwrap(), cancelled);
    }

    #[tokio::test]
    async fn end_to_end_three_step_scenario() {
        let m = manager();
        let instance = m.create("greenfield", "user-1", json!(null)).await.unwrap();

        let started = m.start(&instance.id, "user-1").await.unwrap();
        assert_eq!(started.status, InstanceStatus::Running);
        assert_eq!(started.current_step_index, 1);

        let execution = m
            .execute_step(&instance.id, Some(json!("a todo app")))
            .await
            .unwrap();
        assert_eq!(execution.instance.current_step_index, 2);
        let history = m.step_history(&instance.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StepHistoryStatus::Completed);
        assert_eq!(m.context(&instance.id).await.unwrap().version, 2);

        let paused = m.pause(&instance.id, "user-1").await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert!(paused.paused_at.is_some());

        let resumed = m.resume(&instance.id, "user-1").await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Running);
        assert!(resumed.paused_at.is_none());

        let cancelled = m.cancel(&instance.id, "user-1").await.unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        assert!(matches!(
            m.start(&instance.id, "user-1").await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            m.resume(&instance.id, "user-1").await,
            Err(WorkflowError::InvalidTransition { .. })
        ));

        let types: Vec<_> = m
            .events(&instance.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types.first(), Some(&WorkflowEventType::Created));
        assert_eq!(types.last(), Some(&WorkflowEventType::Cancelled));
        assert!(types.contains(&WorkflowEventType::StepCompleted));
    }

    #[tokio::test]
    async fn pause_blocks_new_executions() {
        let m = manager();
        let id = running(&m).await;
        m.pause(&id, "user-1").await.unwrap();

        let err = m.execute_step(&id, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        assert!(m.step_history(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_from_terminal_fails() {
        let m = manager();
        let id = running(&m).await;
        m.cancel(&id, "user-1").await.unwrap();
        assert!(matches!(
            m.cancel(&id, "user-1").await,
            Err(WorkflowError::InvalidTransition { from: InstanceStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn skip_requires_can_skip() {
        let m = manager();
        let id = running(&m).await;

        let err = m.skip_step(&id, "user-1", "not needed").await.unwrap_err();
        assert!(matches!(err, WorkflowError::StepNotSkippable { ref step_id } if step_id == "brief"));
        assert_eq!(m.get_instance(&id).await.unwrap().current_step_index, 1);
        assert!(m.step_history(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn skip_records_reason_and_advances() {
        let m = manager();
        let id = running(&m).await;
        m.execute_step(&id, None).await.unwrap();

        let skipped = m.skip_step(&id, "user-1", "prd already exists").await.unwrap();
        assert_eq!(skipped.current_step_index, 3);

        let history = m.step_history(&id).await.unwrap();
        let record = history.iter().find(|h| h.step_id == "prd").unwrap();
        assert_eq!(record.status, StepHistoryStatus::Skipped);
        assert_eq!(record.reason.as_deref(), Some("prd already exists"));
        assert_eq!(record.actor_id.as_deref(), Some("user-1"));

        // one automatic checkpoint per completed or skipped step
        let page = m.list_checkpoints(&id, 1, None).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|c| c.checkpoint_type == CheckpointType::Automatic));
        let at_skip = page.items.iter().find(|c| c.step_id == "prd").unwrap();
        assert_eq!(at_skip.snapshot.current_step_index, 2);
    }

    #[tokio::test]
    async fn repeated_skip_counts_prior_attempts() {
        let m = manager();
        let id = running(&m).await;
        m.execute_step(&id, None).await.unwrap();

        m.skip_step(&id, "user-1", "first look").await.unwrap();
        m.go_to_step(&id, "prd", "user-1").await.unwrap();
        m.skip_step(&id, "user-1", "still not needed").await.unwrap();

        let attempts: Vec<_> = m
            .step_history(&id)
            .await
            .unwrap()
            .into_iter()
            .filter(|h| h.step_id == "prd")
            .map(|h| (h.attempt, h.status))
            .collect();
        assert_eq!(
            attempts,
            vec![(1, StepHistoryStatus::Skipped), (2, StepHistoryStatus::Skipped)]
        );
    }

    #[tokio::test]
    async fn completing_last_step_completes_instance() {
        let m = manager();
        let id = running(&m).await;
        for _ in 0..3 {
            m.execute_step(&id, None).await.unwrap();
        }
        let instance = m.get_instance(&id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.current_step_index, 3);
        assert!(instance.completed_at.is_some());

        assert!(matches!(
            m.start(&id, "user-1").await,
            Err(WorkflowError::InvalidTransition { from: InstanceStatus::Completed, .. })
        ));
        assert!(matches!(
            m.cancel(&id, "user-1").await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            m.record_decision(&id, "user-1", "late", json!(true), None).await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn go_to_step_retains_history_and_context() {
        let m = manager();
        let id = running(&m).await;
        m.execute_step(&id, None).await.unwrap();
        m.execute_step(&id, None).await.unwrap();

        let revisited = m.go_to_step(&id, "brief", "user-1").await.unwrap();
        assert_eq!(revisited.current_step_index, 1);
        assert_eq!(m.step_history(&id).await.unwrap().len(), 2);
        assert_eq!(m.context(&id).await.unwrap().content.step_outputs.len(), 2);

        m.execute_step(&id, Some(json!("second pass"))).await.unwrap();
        let history = m.step_history(&id).await.unwrap();
        let attempts: Vec<_> = history
            .iter()
            .filter(|h| h.step_id == "brief")
            .map(|h| h.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(m.context(&id).await.unwrap().content.step_outputs.len(), 2);

        assert!(matches!(
            m.go_to_step(&id, "deploy", "user-1").await,
            Err(WorkflowError::NotFound(_))
        ));
        let events = m.events(&id).await.unwrap();
        let revisit = events
            .iter()
            .find(|e| e.event_type == WorkflowEventType::Revisit)
            .unwrap();
        assert_eq!(revisit.payload["from_step_index"], json!(3));
        assert_eq!(revisit.payload["to_step_index"], json!(1));
    }

    #[tokio::test]
    async fn restore_returns_to_checkpoint_position() {
        let m = manager_with(EngineConfig {
            checkpoint_policy: CheckpointPolicy::ExplicitOnly,
            ..EngineConfig::default()
        });
        let id = running(&m).await;
        m.execute_step(&id, None).await.unwrap();

        let checkpoint = m.create_checkpoint(&id, "user-1").await.unwrap();
        assert_eq!(checkpoint.snapshot.current_step_index, 2);
        assert_eq!(checkpoint.step_id, "prd");

        m.execute_step(&id, None).await.unwrap();
        m.record_decision(&id, "user-1", "database", json!("postgres"), None)
            .await
            .unwrap();
        let before = m.context(&id).await.unwrap().version;

        let restored = m.restore_checkpoint(&id, &checkpoint.id, "user-1").await.unwrap();
        assert_eq!(restored.current_step_index, 2);
        let ctx = m.context(&id).await.unwrap();
        assert_eq!(ctx.content, checkpoint.snapshot.context_content);
        assert!(ctx.version > before);

        // history is never rewritten by a restore
        assert_eq!(m.step_history(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restoring_automatic_checkpoint_returns_to_completed_step() {
        let m = manager();
        let id = running(&m).await;
        m.execute_step(&id, None).await.unwrap();

        let checkpoint = m.list_checkpoints(&id, 1, None).await.unwrap().items[0].clone();
        assert_eq!(checkpoint.checkpoint_type, CheckpointType::Automatic);
        assert_eq!(checkpoint.step_id, "brief");
        assert_eq!(checkpoint.snapshot.current_step_index, 1);

        m.execute_step(&id, None).await.unwrap();
        let before = m.context(&id).await.unwrap().version;

        let restored = m.restore_checkpoint(&id, &checkpoint.id, "user-1").await.unwrap();
        assert_eq!(restored.current_step_index, 1);
        assert_eq!(restored.status, InstanceStatus::Running);

        let ctx = m.context(&id).await.unwrap();
        assert_eq!(ctx.content, checkpoint.snapshot.context_content);
        assert!(ctx.version > before);
        assert!(ctx.content.step_outputs.contains_key("brief"));
        assert!(!ctx.content.step_outputs.contains_key("prd"));
    }

    #[tokio::test]
    async fn queued_inputs_apply_at_next_checkpoint() {
        let m = manager();
        let id = running(&m).await;
        m.enqueue_input(&id, "user-2", "preferences", json!({"tone": "casual"}))
            .await
            .unwrap();
        m.enqueue_input(&id, "user-2", "artifact", json!({"name": "Brief", "uri": "file://brief.md"}))
            .await
            .unwrap();
        assert_eq!(m.context(&id).await.unwrap().version, 1);
        assert_eq!(m.pending_inputs(&id).await.unwrap().len(), 2);

        // step completion bumps to 2, the automatic checkpoint applies inputs as 3
        m.execute_step(&id, None).await.unwrap();
        let ctx = m.context(&id).await.unwrap();
        assert_eq!(ctx.version, 3);
        assert_eq!(ctx.content.user_preferences, Some(json!({"tone": "casual"})));
        assert_eq!(ctx.content.artifact_references[0].name, "Brief");
        assert!(m.pending_inputs(&id).await.unwrap().is_empty());

        let checkpoint = &m.list_checkpoints(&id, 1, None).await.unwrap().items[0];
        assert_eq!(checkpoint.snapshot.context_version, 3);
    }

    #[tokio::test]
    async fn summary_kicks_in_over_token_limit() {
        let m = manager_with(EngineConfig {
            max_context_tokens: 60,
            ..EngineConfig::default()
        });
        let id = running(&m).await;
        m.record_decision(&id, "user-1", "platform", json!("web"), Some("brief"))
            .await
            .unwrap();
        m.execute_step(&id, None).await.unwrap();
        m.execute_step(&id, None).await.unwrap();

        let ctx = m.context(&id).await.unwrap();
        let summary = ctx.context_summary.clone().unwrap();
        assert!(summary.contains("Key Decisions:"));
        assert_eq!(ctx.content.step_outputs.len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_committed_events() {
        let m = manager();
        let mut rx = m.subscribe();
        let id = running(&m).await;

        assert_eq!(rx.recv().await.unwrap().event_type, WorkflowEventType::Created);
        let started = rx.recv().await.unwrap();
        assert_eq!(started.event_type, WorkflowEventType::Started);
        assert_eq!(started.instance_id, id);
    }
}
