//! Per-instance FIFO of externally submitted inputs.
//!
//! Inputs are never applied on arrival. They wait until the next checkpoint
//! boundary, where the whole pending batch is folded into the shared context
//! as a single versioned mutation.

use std::sync::Arc;

use chrono::Utc;
use ensemble_types::config::EngineConfig;
use ensemble_types::context::{ArtifactReference, ContextContent, DecisionRecord, SharedContext};
use ensemble_types::error::WorkflowError;
use ensemble_types::event::{WorkflowEvent, WorkflowEventType};
use ensemble_types::workflow::{LifecycleAction, QueuedInput};
use serde_json::{Value, json};
use uuid::Uuid;

use super::context::SharedContextStore;
use crate::event::EventLog;
use crate::repository::{CommitOutcome, WorkflowStore};

/// Input type applied as an artifact reference.
pub const INPUT_TYPE_ARTIFACT: &str = "artifact";
/// Input type merged into the user preferences.
pub const INPUT_TYPE_PREFERENCES: &str = "preferences";

/// Fold one input into context content.
///
/// - `artifact`: `{name, uri, kind?}` or a bare URI string becomes an
///   artifact reference. Anything else is kept as an `artifact` decision.
/// - `preferences`: merged into the user preferences.
/// - any other type: recorded as a decision of that type.
pub fn apply_input(content: &mut ContextContent, input: &QueuedInput) {
    match input.input_type.as_str() {
        INPUT_TYPE_ARTIFACT => match artifact_from(&input.content, &input.user_id) {
            Some(artifact) => content.artifact_references.push(artifact),
            None => content.decision_history.push(decision_from(input)),
        },
        INPUT_TYPE_PREFERENCES => content.merge_preferences(input.content.clone()),
        _ => content.decision_history.push(decision_from(input)),
    }
}

fn artifact_from(value: &Value, user_id: &str) -> Option<ArtifactReference> {
    match value {
        Value::String(uri) if !uri.is_empty() => {
            Some(ArtifactReference::new(uri.clone(), uri.clone(), None, user_id))
        }
        Value::Object(map) => {
            let uri = map.get("uri")?.as_str()?;
            let name = map.get("name").and_then(Value::as_str).unwrap_or(uri);
            let kind = map.get("kind").and_then(Value::as_str).map(str::to_string);
            let mut artifact = ArtifactReference::new(name, uri, kind, user_id);
            artifact.step_id = map.get("step_id").and_then(Value::as_str).map(str::to_string);
            Some(artifact)
        }
        _ => None,
    }
}

fn decision_from(input: &QueuedInput) -> DecisionRecord {
    DecisionRecord::new(
        input.input_type.clone(),
        input.content.clone(),
        None,
        input.user_id.clone(),
    )
}

/// Buffers inputs until a checkpoint drains them.
pub struct InputQueue<S: WorkflowStore> {
    store: Arc<S>,
    events: Arc<EventLog<S>>,
    contexts: Arc<SharedContextStore<S>>,
    write_attempts: u32,
}

impl<S: WorkflowStore> InputQueue<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<EventLog<S>>,
        contexts: Arc<SharedContextStore<S>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            contexts,
            write_attempts: config.context_write_attempts.max(1),
        }
    }

    /// Append an input to the instance's queue.
    ///
    /// Fails `NotFound` for unknown instances and `InvalidTransition` for
    /// completed or cancelled ones.
    pub async fn enqueue(
        &self,
        instance_id: &Uuid,
        user_id: &str,
        input_type: &str,
        content: Value,
    ) -> Result<QueuedInput, WorkflowError> {
        if input_type.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "input type must not be empty".to_string(),
            ));
        }
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::instance_not_found(*instance_id))?;
        if !instance.status.permits(LifecycleAction::EnqueueInput) {
            return Err(WorkflowError::InvalidTransition {
                instance_id: *instance_id,
                from: instance.status,
                action: LifecycleAction::EnqueueInput,
            });
        }

        let input = QueuedInput {
            id: Uuid::now_v7(),
            instance_id: *instance_id,
            user_id: user_id.to_string(),
            input_type: input_type.to_string(),
            content,
            enqueued_at: Utc::now(),
            drained_at: None,
        };
        let event = WorkflowEvent::new(
            *instance_id,
            WorkflowEventType::InputQueued,
            user_id,
            json!({ "input_id": input.id, "input_type": input.input_type }),
        );
        if self.store.enqueue_input(&input, &event).await? != CommitOutcome::Committed {
            // Completed or cancelled between the read and the insert.
            let from = self
                .store
                .get_instance(instance_id)
                .await?
                .map_or(instance.status, |current| current.status);
            return Err(WorkflowError::InvalidTransition {
                instance_id: *instance_id,
                from,
                action: LifecycleAction::EnqueueInput,
            });
        }
        tracing::info!(
            instance_id = %instance_id,
            input_id = %input.id,
            input_type,
            "input queued"
        );
        self.events.announce([event]);
        Ok(input)
    }

    /// Inputs waiting for the next checkpoint, oldest first.
    pub async fn pending(&self, instance_id: &Uuid) -> Result<Vec<QueuedInput>, WorkflowError> {
        Ok(self.store.list_pending_inputs(instance_id).await?)
    }

    /// Every input ever queued for the instance, drained or not.
    pub async fn all(&self, instance_id: &Uuid) -> Result<Vec<QueuedInput>, WorkflowError> {
        Ok(self.store.list_inputs(instance_id).await?)
    }

    /// Apply every pending input to the context as one mutation.
    ///
    /// Returns the resulting context and how many inputs were applied. With
    /// nothing pending the current context is returned untouched.
    pub async fn drain(
        &self,
        instance_id: &Uuid,
        actor_id: &str,
    ) -> Result<(SharedContext, usize), WorkflowError> {
        let mut attempt = 1;
        loop {
            let current = self.contexts.get(instance_id).await?;
            let pending = self.store.list_pending_inputs(instance_id).await?;
            if pending.is_empty() {
                return Ok((current, 0));
            }

            let mut content = current.content.clone();
            for input in &pending {
                apply_input(&mut content, input);
            }
            let ids: Vec<Uuid> = pending.iter().map(|i| i.id).collect();
            let event = WorkflowEvent::new(
                *instance_id,
                WorkflowEventType::InputsApplied,
                actor_id,
                json!({ "count": ids.len(), "input_ids": ids }),
            );

            match self.contexts.save(&current, content, ids, Some(event)).await {
                Ok(context) => {
                    tracing::info!(
                        instance_id = %instance_id,
                        count = pending.len(),
                        version = context.version,
                        "queued inputs applied"
                    );
                    return Ok((context, pending.len()));
                }
                Err(e) if e.is_retryable() && attempt < self.write_attempts => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::{InMemoryWorkflowStore, InstanceCommit, InstanceGuard};
    use ensemble_types::workflow::{InstanceStatus, WorkflowInstance};

    struct Fixture {
        store: Arc<InMemoryWorkflowStore>,
        queue: InputQueue<InMemoryWorkflowStore>,
        instance: WorkflowInstance,
    }

    async fn fixture() -> Fixture {
        let config = EngineConfig::default();
        let store = Arc::new(InMemoryWorkflowStore::new());
        let events = Arc::new(EventLog::new(store.clone(), EventBus::new(16)));
        let contexts = Arc::new(SharedContextStore::new(store.clone(), events.clone(), &config));
        let queue = InputQueue::new(store.clone(), events, contexts.clone(), &config);

        let instance = WorkflowInstance::new("greenfield", "user-1");
        let seeded = contexts.seed(instance.id, json!({"tone": "formal"}));
        let created = WorkflowEvent::new(instance.id, WorkflowEventType::Created, "user-1", json!({}));
        store.insert_instance(&instance, &seeded, &created).await.unwrap();
        Fixture { store, queue, instance }
    }

    fn input(input_type: &str, content: Value) -> QueuedInput {
        QueuedInput {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            user_id: "user-1".to_string(),
            input_type: input_type.to_string(),
            content,
            enqueued_at: Utc::now(),
            drained_at: None,
        }
    }

    #[test]
    fn apply_input_maps_by_type() {
        let mut content = ContextContent::seeded(json!({"tone": "formal"}));

        apply_input(&mut content, &input("artifact", json!({"name": "PRD", "uri": "file://prd.md", "kind": "doc"})));
        apply_input(&mut content, &input("artifact", json!("https://example.com/brief")));
        apply_input(&mut content, &input("artifact", json!({"name": "no uri"})));
        apply_input(&mut content, &input("preferences", json!({"tone": "casual"})));
        apply_input(&mut content, &input("scope", json!("mvp only")));

        assert_eq!(content.artifact_references.len(), 2);
        assert_eq!(content.artifact_references[0].name, "PRD");
        assert_eq!(content.artifact_references[0].kind.as_deref(), Some("doc"));
        assert_eq!(content.artifact_references[1].uri, "https://example.com/brief");
        assert_eq!(content.user_preferences, Some(json!({"tone": "casual"})));

        let types: Vec<_> = content
            .decision_history
            .iter()
            .map(|d| d.decision_type.as_str())
            .collect();
        assert_eq!(types, vec!["artifact", "scope"]);
    }

    #[tokio::test]
    async fn enqueue_does_not_touch_context_until_drained() {
        let f = fixture().await;
        f.queue.enqueue(&f.instance.id, "user-1", "scope", json!("mvp")).await.unwrap();
        f.queue.enqueue(&f.instance.id, "user-2", "budget", json!(1000)).await.unwrap();

        let ctx = f.store.get_context(&f.instance.id).await.unwrap().unwrap();
        assert_eq!(ctx.version, 1);
        assert_eq!(f.queue.pending(&f.instance.id).await.unwrap().len(), 2);

        let (ctx, applied) = f.queue.drain(&f.instance.id, "system").await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(ctx.version, 2);
        let types: Vec<_> = ctx
            .content
            .decision_history
            .iter()
            .map(|d| d.decision_type.as_str())
            .collect();
        assert_eq!(types, vec!["scope", "budget"]);

        assert!(f.queue.pending(&f.instance.id).await.unwrap().is_empty());
        assert_eq!(f.queue.all(&f.instance.id).await.unwrap().len(), 2);

        let (ctx, applied) = f.queue.drain(&f.instance.id, "system").await.unwrap();
        assert_eq!(applied, 0);
        assert_eq!(ctx.version, 2);
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_and_terminal_instances() {
        let f = fixture().await;
        let missing = f
            .queue
            .enqueue(&Uuid::now_v7(), "user-1", "scope", json!("mvp"))
            .await
            .unwrap_err();
        assert!(matches!(missing, WorkflowError::NotFound(_)));

        let mut cancelled = f.instance.clone();
        cancelled.status = InstanceStatus::Cancelled;
        cancelled.cancelled_at = Some(Utc::now());
        f.store
            .commit(&InstanceCommit {
                guard: InstanceGuard::from(&f.instance),
                instance: cancelled,
                context: None,
                history: None,
                events: Vec::new(),
            })
            .await
            .unwrap();

        let err = f
            .queue
            .enqueue(&f.instance.id, "user-1", "scope", json!("mvp"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }
}
