//! Immutable point-in-time snapshots of instance and context state.
//!
//! A checkpoint is also the application boundary for queued inputs: pending
//! inputs are folded into the context before the snapshot is captured.
//! The snapshot cursor is the position of the checkpoint's step, so an
//! automatic checkpoint taken after step k restores to step k.
//! Restoring overwrites the instance's status and cursor and replaces the
//! context content under a version strictly above the current one.

use std::sync::Arc;

use chrono::Utc;
use ensemble_types::config::EngineConfig;
use ensemble_types::error::WorkflowError;
use ensemble_types::event::{WorkflowEvent, WorkflowEventType};
use ensemble_types::workflow::{
    CheckpointSnapshot, CheckpointType, InstanceStatus, LifecycleAction, Page, WorkflowCheckpoint,
    WorkflowInstance,
};
use serde_json::json;
use uuid::Uuid;

use super::catalog::WorkflowCatalog;
use super::context::SharedContextStore;
use super::input_queue::InputQueue;
use crate::event::EventLog;
use crate::repository::{CommitOutcome, ContextWrite, InstanceCommit, InstanceGuard, WorkflowStore};

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Creates, lists and restores checkpoints.
///
/// Generic over `S: WorkflowStore` so it works with any storage backend.
pub struct CheckpointStore<S: WorkflowStore> {
    store: Arc<S>,
    events: Arc<EventLog<S>>,
    contexts: Arc<SharedContextStore<S>>,
    inputs: Arc<InputQueue<S>>,
    catalog: Arc<WorkflowCatalog>,
    write_attempts: u32,
    default_page_size: u32,
}

impl<S: WorkflowStore> CheckpointStore<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<EventLog<S>>,
        contexts: Arc<SharedContextStore<S>>,
        inputs: Arc<InputQueue<S>>,
        catalog: Arc<WorkflowCatalog>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            contexts,
            inputs,
            catalog,
            write_attempts: config.context_write_attempts.max(1),
            default_page_size: config.default_page_size.max(1),
        }
    }

    async fn load_instance(&self, instance_id: &Uuid) -> Result<WorkflowInstance, WorkflowError> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::instance_not_found(*instance_id))
    }

    /// Capture the instance and its context.
    ///
    /// Pending queued inputs are applied first. The snapshot is taken from a
    /// read of the context bracketed by two identical instance reads, so the
    /// cursor and the context belong together.
    pub async fn create_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        checkpoint_type: CheckpointType,
        actor_id: &str,
    ) -> Result<WorkflowCheckpoint, WorkflowError> {
        let instance = self.load_instance(instance_id).await?;
        if !instance.status.permits(LifecycleAction::Checkpoint) {
            return Err(WorkflowError::InvalidTransition {
                instance_id: *instance_id,
                from: instance.status,
                action: LifecycleAction::Checkpoint,
            });
        }

        self.inputs.drain(instance_id, actor_id).await?;

        let mut attempt = 1;
        let (instance, context) = loop {
            let before = self.load_instance(instance_id).await?;
            let context = self.contexts.get(instance_id).await?;
            let after = self.load_instance(instance_id).await?;
            if InstanceGuard::from(&before) == InstanceGuard::from(&after) {
                break (after, context);
            }
            if attempt >= self.write_attempts {
                return Err(WorkflowError::ConcurrencyConflict {
                    instance_id: *instance_id,
                    detail: "instance kept changing while capturing a checkpoint".to_string(),
                });
            }
            attempt += 1;
        };

        let current_step_index = self
            .catalog
            .get(&instance.definition_id)
            .ok()
            .and_then(|definition| definition.position_of(step_id))
            .unwrap_or(instance.current_step_index);

        let checkpoint = WorkflowCheckpoint {
            id: Uuid::now_v7(),
            instance_id: *instance_id,
            step_id: step_id.to_string(),
            checkpoint_type,
            created_by: actor_id.to_string(),
            created_at: Utc::now(),
            snapshot: CheckpointSnapshot {
                status: instance.status,
                current_step_index,
                context_version: context.version,
                context_content: context.content,
            },
        };
        let event = WorkflowEvent::new(
            *instance_id,
            WorkflowEventType::CheckpointCreated,
            actor_id,
            json!({
                "checkpoint_id": checkpoint.id,
                "step_id": checkpoint.step_id,
                "type": checkpoint_type.as_str(),
                "context_version": checkpoint.snapshot.context_version,
            }),
        );
        self.store.insert_checkpoint(&checkpoint, &event).await?;

        tracing::debug!(
            instance_id = %instance_id,
            checkpoint_id = %checkpoint.id,
            step_id,
            checkpoint_type = checkpoint_type.as_str(),
            context_version = checkpoint.snapshot.context_version,
            "checkpoint captured"
        );
        self.events.announce([event]);
        Ok(checkpoint)
    }

    /// Roll an instance back (or forward) to a checkpoint it owns.
    ///
    /// Fails `NotFound` if the checkpoint is missing or belongs to another
    /// instance, `InvalidTransition` if the instance is not running or paused.
    pub async fn restore_checkpoint(
        &self,
        instance_id: &Uuid,
        checkpoint_id: &Uuid,
        actor_id: &str,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .filter(|cp| cp.instance_id == *instance_id)
            .ok_or_else(|| {
                WorkflowError::NotFound(format!(
                    "checkpoint {checkpoint_id} for instance {instance_id}"
                ))
            })?;
        let snapshot = &checkpoint.snapshot;
        if snapshot.status == InstanceStatus::Created {
            return Err(WorkflowError::ValidationError(format!(
                "checkpoint {checkpoint_id} was taken before the instance started"
            )));
        }

        let mut attempt = 1;
        loop {
            let current = self.load_instance(instance_id).await?;
            if !current.status.permits(LifecycleAction::Restore) {
                return Err(WorkflowError::InvalidTransition {
                    instance_id: *instance_id,
                    from: current.status,
                    action: LifecycleAction::Restore,
                });
            }
            let context = self.contexts.get(instance_id).await?;
            let restored_context = self.contexts.with_version(
                &context,
                snapshot.context_content.clone(),
                context.version + 1,
            );

            let now = Utc::now();
            let mut restored = current.clone();
            restored.status = snapshot.status;
            restored.current_step_index = snapshot.current_step_index;
            restored.updated_at = now;
            restored.paused_at = match snapshot.status {
                InstanceStatus::Paused => current.paused_at.or(Some(now)),
                _ => None,
            };
            restored.completed_at = (snapshot.status == InstanceStatus::Completed).then_some(now);
            restored.cancelled_at = None;

            let event = WorkflowEvent::new(
                *instance_id,
                WorkflowEventType::CheckpointRestored,
                actor_id,
                json!({
                    "checkpoint_id": checkpoint_id,
                    "from_status": current.status,
                    "to_status": restored.status,
                    "from_step_index": current.current_step_index,
                    "to_step_index": restored.current_step_index,
                    "context_version": restored_context.version,
                }),
            );
            let commit = InstanceCommit {
                guard: InstanceGuard::from(&current),
                instance: restored,
                context: Some(ContextWrite {
                    expected_version: context.version,
                    context: restored_context,
                }),
                history: None,
                events: vec![event],
            };

            match self.store.commit(&commit).await? {
                CommitOutcome::Committed => {
                    tracing::info!(
                        instance_id = %instance_id,
                        checkpoint_id = %checkpoint_id,
                        step_index = commit.instance.current_step_index,
                        context_version = context.version + 1,
                        "checkpoint restored"
                    );
                    self.events.announce(commit.events);
                    return Ok(commit.instance);
                }
                outcome if attempt < self.write_attempts => {
                    tracing::debug!(instance_id = %instance_id, ?outcome, attempt, "restore raced, retrying");
                    attempt += 1;
                }
                outcome => {
                    return Err(WorkflowError::ConcurrencyConflict {
                        instance_id: *instance_id,
                        detail: format!("restore of checkpoint {checkpoint_id} lost a race ({outcome:?})"),
                    });
                }
            }
        }
    }

    /// One page of an instance's checkpoints, oldest first.
    ///
    /// `page` is 1-based; `page_size` falls back to the configured default.
    pub async fn get_checkpoints(
        &self,
        instance_id: &Uuid,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<Page<WorkflowCheckpoint>, WorkflowError> {
        let page_size = page_size.unwrap_or(self.default_page_size);
        if page == 0 || page_size == 0 {
            return Err(WorkflowError::ValidationError(
                "page and page size must be at least 1".to_string(),
            ));
        }
        self.load_instance(instance_id).await?;

        let offset = u64::from(page - 1) * u64::from(page_size);
        let items = self
            .store
            .list_checkpoints(instance_id, offset, page_size)
            .await?;
        let total = self.store.count_checkpoints(instance_id).await?;
        Ok(Page {
            items,
            page,
            page_size,
            total,
        })
    }

    pub async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<WorkflowCheckpoint, WorkflowError> {
        self.store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("checkpoint {checkpoint_id}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
