//! In-memory `WorkflowStore` implementation.
//!
//! Each instance owns one `InstanceRecord` holding its context, history,
//! checkpoints, events and inputs. All writes for an instance happen under
//! that record's `DashMap` entry lock, which makes every composite commit
//! atomic with respect to other callers.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ensemble_types::context::SharedContext;
use ensemble_types::error::RepositoryError;
use ensemble_types::event::WorkflowEvent;
use ensemble_types::workflow::{
    QueuedInput, StepHistoryRecord, WorkflowCheckpoint, WorkflowInstance,
};
use uuid::Uuid;

use super::workflow::{
    CommitOutcome, ContextCommit, InstanceCommit, InstanceGuard, WorkflowStore,
};

struct InstanceRecord {
    instance: WorkflowInstance,
    context: SharedContext,
    history: Vec<StepHistoryRecord>,
    checkpoints: Vec<WorkflowCheckpoint>,
    events: Vec<WorkflowEvent>,
    inputs: Vec<QueuedInput>,
}

/// Process-local store backed by `DashMap`.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    records: DashMap<Uuid, InstanceRecord>,
    /// Checkpoint ID -> owning instance ID.
    checkpoint_owners: DashMap<Uuid, Uuid>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        context: &SharedContext,
        event: &WorkflowEvent,
    ) -> Result<(), RepositoryError> {
        match self.records.entry(instance.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(InstanceRecord {
                    instance: instance.clone(),
                    context: context.clone(),
                    history: Vec::new(),
                    checkpoints: Vec::new(),
                    events: vec![event.clone()],
                    inputs: Vec::new(),
                });
                Ok(())
            }
        }
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.records.get(id).map(|r| r.instance.clone()))
    }

    async fn list_instances(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<WorkflowInstance> = self
            .records
            .iter()
            .filter(|r| owner_id.is_none_or(|owner| r.instance.owner_id == owner))
            .map(|r| r.instance.clone())
            .collect();
        instances.sort_by_key(|i| (i.created_at, i.id));
        Ok(instances)
    }

    async fn commit(&self, commit: &InstanceCommit) -> Result<CommitOutcome, RepositoryError> {
        let mut record = self
            .records
            .get_mut(&commit.instance.id)
            .ok_or(RepositoryError::NotFound)?;

        if InstanceGuard::from(&record.instance) != commit.guard {
            return Ok(CommitOutcome::InstanceChanged);
        }
        if let Some(write) = &commit.context {
            if record.context.version != write.expected_version {
                return Ok(CommitOutcome::ContextConflict);
            }
        }

        record.instance = commit.instance.clone();
        if let Some(write) = &commit.context {
            record.context = write.context.clone();
        }
        if let Some(history) = &commit.history {
            match record.history.iter_mut().find(|h| h.id == history.id) {
                Some(existing) => *existing = history.clone(),
                None => record.history.push(history.clone()),
            }
        }
        record.events.extend(commit.events.iter().cloned());
        Ok(CommitOutcome::Committed)
    }

    async fn append_step_history(&self, record: &StepHistoryRecord) -> Result<(), RepositoryError> {
        let mut entry = self
            .records
            .get_mut(&record.instance_id)
            .ok_or(RepositoryError::NotFound)?;
        if entry.history.iter().any(|h| h.id == record.id) {
            return Err(RepositoryError::Conflict(format!(
                "step history {} already exists",
                record.id
            )));
        }
        entry.history.push(record.clone());
        Ok(())
    }

    async fn update_step_history(&self, record: &StepHistoryRecord) -> Result<(), RepositoryError> {
        let mut entry = self
            .records
            .get_mut(&record.instance_id)
            .ok_or(RepositoryError::NotFound)?;
        let existing = entry
            .history
            .iter_mut()
            .find(|h| h.id == record.id)
            .ok_or(RepositoryError::NotFound)?;
        *existing = record.clone();
        Ok(())
    }

    async fn list_step_history(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<StepHistoryRecord>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|r| r.history.clone())
            .unwrap_or_default())
    }

    async fn get_context(&self, instance_id: &Uuid) -> Result<Option<SharedContext>, RepositoryError> {
        Ok(self.records.get(instance_id).map(|r| r.context.clone()))
    }

    async fn save_context(&self, commit: &ContextCommit) -> Result<CommitOutcome, RepositoryError> {
        let instance_id = commit.write.context.instance_id;
        let mut record = self
            .records
            .get_mut(&instance_id)
            .ok_or(RepositoryError::NotFound)?;
        if record.context.version != commit.write.expected_version {
            return Ok(CommitOutcome::ContextConflict);
        }

        record.context = commit.write.context.clone();
        if !commit.drained_inputs.is_empty() {
            let now = commit.write.context.updated_at;
            for input in record
                .inputs
                .iter_mut()
                .filter(|i| i.drained_at.is_none() && commit.drained_inputs.contains(&i.id))
            {
                input.drained_at = Some(now);
            }
        }
        if let Some(event) = &commit.event {
            record.events.push(event.clone());
        }
        Ok(CommitOutcome::Committed)
    }

    async fn insert_checkpoint(
        &self,
        checkpoint: &WorkflowCheckpoint,
        event: &WorkflowEvent,
    ) -> Result<(), RepositoryError> {
        let mut record = self
            .records
            .get_mut(&checkpoint.instance_id)
            .ok_or(RepositoryError::NotFound)?;
        record.checkpoints.push(checkpoint.clone());
        record.events.push(event.clone());
        self.checkpoint_owners
            .insert(checkpoint.id, checkpoint.instance_id);
        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        let Some(owner) = self.checkpoint_owners.get(id).map(|o| *o) else {
            return Ok(None);
        };
        Ok(self
            .records
            .get(&owner)
            .and_then(|r| r.checkpoints.iter().find(|c| c.id == *id).cloned()))
    }

    async fn list_checkpoints(
        &self,
        instance_id: &Uuid,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<WorkflowCheckpoint>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|r| {
                r.checkpoints
                    .iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_checkpoints(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|r| r.checkpoints.len() as u64)
            .unwrap_or(0))
    }

    async fn append_event(&self, event: &WorkflowEvent) -> Result<(), RepositoryError> {
        let mut record = self
            .records
            .get_mut(&event.instance_id)
            .ok_or(RepositoryError::NotFound)?;
        record.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, instance_id: &Uuid) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|r| r.events.clone())
            .unwrap_or_default())
    }

    async fn enqueue_input(
        &self,
        input: &QueuedInput,
        event: &WorkflowEvent,
    ) -> Result<CommitOutcome, RepositoryError> {
        let mut record = self
            .records
            .get_mut(&input.instance_id)
            .ok_or(RepositoryError::NotFound)?;
        if record.instance.status.is_terminal() {
            return Ok(CommitOutcome::InstanceChanged);
        }
        record.inputs.push(input.clone());
        record.events.push(event.clone());
        Ok(CommitOutcome::Committed)
    }

    async fn list_pending_inputs(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<QueuedInput>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|r| {
                r.inputs
                    .iter()
                    .filter(|i| i.drained_at.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_inputs(&self, instance_id: &Uuid) -> Result<Vec<QueuedInput>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|r| r.inputs.clone())
            .unwrap_or_default())
    }
}
