//! Workflow store trait definition.
//!
//! Defines the persistence interface for instances, step history, shared
//! contexts, checkpoints, audit events, and queued inputs. The infrastructure
//! layer (ensemble-infra) implements this trait with SQLite persistence;
//! `InMemoryWorkflowStore` implements it for tests and embedding.

use ensemble_types::context::SharedContext;
use ensemble_types::error::RepositoryError;
use ensemble_types::event::WorkflowEvent;
use ensemble_types::workflow::{
    InstanceStatus, QueuedInput, StepHistoryRecord, WorkflowCheckpoint, WorkflowInstance,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Commit payloads
// ---------------------------------------------------------------------------

/// The instance fields a composite commit was computed against.
///
/// A commit applies only while the stored instance still has this status and
/// cursor. Any other lifecycle change in between makes the commit stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceGuard {
    pub status: InstanceStatus,
    pub current_step_index: u32,
}

impl From<&WorkflowInstance> for InstanceGuard {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            status: instance.status,
            current_step_index: instance.current_step_index,
        }
    }
}

/// A conditional shared-context write.
#[derive(Debug, Clone)]
pub struct ContextWrite {
    /// Version the caller read; the write applies only if it is still current.
    pub expected_version: u64,
    /// The new context; its `version` must be `expected_version + 1` or more.
    pub context: SharedContext,
}

/// A lifecycle change applied atomically.
///
/// The instance row, the optional context write, the optional history record
/// (inserted or replaced by ID), and the events are written together or not
/// at all.
#[derive(Debug, Clone)]
pub struct InstanceCommit {
    pub guard: InstanceGuard,
    pub instance: WorkflowInstance,
    pub context: Option<ContextWrite>,
    pub history: Option<StepHistoryRecord>,
    pub events: Vec<WorkflowEvent>,
}

/// A context-only change applied atomically.
#[derive(Debug, Clone)]
pub struct ContextCommit {
    pub write: ContextWrite,
    /// Queued inputs consumed by this write; marked drained in the same commit.
    pub drained_inputs: Vec<Uuid>,
    pub event: Option<WorkflowEvent>,
}

/// Result of a conditional commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The instance no longer matches the guard.
    InstanceChanged,
    /// The context version moved past the expected version.
    ContextConflict,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Storage port for the workflow engine.
///
/// Covers six entity families keyed by instance ID:
/// - **Instances:** insert once, then change only through guarded commits.
/// - **Step history:** one record per attempt, append-only once finalized.
/// - **Contexts:** versioned, conditionally written.
/// - **Checkpoints:** immutable snapshots.
/// - **Events:** append-only audit trail.
/// - **Queued inputs:** FIFO per instance, drained rows retained.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance with its seeded context and creation event.
    ///
    /// Fails with `Conflict` if the instance ID already exists.
    fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        context: &SharedContext,
        event: &WorkflowEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances oldest first, optionally filtered by owner.
    fn list_instances(
        &self,
        owner_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Apply a guarded lifecycle commit.
    ///
    /// Fails with `NotFound` if the instance does not exist.
    fn commit(
        &self,
        commit: &InstanceCommit,
    ) -> impl std::future::Future<Output = Result<CommitOutcome, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step history
    // -----------------------------------------------------------------------

    /// Append a new attempt record.
    fn append_step_history(
        &self,
        record: &StepHistoryRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace an existing attempt record by ID. Fails with `NotFound` if absent.
    fn update_step_history(
        &self,
        record: &StepHistoryRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All attempt records for an instance, in start order.
    fn list_step_history(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepHistoryRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Contexts
    // -----------------------------------------------------------------------

    fn get_context(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SharedContext>, RepositoryError>> + Send;

    /// Conditionally write a context, mark consumed inputs, append the event.
    ///
    /// Returns `ContextConflict` without side effects if the stored version is
    /// not `expected_version`.
    fn save_context(
        &self,
        commit: &ContextCommit,
    ) -> impl std::future::Future<Output = Result<CommitOutcome, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Persist a checkpoint with its creation event.
    ///
    /// Fails with `NotFound` if the instance does not exist.
    fn insert_checkpoint(
        &self,
        checkpoint: &WorkflowCheckpoint,
        event: &WorkflowEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_checkpoint(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowCheckpoint>, RepositoryError>> + Send;

    /// Checkpoints of an instance, oldest first.
    fn list_checkpoints(
        &self,
        instance_id: &Uuid,
        offset: u64,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowCheckpoint>, RepositoryError>> + Send;

    fn count_checkpoints(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append a standalone event. Fails with `NotFound` for unknown instances.
    fn append_event(
        &self,
        event: &WorkflowEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Events of an instance in append order.
    fn list_events(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowEvent>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Queued inputs
    // -----------------------------------------------------------------------

    /// Append an input with its queued event.
    ///
    /// The status check and the insert are one atomic step: a completed or
    /// cancelled instance yields `InstanceChanged` and nothing is written.
    fn enqueue_input(
        &self,
        input: &QueuedInput,
        event: &WorkflowEvent,
    ) -> impl std::future::Future<Output = Result<CommitOutcome, RepositoryError>> + Send;

    /// Inputs not yet drained, in enqueue order.
    fn list_pending_inputs(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<QueuedInput>, RepositoryError>> + Send;

    /// Every input of an instance, drained or not, in enqueue order.
    fn list_inputs(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<QueuedInput>, RepositoryError>> + Send;
}
