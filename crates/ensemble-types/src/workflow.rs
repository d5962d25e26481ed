//! Workflow domain types for Ensemble.
//!
//! Defines the workflow template (`WorkflowDefinition`), the lifecycle record
//! of one execution (`WorkflowInstance`), per-attempt step history, immutable
//! checkpoints, and buffered user inputs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextContent;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable template of ordered steps.
///
/// Authored as YAML and registered in the catalog. Each step names the agent
/// capability that must handle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier (e.g. "greenfield-product").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_definition_version")]
    pub version: String,
    /// Ordered steps. Step positions are 1-based when used as a cursor.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_definition_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Step at a 1-based cursor position.
    pub fn step_at(&self, index: u32) -> Option<&StepDefinition> {
        if index == 0 {
            return None;
        }
        self.steps.get(index as usize - 1)
    }

    /// 1-based position of the step with the given ID.
    pub fn position_of(&self, step_id: &str) -> Option<u32> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .map(|p| p as u32 + 1)
    }

    /// Number of steps as a cursor bound.
    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }
}

/// A single step in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step ID, unique within the workflow (e.g. "product-brief").
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Capability an agent must provide to run this step (e.g. "pm").
    #[serde(alias = "capability")]
    pub agent_capability: String,
    /// Whether the step must run for the workflow to be meaningful.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Whether `skip_step` may bypass this step.
    #[serde(default)]
    pub can_skip: bool,
    /// Step-level agent timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Instance lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Completed,
    Cancelled,
}

/// Operations gated by the lifecycle transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Pause,
    Resume,
    Cancel,
    Navigate,
    Skip,
    Execute,
    Restore,
    Checkpoint,
    EnqueueInput,
    UpdateContext,
}

impl InstanceStatus {
    /// Completed and Cancelled are terminal; the row persists for audit.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Cancelled)
    }

    /// The transition table.
    pub fn permits(self, action: LifecycleAction) -> bool {
        use InstanceStatus::*;
        use LifecycleAction::*;
        match action {
            Start => self == Created,
            Pause => self == Running,
            Resume => self == Paused,
            Cancel | Restore => matches!(self, Running | Paused),
            Navigate | Skip | Execute => self == Running,
            Checkpoint => matches!(self, Running | Paused | Completed),
            EnqueueInput | UpdateContext => !self.is_terminal(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(InstanceStatus::Created),
            "running" => Ok(InstanceStatus::Running),
            "paused" => Ok(InstanceStatus::Paused),
            "completed" => Ok(InstanceStatus::Completed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Pause => "pause",
            LifecycleAction::Resume => "resume",
            LifecycleAction::Cancel => "cancel",
            LifecycleAction::Navigate => "go to step",
            LifecycleAction::Skip => "skip step",
            LifecycleAction::Execute => "execute step",
            LifecycleAction::Restore => "restore checkpoint",
            LifecycleAction::Checkpoint => "checkpoint",
            LifecycleAction::EnqueueInput => "enqueue input",
            LifecycleAction::UpdateContext => "update the context of",
        };
        f.write_str(s)
    }
}

/// One execution of a workflow definition, owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// ID of the definition being executed.
    pub definition_id: String,
    /// Owning user.
    pub owner_id: String,
    pub status: InstanceStatus,
    /// 1-based cursor into the definition's steps; 0 before start.
    pub current_step_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// A fresh instance in `Created` with the cursor at 0.
    pub fn new(definition_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            owner_id: owner_id.into(),
            status: InstanceStatus::Created,
            current_step_index: 0,
            created_at: now,
            updated_at: now,
            paused_at: None,
            cancelled_at: None,
            completed_at: None,
        }
    }

    /// Move the cursor past the current step.
    ///
    /// Past the last step the instance becomes `Completed` and the cursor
    /// stays on the last step. The status is otherwise preserved, so a step
    /// that lands while the instance is paused leaves it paused.
    pub fn advanced(&self, step_count: u32, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if self.current_step_index >= step_count {
            next.status = InstanceStatus::Completed;
            next.current_step_index = step_count;
            next.paused_at = None;
            next.completed_at = Some(now);
        } else {
            next.current_step_index = self.current_step_index + 1;
        }
        next.updated_at = now;
        next
    }
}

// ---------------------------------------------------------------------------
// Step history
// ---------------------------------------------------------------------------

/// Status of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepHistoryStatus {
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl StepHistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepHistoryStatus::InProgress => "in_progress",
            StepHistoryStatus::Completed => "completed",
            StepHistoryStatus::Skipped => "skipped",
            StepHistoryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepHistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepHistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(StepHistoryStatus::InProgress),
            "completed" => Ok(StepHistoryStatus::Completed),
            "skipped" => Ok(StepHistoryStatus::Skipped),
            "failed" => Ok(StepHistoryStatus::Failed),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// Audit record for one attempt at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepHistoryRecord {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    /// Attempt number for this step within the instance (1-based).
    pub attempt: u32,
    pub status: StepHistoryStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Actor that caused the record (skips); None for agent executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Reason supplied with a skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepHistoryRecord {
    /// A record for an attempt that has just been dispatched.
    pub fn in_progress(instance_id: Uuid, step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.into(),
            attempt,
            status: StepHistoryStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            output: None,
            actor_id: None,
            reason: None,
        }
    }

    /// A finished record for a skipped step.
    pub fn skipped(
        instance_id: Uuid,
        step_id: impl Into<String>,
        attempt: u32,
        actor_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            status: StepHistoryStatus::Skipped,
            started_at: now,
            completed_at: Some(now),
            actor_id: Some(actor_id.into()),
            reason: Some(reason.into()),
            ..Self::in_progress(instance_id, step_id, attempt)
        }
    }

    pub fn completed(&self, output: serde_json::Value) -> Self {
        Self {
            status: StepHistoryStatus::Completed,
            completed_at: Some(Utc::now()),
            output: Some(output),
            ..self.clone()
        }
    }

    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            status: StepHistoryStatus::Failed,
            completed_at: Some(Utc::now()),
            error_message: Some(error.into()),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// How a checkpoint came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Produced by the engine after a completed or skipped step.
    Automatic,
    /// Requested by a caller.
    ExplicitSave,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::Automatic => "automatic",
            CheckpointType::ExplicitSave => "explicit_save",
        }
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(CheckpointType::Automatic),
            "explicit_save" => Ok(CheckpointType::ExplicitSave),
            other => Err(format!("invalid checkpoint type: '{other}'")),
        }
    }
}

/// Captured instance + context state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub status: InstanceStatus,
    pub current_step_index: u32,
    pub context_version: u64,
    pub context_content: ContextContent,
}

/// An immutable point-in-time snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    /// UUIDv7 checkpoint ID.
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Step the cursor referenced when the checkpoint was taken.
    pub step_id: String,
    #[serde(rename = "type")]
    pub checkpoint_type: CheckpointType,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: CheckpointSnapshot,
}

// ---------------------------------------------------------------------------
// Queued inputs
// ---------------------------------------------------------------------------

/// An externally submitted input waiting for the next checkpoint boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedInput {
    /// UUIDv7 input ID (FIFO order within an instance).
    pub id: Uuid,
    pub instance_id: Uuid,
    pub user_id: String,
    /// `artifact`, `preferences`, or any decision type.
    pub input_type: String,
    pub content: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Set when the input was drained for application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drained_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Transport-facing result of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl<E: fmt::Display> From<Result<WorkflowInstance, E>> for OperationResult {
    fn from(result: Result<WorkflowInstance, E>) -> Self {
        match result {
            Ok(instance) => OperationResult::ok(format!(
                "instance {} is {} at step {}",
                instance.id, instance.status, instance.current_step_index
            )),
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }
}

/// Outcome of executing the current step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Details of a successful step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepExecution {
    pub step_id: String,
    pub instance: WorkflowInstance,
    pub output: serde_json::Value,
    pub context_version: u64,
}

impl<E: fmt::Display> From<Result<StepExecution, E>> for StepExecutionResult {
    fn from(result: Result<StepExecution, E>) -> Self {
        match result {
            Ok(execution) => StepExecutionResult {
                success: true,
                error_message: None,
                output: Some(execution.output),
            },
            Err(e) => StepExecutionResult {
                success: false,
                error_message: Some(e.to_string()),
                output: None,
            },
        }
    }
}

/// One page of a chronologically ordered listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
