//! Audit event types for the Ensemble event log.
//!
//! `WorkflowEvent` is both the persisted audit record and the value broadcast
//! on the in-process event bus, so it is Clone + Send + Sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of events recorded against a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventType {
    Created,
    Started,
    Paused,
    Resumed,
    Cancelled,
    Completed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    /// The cursor was moved back (or forward) to a named step.
    Revisit,
    CheckpointCreated,
    CheckpointRestored,
    InputQueued,
    InputsApplied,
    DecisionRecorded,
    ArtifactAdded,
    PreferencesUpdated,
}

impl WorkflowEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowEventType::Created => "created",
            WorkflowEventType::Started => "started",
            WorkflowEventType::Paused => "paused",
            WorkflowEventType::Resumed => "resumed",
            WorkflowEventType::Cancelled => "cancelled",
            WorkflowEventType::Completed => "completed",
            WorkflowEventType::StepStarted => "step_started",
            WorkflowEventType::StepCompleted => "step_completed",
            WorkflowEventType::StepFailed => "step_failed",
            WorkflowEventType::StepSkipped => "step_skipped",
            WorkflowEventType::Revisit => "revisit",
            WorkflowEventType::CheckpointCreated => "checkpoint_created",
            WorkflowEventType::CheckpointRestored => "checkpoint_restored",
            WorkflowEventType::InputQueued => "input_queued",
            WorkflowEventType::InputsApplied => "inputs_applied",
            WorkflowEventType::DecisionRecorded => "decision_recorded",
            WorkflowEventType::ArtifactAdded => "artifact_added",
            WorkflowEventType::PreferencesUpdated => "preferences_updated",
        }
    }
}

impl fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("invalid event type: '{s}'"))
    }
}

/// One entry in an instance's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub event_type: WorkflowEventType,
    /// Actor that caused the event; "system" for engine-initiated events.
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Actor recorded for events the engine produces on its own.
pub const SYSTEM_ACTOR: &str = "system";

impl WorkflowEvent {
    pub fn new(
        instance_id: Uuid,
        event_type: WorkflowEventType,
        actor_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            event_type,
            actor_id: actor_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
