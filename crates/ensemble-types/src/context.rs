//! Shared collaborative memory types.
//!
//! A `SharedContext` is the versioned memory every step of an instance reads
//! from and writes to. The content is append-mostly: step outputs are keyed by
//! step ID, decisions and artifact references are append-only lists.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output produced by one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    /// Capability of the agent that produced the output.
    pub capability: String,
    /// Short human-readable summary used when the context is condensed.
    pub summary: String,
    pub content: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// A decision made during the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub decision_type: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub made_by: String,
    pub recorded_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        decision_type: impl Into<String>,
        value: serde_json::Value,
        step_id: Option<String>,
        made_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            decision_type: decision_type.into(),
            value,
            step_id,
            made_by: made_by.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// A pointer to an artifact produced or consumed by the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub id: Uuid,
    pub name: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

impl ArtifactReference {
    pub fn new(
        name: impl Into<String>,
        uri: impl Into<String>,
        kind: Option<String>,
        added_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            uri: uri.into(),
            kind,
            step_id: None,
            added_by: added_by.into(),
            added_at: Utc::now(),
        }
    }
}

/// The mutable body of a shared context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextContent {
    /// Latest output per step; a revisited step replaces its entry.
    #[serde(default)]
    pub step_outputs: BTreeMap<String, StepOutput>,
    #[serde(default)]
    pub decision_history: Vec<DecisionRecord>,
    #[serde(default)]
    pub artifact_references: Vec<ArtifactReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_preferences: Option<serde_json::Value>,
}

impl ContextContent {
    /// Content seeded from caller-supplied initial context.
    ///
    /// The initial value becomes the user preferences; `null` seeds nothing.
    pub fn seeded(initial: serde_json::Value) -> Self {
        Self {
            user_preferences: (!initial.is_null()).then_some(initial),
            ..Self::default()
        }
    }

    /// Step outputs ordered by completion time, oldest first.
    pub fn outputs_by_completion(&self) -> Vec<&StepOutput> {
        let mut outputs: Vec<&StepOutput> = self.step_outputs.values().collect();
        outputs.sort_by_key(|o| o.completed_at);
        outputs
    }

    /// Merge `patch` into the user preferences.
    ///
    /// Object keys in `patch` overwrite existing keys. A non-object patch (or
    /// non-object existing value) replaces the preferences wholesale.
    pub fn merge_preferences(&mut self, patch: serde_json::Value) {
        match (&mut self.user_preferences, patch) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                existing.extend(incoming);
            }
            (slot, patch) => *slot = Some(patch),
        }
    }
}

/// The versioned shared context of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub instance_id: Uuid,
    pub content: ContextContent,
    /// Starts at 1 and increases by exactly 1 per successful mutation.
    pub version: u64,
    /// Condensed view, present only while the content exceeds the token limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_summary: Option<String>,
    pub estimated_token_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl SharedContext {
    /// What an agent receives as prompt context.
    ///
    /// The summary when one exists, else the full content as pretty JSON.
    pub fn prompt_view(&self) -> String {
        match &self.context_summary {
            Some(summary) => summary.clone(),
            None => serde_json::to_string_pretty(&self.content).unwrap_or_default(),
        }
    }
}
