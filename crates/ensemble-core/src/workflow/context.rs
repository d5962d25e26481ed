//! Versioned shared context store with summarization.
//!
//! Every mutation is read-modify-write against the version the caller holds.
//! The store persists only if that version is still current and bumps it by
//! exactly one. After each mutation the token estimate is recomputed; above
//! the configured limit a condensed `context_summary` is rebuilt so agents get
//! a bounded prompt while the full records stay in the content.

use std::sync::Arc;

use chrono::Utc;
use ensemble_types::config::EngineConfig;
use ensemble_types::context::{
    ArtifactReference, ContextContent, DecisionRecord, SharedContext, StepOutput,
};
use ensemble_types::error::WorkflowError;
use ensemble_types::event::{WorkflowEvent, WorkflowEventType};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::event::EventLog;
use crate::repository::{CommitOutcome, ContextCommit, ContextWrite, WorkflowStore};

/// Rough token estimate: ~4 characters per token of serialized JSON.
pub fn estimate_tokens(content: &ContextContent) -> u64 {
    let chars = serde_json::to_string(content).map(|s| s.len()).unwrap_or(0);
    (chars / 4) as u64
}

/// Condensed view of a context: every decision plus the latest step summaries.
pub fn build_summary(content: &ContextContent, recent_steps: usize) -> String {
    let mut summary = String::from("Key Decisions:\n");
    if content.decision_history.is_empty() {
        summary.push_str("- none recorded\n");
    }
    for decision in &content.decision_history {
        summary.push_str(&format!(
            "- {}: {}\n",
            decision.decision_type,
            render_value(&decision.value)
        ));
    }

    let outputs = content.outputs_by_completion();
    let skip = outputs.len().saturating_sub(recent_steps);
    summary.push_str("\nRecent Steps:\n");
    if outputs.len() == skip {
        summary.push_str("- none completed\n");
    }
    for output in &outputs[skip..] {
        summary.push_str(&format!(
            "- {} ({}): {}\n",
            output.step_id, output.capability, output.summary
        ));
    }

    if !content.artifact_references.is_empty() {
        summary.push_str("\nArtifacts:\n");
        for artifact in &content.artifact_references {
            summary.push_str(&format!("- {}: {}\n", artifact.name, artifact.uri));
        }
    }
    summary
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Store for the versioned shared context of each instance.
pub struct SharedContextStore<S: WorkflowStore> {
    store: Arc<S>,
    events: Arc<EventLog<S>>,
    max_tokens: u64,
    recent_steps: usize,
    write_attempts: u32,
}

impl<S: WorkflowStore> SharedContextStore<S> {
    pub fn new(store: Arc<S>, events: Arc<EventLog<S>>, config: &EngineConfig) -> Self {
        Self {
            store,
            events,
            max_tokens: config.max_context_tokens,
            recent_steps: config.summary_recent_steps,
            write_attempts: config.context_write_attempts.max(1),
        }
    }

    /// A fresh context at version 1. Not persisted.
    pub fn seed(&self, instance_id: Uuid, initial: Value) -> SharedContext {
        let content = ContextContent::seeded(initial);
        let (estimated_token_count, context_summary) = self.condense(&content);
        SharedContext {
            instance_id,
            content,
            version: 1,
            context_summary,
            estimated_token_count,
            updated_at: Utc::now(),
        }
    }

    /// The successor of `current` carrying `content`. Not persisted.
    pub fn next_version(&self, current: &SharedContext, content: ContextContent) -> SharedContext {
        self.with_version(current, content, current.version + 1)
    }

    /// `content` at an explicit version, with token count and summary rebuilt.
    pub fn with_version(
        &self,
        current: &SharedContext,
        content: ContextContent,
        version: u64,
    ) -> SharedContext {
        let (estimated_token_count, context_summary) = self.condense(&content);
        SharedContext {
            instance_id: current.instance_id,
            content,
            version,
            context_summary,
            estimated_token_count,
            updated_at: Utc::now(),
        }
    }

    fn condense(&self, content: &ContextContent) -> (u64, Option<String>) {
        let tokens = estimate_tokens(content);
        let summary = (tokens > self.max_tokens).then(|| build_summary(content, self.recent_steps));
        (tokens, summary)
    }

    pub async fn get(&self, instance_id: &Uuid) -> Result<SharedContext, WorkflowError> {
        self.store
            .get_context(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("shared context for instance {instance_id}")))
    }

    // -----------------------------------------------------------------------
    // Conditional mutations
    // -----------------------------------------------------------------------

    /// Persist `content` as the successor of `current`.
    ///
    /// Fails with `ConcurrencyConflict` and no effect if `current.version` is
    /// no longer the stored version.
    pub async fn save(
        &self,
        current: &SharedContext,
        content: ContextContent,
        drained_inputs: Vec<Uuid>,
        event: Option<WorkflowEvent>,
    ) -> Result<SharedContext, WorkflowError> {
        let next = self.next_version(current, content);
        self.save_successor(current, next, drained_inputs, event).await
    }

    async fn save_successor(
        &self,
        current: &SharedContext,
        next: SharedContext,
        drained_inputs: Vec<Uuid>,
        event: Option<WorkflowEvent>,
    ) -> Result<SharedContext, WorkflowError> {
        let commit = ContextCommit {
            write: ContextWrite {
                expected_version: current.version,
                context: next,
            },
            drained_inputs,
            event,
        };

        match self.store.save_context(&commit).await? {
            CommitOutcome::Committed => {
                tracing::debug!(
                    instance_id = %current.instance_id,
                    version = commit.write.context.version,
                    tokens = commit.write.context.estimated_token_count,
                    summarized = commit.write.context.context_summary.is_some(),
                    "context saved"
                );
                self.events.announce(commit.event);
                Ok(commit.write.context)
            }
            _ => Err(WorkflowError::ConcurrencyConflict {
                instance_id: current.instance_id,
                detail: format!("context version {} is stale", current.version),
            }),
        }
    }

    /// Successor of `current` with `output` stored under its step. Not persisted.
    ///
    /// A revisited step replaces its earlier entry.
    pub fn with_step_output(&self, current: &SharedContext, output: StepOutput) -> SharedContext {
        let mut content = current.content.clone();
        content.step_outputs.insert(output.step_id.clone(), output);
        self.next_version(current, content)
    }

    pub async fn add_step_output(
        &self,
        current: &SharedContext,
        output: StepOutput,
    ) -> Result<SharedContext, WorkflowError> {
        let next = self.with_step_output(current, output);
        self.save_successor(current, next, Vec::new(), None).await
    }

    pub async fn add_decision(
        &self,
        current: &SharedContext,
        decision: DecisionRecord,
    ) -> Result<SharedContext, WorkflowError> {
        let event = WorkflowEvent::new(
            current.instance_id,
            WorkflowEventType::DecisionRecorded,
            decision.made_by.clone(),
            json!({ "decision_type": decision.decision_type, "decision_id": decision.id }),
        );
        let mut content = current.content.clone();
        content.decision_history.push(decision);
        self.save(current, content, Vec::new(), Some(event)).await
    }

    pub async fn add_artifact_reference(
        &self,
        current: &SharedContext,
        artifact: ArtifactReference,
    ) -> Result<SharedContext, WorkflowError> {
        let event = WorkflowEvent::new(
            current.instance_id,
            WorkflowEventType::ArtifactAdded,
            artifact.added_by.clone(),
            json!({ "name": artifact.name, "uri": artifact.uri }),
        );
        let mut content = current.content.clone();
        content.artifact_references.push(artifact);
        self.save(current, content, Vec::new(), Some(event)).await
    }

    /// Merge a preferences patch (object keys overwrite).
    pub async fn set_user_preferences(
        &self,
        current: &SharedContext,
        preferences: Value,
        actor_id: &str,
    ) -> Result<SharedContext, WorkflowError> {
        let event = WorkflowEvent::new(
            current.instance_id,
            WorkflowEventType::PreferencesUpdated,
            actor_id,
            json!({ "preferences": preferences }),
        );
        let mut content = current.content.clone();
        content.merge_preferences(preferences);
        self.save(current, content, Vec::new(), Some(event)).await
    }

    /// Refetch-and-reapply loop around one of the mutations above.
    ///
    /// `mutation` receives the freshest context on every attempt. Gives up
    /// with the last `ConcurrencyConflict` after the configured attempts.
    pub async fn apply_with_retry<F, Fut>(
        &self,
        instance_id: &Uuid,
        mut mutation: F,
    ) -> Result<SharedContext, WorkflowError>
    where
        F: FnMut(SharedContext) -> Fut,
        Fut: std::future::Future<Output = Result<SharedContext, WorkflowError>>,
    {
        let mut attempt = 1;
        loop {
            let current = self.get(instance_id).await?;
            match mutation(current).await {
                Err(e) if e.is_retryable() && attempt < self.write_attempts => {
                    tracing::debug!(instance_id = %instance_id, attempt, "context conflict, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::InMemoryWorkflowStore;
    use ensemble_types::workflow::WorkflowInstance;

    async fn setup(config: EngineConfig) -> (SharedContextStore<InMemoryWorkflowStore>, SharedContext) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let events = Arc::new(EventLog::new(store.clone(), EventBus::new(16)));
        let contexts = SharedContextStore::new(store.clone(), events, &config);

        let instance = WorkflowInstance::new("greenfield", "user-1");
        let seeded = contexts.seed(instance.id, json!({"tone": "formal"}));
        let created = WorkflowEvent::new(instance.id, WorkflowEventType::Created, "user-1", json!({}));
        store.insert_instance(&instance, &seeded, &created).await.unwrap();
        (contexts, seeded)
    }

    fn output(step_id: &str, summary: &str) -> StepOutput {
        StepOutput {
            step_id: step_id.to_string(),
            capability: "pm".to_string(),
            summary: summary.to_string(),
            content: json!({ "body": "x".repeat(200) }),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn seed_starts_at_version_one() {
        let (contexts, seeded) = setup(EngineConfig::default()).await;
        assert_eq!(seeded.version, 1);
        assert!(seeded.context_summary.is_none());
        assert!(seeded.estimated_token_count > 0);

        let stored = contexts.get(&seeded.instance_id).await.unwrap();
        assert_eq!(stored, seeded);
    }

    #[tokio::test]
    async fn step_output_successor_replaces_revisited_step() {
        let (contexts, seeded) = setup(EngineConfig::default()).await;

        let staged = contexts.with_step_output(&seeded, output("brief", "first pass"));
        assert_eq!(staged.version, 2);
        assert_eq!(contexts.get(&seeded.instance_id).await.unwrap().version, 1);

        let v2 = contexts.add_step_output(&seeded, output("brief", "first pass")).await.unwrap();
        assert_eq!(v2.content, staged.content);

        let v3 = contexts.add_step_output(&v2, output("brief", "second pass")).await.unwrap();
        assert_eq!(v3.content.step_outputs.len(), 1);
        assert_eq!(v3.content.step_outputs["brief"].summary, "second pass");
    }

    #[tokio::test]
    async fn each_mutation_bumps_version_by_one() {
        let (contexts, seeded) = setup(EngineConfig::default()).await;

        let v2 = contexts.add_step_output(&seeded, output("brief", "brief done")).await.unwrap();
        let v3 = contexts
            .add_decision(&v2, DecisionRecord::new("database", json!("postgres"), None, "user-1"))
            .await
            .unwrap();
        let v4 = contexts
            .add_artifact_reference(&v3, ArtifactReference::new("PRD", "file://prd.md", None, "user-1"))
            .await
            .unwrap();
        let v5 = contexts
            .set_user_preferences(&v4, json!({"depth": "detailed"}), "user-1")
            .await
            .unwrap();

        assert_eq!(v5.version, 5);
        let stored = contexts.get(&seeded.instance_id).await.unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(
            stored.content.user_preferences,
            Some(json!({"tone": "formal", "depth": "detailed"}))
        );
        assert_eq!(stored.content.decision_history.len(), 1);
        assert_eq!(stored.content.artifact_references.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_from_same_version_conflict_once() {
        let (contexts, seeded) = setup(EngineConfig::default()).await;

        let first = contexts
            .add_decision(&seeded, DecisionRecord::new("a", json!(1), None, "user-1"))
            .await;
        let second = contexts
            .add_decision(&seeded, DecisionRecord::new("b", json!(2), None, "user-2"))
            .await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(WorkflowError::ConcurrencyConflict { .. })));
        let stored = contexts.get(&seeded.instance_id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.content.decision_history.len(), 1);
        assert_eq!(stored.content.decision_history[0].decision_type, "a");
    }

    #[tokio::test]
    async fn apply_with_retry_refetches_after_conflict() {
        let (contexts, seeded) = setup(EngineConfig::default()).await;
        let stale = seeded.clone();
        contexts
            .add_decision(&seeded, DecisionRecord::new("a", json!(1), None, "user-1"))
            .await
            .unwrap();

        let mut calls = 0;
        let result = contexts
            .apply_with_retry(&seeded.instance_id, |fresh| {
                calls += 1;
                let base = if calls == 1 { stale.clone() } else { fresh };
                let contexts = &contexts;
                async move {
                    contexts
                        .add_decision(&base, DecisionRecord::new("b", json!(2), None, "user-2"))
                        .await
                }
            })
            .await
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(result.version, 3);
        assert_eq!(result.content.decision_history.len(), 2);
    }

    #[tokio::test]
    async fn summary_appears_above_limit_and_keeps_full_records() {
        let config = EngineConfig {
            max_context_tokens: 100,
            summary_recent_steps: 2,
            ..EngineConfig::default()
        };
        let (contexts, seeded) = setup(config).await;

        let mut ctx = contexts
            .add_decision(&seeded, DecisionRecord::new("database", json!("postgres"), None, "user-1"))
            .await
            .unwrap();
        ctx = contexts
            .add_decision(&ctx, DecisionRecord::new("auth", json!({"provider": "oidc"}), None, "user-1"))
            .await
            .unwrap();
        let base = Utc::now();
        for (i, (id, summary)) in [("brief", "brief ready"), ("prd", "prd ready"), ("arch", "arch ready")]
            .into_iter()
            .enumerate()
        {
            let mut out = output(id, summary);
            out.completed_at = base + chrono::Duration::seconds(i as i64);
            ctx = contexts.add_step_output(&ctx, out).await.unwrap();
        }

        assert!(ctx.estimated_token_count > 100);
        let summary = ctx.context_summary.clone().unwrap();
        assert!(summary.contains("Key Decisions:"));
        assert!(summary.contains("database: postgres"));
        assert!(summary.contains(r#"auth: {"provider":"oidc"}"#));
        assert!(summary.contains("prd ready"));
        assert!(summary.contains("arch ready"));
        assert!(!summary.contains("brief ready"));
        assert_eq!(ctx.content.step_outputs.len(), 3);
        assert_eq!(ctx.prompt_view(), summary);
    }

    #[tokio::test]
    async fn summary_is_cleared_below_limit() {
        let (contexts, seeded) = setup(EngineConfig::default()).await;
        let ctx = contexts.add_step_output(&seeded, output("brief", "brief ready")).await.unwrap();
        assert!(ctx.estimated_token_count < 8_000);
        assert!(ctx.context_summary.is_none());
    }

    #[test]
    fn build_summary_with_nothing_recorded() {
        let summary = build_summary(&ContextContent::default(), 3);
        assert!(summary.starts_with("Key Decisions:\n- none recorded"));
        assert!(summary.contains("Recent Steps:\n- none completed"));
    }
}
