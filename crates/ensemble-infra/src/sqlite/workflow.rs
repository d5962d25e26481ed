//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `ensemble-core` using sqlx with split
//! read/write pools. Composite commits run inside one writer transaction:
//! the instance row is updated only while it still matches the guard, the
//! context row only while it still has the expected version, and history,
//! events and drained inputs are written in the same transaction. A guard
//! miss drops the transaction, which rolls everything back.
//!
//! Context content, snapshots, step outputs and payloads are JSON blobs.
//! Ordered child tables use an autoincrement `seq` column for append order.

use ensemble_core::repository::{
    CommitOutcome, ContextCommit, InstanceCommit, WorkflowStore,
};
use ensemble_types::context::{ContextContent, SharedContext};
use ensemble_types::error::RepositoryError;
use ensemble_types::event::{WorkflowEvent, WorkflowEventType};
use ensemble_types::workflow::{
    CheckpointSnapshot, CheckpointType, InstanceStatus, QueuedInput, StepHistoryRecord,
    StepHistoryStatus, WorkflowCheckpoint, WorkflowInstance,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    definition_id: String,
    owner_id: String,
    status: String,
    current_step_index: i64,
    created_at: String,
    updated_at: String,
    paused_at: Option<String>,
    cancelled_at: Option<String>,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            owner_id: row.try_get("owner_id")?,
            status: row.try_get("status")?,
            current_step_index: row.try_get("current_step_index")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            paused_at: row.try_get("paused_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: self.definition_id,
            owner_id: self.owner_id,
            status: self
                .status
                .parse::<InstanceStatus>()
                .map_err(RepositoryError::Query)?,
            current_step_index: self.current_step_index as u32,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            paused_at: parse_optional_datetime(self.paused_at.as_deref())?,
            cancelled_at: parse_optional_datetime(self.cancelled_at.as_deref())?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
        })
    }
}

struct ContextRow {
    instance_id: String,
    content: String,
    version: i64,
    context_summary: Option<String>,
    estimated_token_count: i64,
    updated_at: String,
}

impl ContextRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            content: row.try_get("content")?,
            version: row.try_get("version")?,
            context_summary: row.try_get("context_summary")?,
            estimated_token_count: row.try_get("estimated_token_count")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_context(self) -> Result<SharedContext, RepositoryError> {
        let content: ContextContent = serde_json::from_str(&self.content)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;
        Ok(SharedContext {
            instance_id: parse_uuid(&self.instance_id)?,
            content,
            version: self.version as u64,
            context_summary: self.context_summary,
            estimated_token_count: self.estimated_token_count as u64,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepHistoryRow {
    id: String,
    instance_id: String,
    step_id: String,
    attempt: i64,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
    output: Option<String>,
    actor_id: Option<String>,
    reason: Option<String>,
}

impl StepHistoryRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            output: row.try_get("output")?,
            actor_id: row.try_get("actor_id")?,
            reason: row.try_get("reason")?,
        })
    }

    fn into_record(self) -> Result<StepHistoryRecord, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output: {e}")))
            })
            .transpose()?;

        Ok(StepHistoryRecord {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            attempt: self.attempt as u32,
            status: self
                .status
                .parse::<StepHistoryStatus>()
                .map_err(RepositoryError::Query)?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            error_message: self.error_message,
            output,
            actor_id: self.actor_id,
            reason: self.reason,
        })
    }
}

struct CheckpointRow {
    id: String,
    instance_id: String,
    step_id: String,
    checkpoint_type: String,
    created_by: String,
    created_at: String,
    snapshot: String,
}

impl CheckpointRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            checkpoint_type: row.try_get("checkpoint_type")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn into_checkpoint(self) -> Result<WorkflowCheckpoint, RepositoryError> {
        let snapshot: CheckpointSnapshot = serde_json::from_str(&self.snapshot)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint snapshot: {e}")))?;
        Ok(WorkflowCheckpoint {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            checkpoint_type: self
                .checkpoint_type
                .parse::<CheckpointType>()
                .map_err(RepositoryError::Query)?,
            created_by: self.created_by,
            created_at: parse_datetime(&self.created_at)?,
            snapshot,
        })
    }
}

struct EventRow {
    id: String,
    instance_id: String,
    event_type: String,
    actor_id: String,
    timestamp: String,
    payload: String,
}

impl EventRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            event_type: row.try_get("event_type")?,
            actor_id: row.try_get("actor_id")?,
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
        })
    }

    fn into_event(self) -> Result<WorkflowEvent, RepositoryError> {
        Ok(WorkflowEvent {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            event_type: self
                .event_type
                .parse::<WorkflowEventType>()
                .map_err(RepositoryError::Query)?,
            actor_id: self.actor_id,
            timestamp: parse_datetime(&self.timestamp)?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| RepositoryError::Query(format!("invalid event payload: {e}")))?,
        })
    }
}

struct QueuedInputRow {
    id: String,
    instance_id: String,
    user_id: String,
    input_type: String,
    content: String,
    enqueued_at: String,
    drained_at: Option<String>,
}

impl QueuedInputRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            user_id: row.try_get("user_id")?,
            input_type: row.try_get("input_type")?,
            content: row.try_get("content")?,
            enqueued_at: row.try_get("enqueued_at")?,
            drained_at: row.try_get("drained_at")?,
        })
    }

    fn into_input(self) -> Result<QueuedInput, RepositoryError> {
        Ok(QueuedInput {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            user_id: self.user_id,
            input_type: self.input_type,
            content: serde_json::from_str(&self.content)
                .map_err(|e| RepositoryError::Query(format!("invalid input content: {e}")))?,
            enqueued_at: parse_datetime(&self.enqueued_at)?,
            drained_at: parse_optional_datetime(self.drained_at.as_deref())?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map a UNIQUE violation to `Conflict`, anything else to `Query`.
fn insert_error(e: sqlx::Error, what: impl FnOnce() -> String) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(format!("{} already exists", what()));
        }
    }
    query_error(e)
}

async fn instance_exists(conn: &mut SqliteConnection, id: &Uuid) -> Result<bool, RepositoryError> {
    let row = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(query_error)?;
    Ok(row.is_some())
}

async fn insert_event(conn: &mut SqliteConnection, event: &WorkflowEvent) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO workflow_events (id, instance_id, event_type, actor_id, timestamp, payload)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(event.id.to_string())
    .bind(event.instance_id.to_string())
    .bind(event.event_type.as_str())
    .bind(&event.actor_id)
    .bind(format_datetime(&event.timestamp))
    .bind(to_json(&event.payload)?)
    .execute(conn)
    .await
    .map_err(|e| insert_error(e, || format!("event {}", event.id)))?;
    Ok(())
}

/// Write a context row's mutable columns if the stored version matches.
async fn update_context(
    conn: &mut SqliteConnection,
    context: &SharedContext,
    expected_version: u64,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        r#"UPDATE workflow_contexts
           SET content = ?, version = ?, context_summary = ?, estimated_token_count = ?, updated_at = ?
           WHERE instance_id = ? AND version = ?"#,
    )
    .bind(to_json(&context.content)?)
    .bind(context.version as i64)
    .bind(&context.context_summary)
    .bind(context.estimated_token_count as i64)
    .bind(format_datetime(&context.updated_at))
    .bind(context.instance_id.to_string())
    .bind(expected_version as i64)
    .execute(conn)
    .await
    .map_err(query_error)?;
    Ok(result.rows_affected() > 0)
}

/// Insert a history record, or replace the mutable columns of an existing one.
async fn upsert_step_history(
    conn: &mut SqliteConnection,
    record: &StepHistoryRecord,
) -> Result<(), RepositoryError> {
    let output = record.output.as_ref().map(to_json).transpose()?;
    sqlx::query(
        r#"INSERT INTO workflow_step_histories
           (id, instance_id, step_id, attempt, status, started_at, completed_at,
            error_message, output, actor_id, reason)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             completed_at = excluded.completed_at,
             error_message = excluded.error_message,
             output = excluded.output,
             actor_id = excluded.actor_id,
             reason = excluded.reason"#,
    )
    .bind(record.id.to_string())
    .bind(record.instance_id.to_string())
    .bind(&record.step_id)
    .bind(record.attempt as i64)
    .bind(record.status.as_str())
    .bind(format_datetime(&record.started_at))
    .bind(record.completed_at.as_ref().map(format_datetime))
    .bind(&record.error_message)
    .bind(&output)
    .bind(&record.actor_id)
    .bind(&record.reason)
    .execute(conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        context: &SharedContext,
        event: &WorkflowEvent,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, definition_id, owner_id, status, current_step_index, created_at, updated_at,
                paused_at, cancelled_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.definition_id)
        .bind(&instance.owner_id)
        .bind(instance.status.as_str())
        .bind(instance.current_step_index as i64)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.paused_at.as_ref().map(format_datetime))
        .bind(instance.cancelled_at.as_ref().map(format_datetime))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(e, || format!("instance {}", instance.id)))?;

        sqlx::query(
            r#"INSERT INTO workflow_contexts
               (instance_id, content, version, context_summary, estimated_token_count, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(context.instance_id.to_string())
        .bind(to_json(&context.content)?)
        .bind(context.version as i64)
        .bind(&context.context_summary)
        .bind(context.estimated_token_count as i64)
        .bind(format_datetime(&context.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        insert_event(&mut tx, event).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query(
                    "SELECT * FROM workflow_instances WHERE owner_id = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(owner)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_instances ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_error)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn commit(&self, commit: &InstanceCommit) -> Result<CommitOutcome, RepositoryError> {
        let instance = &commit.instance;
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let updated = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, current_step_index = ?, updated_at = ?,
                   paused_at = ?, cancelled_at = ?, completed_at = ?
               WHERE id = ? AND status = ? AND current_step_index = ?"#,
        )
        .bind(instance.status.as_str())
        .bind(instance.current_step_index as i64)
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.paused_at.as_ref().map(format_datetime))
        .bind(instance.cancelled_at.as_ref().map(format_datetime))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(instance.id.to_string())
        .bind(commit.guard.status.as_str())
        .bind(commit.guard.current_step_index as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() == 0 {
            return if instance_exists(&mut tx, &instance.id).await? {
                Ok(CommitOutcome::InstanceChanged)
            } else {
                Err(RepositoryError::NotFound)
            };
        }

        if let Some(write) = &commit.context {
            if !update_context(&mut tx, &write.context, write.expected_version).await? {
                return Ok(CommitOutcome::ContextConflict);
            }
        }
        if let Some(record) = &commit.history {
            upsert_step_history(&mut tx, record).await?;
        }
        for event in &commit.events {
            insert_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(CommitOutcome::Committed)
    }

    async fn append_step_history(&self, record: &StepHistoryRecord) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        if !instance_exists(&mut tx, &record.instance_id).await? {
            return Err(RepositoryError::NotFound);
        }

        let output = record.output.as_ref().map(to_json).transpose()?;
        sqlx::query(
            r#"INSERT INTO workflow_step_histories
               (id, instance_id, step_id, attempt, status, started_at, completed_at,
                error_message, output, actor_id, reason)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.instance_id.to_string())
        .bind(&record.step_id)
        .bind(record.attempt as i64)
        .bind(record.status.as_str())
        .bind(format_datetime(&record.started_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(&record.error_message)
        .bind(&output)
        .bind(&record.actor_id)
        .bind(&record.reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(e, || format!("step history {}", record.id)))?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn update_step_history(&self, record: &StepHistoryRecord) -> Result<(), RepositoryError> {
        let output = record.output.as_ref().map(to_json).transpose()?;
        let result = sqlx::query(
            r#"UPDATE workflow_step_histories
               SET status = ?, completed_at = ?, error_message = ?, output = ?, actor_id = ?, reason = ?
               WHERE id = ? AND instance_id = ?"#,
        )
        .bind(record.status.as_str())
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(&record.error_message)
        .bind(&output)
        .bind(&record.actor_id)
        .bind(&record.reason)
        .bind(record.id.to_string())
        .bind(record.instance_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_history(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<StepHistoryRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_step_histories WHERE instance_id = ? ORDER BY seq ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepHistoryRow::from_row(row).map_err(query_error)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn get_context(&self, instance_id: &Uuid) -> Result<Option<SharedContext>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_contexts WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ContextRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_context()?))
            }
            None => Ok(None),
        }
    }

    async fn save_context(&self, commit: &ContextCommit) -> Result<CommitOutcome, RepositoryError> {
        let context = &commit.write.context;
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        if !update_context(&mut tx, context, commit.write.expected_version).await? {
            return if instance_exists(&mut tx, &context.instance_id).await? {
                Ok(CommitOutcome::ContextConflict)
            } else {
                Err(RepositoryError::NotFound)
            };
        }

        let drained_at = format_datetime(&context.updated_at);
        for input_id in &commit.drained_inputs {
            sqlx::query(
                "UPDATE queued_inputs SET drained_at = ? WHERE id = ? AND instance_id = ? AND drained_at IS NULL",
            )
            .bind(&drained_at)
            .bind(input_id.to_string())
            .bind(context.instance_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }
        if let Some(event) = &commit.event {
            insert_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(CommitOutcome::Committed)
    }

    async fn insert_checkpoint(
        &self,
        checkpoint: &WorkflowCheckpoint,
        event: &WorkflowEvent,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        if !instance_exists(&mut tx, &checkpoint.instance_id).await? {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            r#"INSERT INTO workflow_checkpoints
               (id, instance_id, step_id, checkpoint_type, created_by, created_at, snapshot)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.instance_id.to_string())
        .bind(&checkpoint.step_id)
        .bind(checkpoint.checkpoint_type.as_str())
        .bind(&checkpoint.created_by)
        .bind(format_datetime(&checkpoint.created_at))
        .bind(to_json(&checkpoint.snapshot)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(e, || format!("checkpoint {}", checkpoint.id)))?;

        insert_event(&mut tx, event).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_checkpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(
        &self,
        instance_id: &Uuid,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<WorkflowCheckpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_checkpoints WHERE instance_id = ? ORDER BY seq ASC LIMIT ? OFFSET ?",
        )
        .bind(instance_id.to_string())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(query_error)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn count_checkpoints(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_checkpoints WHERE instance_id = ?")
                .bind(instance_id.to_string())
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_error)?;
        Ok(count as u64)
    }

    async fn append_event(&self, event: &WorkflowEvent) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        if !instance_exists(&mut tx, &event.instance_id).await? {
            return Err(RepositoryError::NotFound);
        }
        insert_event(&mut tx, event).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn list_events(&self, instance_id: &Uuid) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_events WHERE instance_id = ? ORDER BY seq ASC")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = EventRow::from_row(row).map_err(query_error)?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }

    async fn enqueue_input(
        &self,
        input: &QueuedInput,
        event: &WorkflowEvent,
    ) -> Result<CommitOutcome, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        if !instance_exists(&mut tx, &input.instance_id).await? {
            return Err(RepositoryError::NotFound);
        }

        let inserted = sqlx::query(
            r#"INSERT INTO queued_inputs
               (id, instance_id, user_id, input_type, content, enqueued_at, drained_at)
               SELECT ?, id, ?, ?, ?, ?, ?
               FROM workflow_instances
               WHERE id = ? AND status NOT IN ('completed', 'cancelled')"#,
        )
        .bind(input.id.to_string())
        .bind(&input.user_id)
        .bind(&input.input_type)
        .bind(to_json(&input.content)?)
        .bind(format_datetime(&input.enqueued_at))
        .bind(input.drained_at.as_ref().map(format_datetime))
        .bind(input.instance_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(e, || format!("queued input {}", input.id)))?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Ok(CommitOutcome::InstanceChanged);
        }

        insert_event(&mut tx, event).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(CommitOutcome::Committed)
    }

    async fn list_pending_inputs(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<QueuedInput>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM queued_inputs WHERE instance_id = ? AND drained_at IS NULL ORDER BY seq ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut inputs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = QueuedInputRow::from_row(row).map_err(query_error)?;
            inputs.push(r.into_input()?);
        }
        Ok(inputs)
    }

    async fn list_inputs(&self, instance_id: &Uuid) -> Result<Vec<QueuedInput>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM queued_inputs WHERE instance_id = ? ORDER BY seq ASC")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut inputs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = QueuedInputRow::from_row(row).map_err(query_error)?;
            inputs.push(r.into_input()?);
        }
        Ok(inputs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
