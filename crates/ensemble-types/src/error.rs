use thiserror::Error;
use uuid::Uuid;

use crate::workflow::{InstanceStatus, LifecycleAction};

/// Errors from the engine's public operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("cannot {action} instance {instance_id} while it is {from}")]
    InvalidTransition {
        instance_id: Uuid,
        from: InstanceStatus,
        action: LifecycleAction,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("step '{step_id}' cannot be skipped")]
    StepNotSkippable { step_id: String },

    #[error("concurrent modification of instance {instance_id}: {detail}")]
    ConcurrencyConflict { instance_id: Uuid, detail: String },

    #[error("step '{step_id}' failed: {message}")]
    ExecutionFailure { step_id: String, message: String },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl WorkflowError {
    /// Only concurrency conflicts are worth retrying by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::ConcurrencyConflict { .. })
    }

    pub fn instance_not_found(id: Uuid) -> Self {
        WorkflowError::NotFound(format!("workflow instance {id}"))
    }
}

/// Errors related to repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let id = Uuid::nil();
        let err = WorkflowError::InvalidTransition {
            instance_id: id,
            from: InstanceStatus::Completed,
            action: LifecycleAction::Pause,
        };
        assert_eq!(
            err.to_string(),
            format!("cannot pause instance {id} while it is completed")
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_is_retryable() {
        let err = WorkflowError::ConcurrencyConflict {
            instance_id: Uuid::nil(),
            detail: "context version 3 is stale".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_repository_error_converts() {
        let err: WorkflowError = RepositoryError::Query("syntax error".to_string()).into();
        assert_eq!(err.to_string(), "storage error: query error: syntax error");
    }
}
