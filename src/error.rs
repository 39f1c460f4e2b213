//! Error types for the work engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),
}

impl Error {
    /// Whether this error means the store could not persist state.
    ///
    /// Only these are allowed to take a worker slot down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Lost a race with another writer, or the task already finished.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Task(TaskError::Conflict { .. }))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid denylist pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised synchronously by task submission and mutation.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    Conflict {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Task {id} would create a dependency cycle: {}", format_path(.path))]
    Cycle { id: Uuid, path: Vec<Uuid> },

    #[error("Task {id} depends on unknown task {dependency}")]
    UnknownDependency { id: Uuid, dependency: Uuid },

    #[error("Invalid task: {0}")]
    InvalidInput(String),
}

fn format_path(path: &[Uuid]) -> String {
    path.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failures produced while dispatching or executing an action.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("Unsupported action: {action}")]
    Unsupported { action: String },

    #[error("Security violation: blocked by {pattern:?}")]
    SecurityViolation { pattern: String },

    #[error("Action {action} timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("Invalid parameters for action {action}: {reason}")]
    InvalidParameters { action: String, reason: String },

    #[error("Action {action} failed: {reason}")]
    Failed {
        action: String,
        reason: String,
        retryable: bool,
    },

    #[error("Action was cancelled")]
    Cancelled,
}

impl ActionError {
    /// Transient failure helper.
    pub fn transient(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            action: action.into(),
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Failure the handler asks never to be retried.
    pub fn permanent(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            action: action.into(),
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Whether the retry controller may reschedule the task.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Failed { retryable, .. } => *retryable,
            Self::Unsupported { .. }
            | Self::SecurityViolation { .. }
            | Self::InvalidParameters { .. }
            | Self::Cancelled => false,
        }
    }

    /// Stable identifier persisted alongside the error message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsupported { .. } => "unsupported_action",
            Self::SecurityViolation { .. } => "security_violation",
            Self::Timeout { .. } => "timeout",
            Self::InvalidParameters { .. } => "invalid_parameters",
            Self::Failed { .. } => "application",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let timeout = ActionError::Timeout {
            action: "http_request".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(ActionError::transient("shell_command", "exit 1").is_retryable());

        assert!(!ActionError::permanent("shell_command", "bad input").is_retryable());
        assert!(
            !ActionError::SecurityViolation {
                pattern: "rm".into()
            }
            .is_retryable()
        );
        assert!(
            !ActionError::Unsupported {
                action: "teleport".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn error_kinds_are_snake_case() {
        assert_eq!(
            ActionError::SecurityViolation {
                pattern: "x".into()
            }
            .kind(),
            "security_violation"
        );
        assert_eq!(ActionError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn cycle_message_lists_path() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = TaskError::Cycle {
            id: a,
            path: vec![a, b, a],
        };
        let msg = err.to_string();
        assert!(msg.contains(&format!("{a} -> {b} -> {a}")));
    }

    #[test]
    fn only_database_errors_are_fatal() {
        assert!(Error::from(DatabaseError::Query("disk full".into())).is_fatal());
        assert!(!Error::from(TaskError::NotFound { id: Uuid::nil() }).is_fatal());
    }
}
