//! Task state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible to run once a worker is free.
    Pending,
    /// Waiting on dependencies that have not completed.
    Blocked,
    /// Held by exactly one worker slot.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed; terminal unless a retry is scheduled.
    Failed,
    /// Cancelled on request.
    Cancelled,
    /// Held back by the user.
    Paused,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Failed -> Pending` is only legal while a retry is scheduled; callers
    /// check that via [`crate::task::Task::is_terminal`].
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Blocked) | (Pending, Paused) | (Pending, Cancelled) |
            // From Blocked
            (Blocked, Pending) | (Blocked, Paused) | (Blocked, Cancelled) |
            // From Paused
            (Paused, Pending) | (Paused, Blocked) | (Paused, Cancelled) |
            // From Running (Pending only via startup recovery)
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) | (Running, Pending) |
            // From Failed with a retry scheduled
            (Failed, Pending) | (Failed, Cancelled) |
            // Rejected at submission, before any worker saw it
            (Pending, Failed) | (Blocked, Failed)
        )
    }

    /// Whether the status alone is final. `Failed` is final only without a pending retry.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "blocked" => Ok(Self::Blocked),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}
