//! Task data model: records, priorities, filters, log entries.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TaskError;
use crate::task::state::TaskStatus;

/// Scheduling priority. Ordering is `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank stored in the database (higher runs first).
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Inverse of [`Priority::rank`]; unknown ranks clamp to the nearest band.
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID, immutable after creation.
    pub id: Uuid,
    /// Store-assigned insertion order; breaks ties between equal `created_at`.
    #[serde(default)]
    pub sequence: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Key selecting the action handler.
    pub action: String,
    /// Passed verbatim to the handler.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Tasks that must complete before this one may run.
    #[serde(default)]
    pub dependencies: BTreeSet<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 0-100, reported by the handler while running.
    pub progress: u8,
    /// Carried across retries and visible to dependents.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable failure classification, e.g. `security_violation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// When a FAILED task becomes PENDING again. `None` on FAILED means terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Terminal tasks never change status again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.retry_at.is_none(),
            _ => false,
        }
    }

    /// Terminal and not successful: dependents can never run.
    pub fn is_dead(&self) -> bool {
        self.is_terminal() && self.status != TaskStatus::Completed
    }

    /// Whether a FAILED task is waiting on a scheduled retry.
    pub fn awaiting_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_at.is_some()
    }

    /// Check that `target` is reachable from the current state.
    pub fn check_transition(&self, target: TaskStatus) -> Result<(), TaskError> {
        if self.is_terminal() || !self.status.can_transition_to(target) {
            return Err(TaskError::Conflict {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// Move to `target`, stamping the lifecycle timestamps.
    pub fn transition(&mut self, target: TaskStatus, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.check_transition(target)?;

        match target {
            TaskStatus::Running => {
                self.started_at = Some(now);
                self.progress = 0;
            }
            TaskStatus::Completed | TaskStatus::Cancelled => {
                self.finished_at = Some(now);
                self.retry_at = None;
            }
            TaskStatus::Failed => {
                self.finished_at = Some(now);
            }
            TaskStatus::Pending if self.status == TaskStatus::Failed => {
                self.retry_at = None;
            }
            _ => {}
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }
}

/// Submission request; turned into a [`Task`] by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Caller-chosen id. A fresh v4 id is assigned when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: BTreeSet<Uuid>,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl NewTask {
    /// Create a submission with sensible defaults.
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    /// Builder: fix the task id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: set one parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Builder: replace all parameters.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add a dependency.
    pub fn depends_on(mut self, id: Uuid) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Builder: set max retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builder: set the initial context.
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Materialise the record. Status starts as PENDING; the store settles
    /// PENDING vs BLOCKED against the dependencies it sees.
    pub fn into_task(self, default_max_retries: u32, now: DateTime<Utc>) -> Result<Task, TaskError> {
        if self.name.trim().is_empty() {
            return Err(TaskError::InvalidInput("task name must not be empty".into()));
        }
        if self.action.trim().is_empty() {
            return Err(TaskError::InvalidInput("task action must not be empty".into()));
        }

        Ok(Task {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            sequence: 0,
            name: self.name,
            description: self.description,
            action: self.action,
            parameters: self.parameters,
            priority: self.priority,
            status: TaskStatus::Pending,
            dependencies: self.dependencies,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            progress: 0,
            context: self.context,
            result: None,
            error: None,
            error_kind: None,
            retry_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Predicate for [`crate::store::TaskStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub priorities: Vec<Priority>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: only tasks in `status` (repeatable).
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Builder: only tasks at `priority` (repeatable).
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priorities.push(priority);
        self
    }

    /// Builder: only tasks for `action`.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Builder: cap the number of rows.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && (self.priorities.is_empty() || self.priorities.contains(&task.priority))
            && self.action.as_deref().is_none_or(|a| a == task.action)
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Append-only record of something that happened to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: Uuid,
    /// Per-task, starting at 1.
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        NewTask::new("t", "shell_command")
            .into_task(3, Utc::now())
            .unwrap()
    }

    #[test]
    fn priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        for p in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
            assert_eq!(Priority::from_rank(p.rank()), p);
        }
    }

    #[test]
    fn new_task_defaults() {
        let t = NewTask::new("build", "shell_command")
            .with_param("command", "make")
            .into_task(5, Utc::now())
            .unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.priority, Priority::Medium);
        assert_eq!(t.max_retries, 5);
        assert_eq!(t.retry_count, 0);
        assert_eq!(t.parameters["command"], "make");
    }

    #[test]
    fn new_task_requires_name_and_action() {
        assert!(NewTask::new("", "shell_command").into_task(0, Utc::now()).is_err());
        assert!(NewTask::new("x", " ").into_task(0, Utc::now()).is_err());
    }

    #[test]
    fn failed_with_retry_is_not_terminal() {
        let mut t = task();
        t.transition(TaskStatus::Running, Utc::now()).unwrap();
        t.transition(TaskStatus::Failed, Utc::now()).unwrap();
        assert!(t.is_terminal());

        t.retry_at = Some(Utc::now());
        assert!(!t.is_terminal());
        assert!(t.awaiting_retry());
        t.transition(TaskStatus::Pending, Utc::now()).unwrap();
        assert!(t.retry_at.is_none());
    }

    #[test]
    fn terminal_tasks_refuse_transitions() {
        let mut t = task();
        t.transition(TaskStatus::Running, Utc::now()).unwrap();
        t.transition(TaskStatus::Completed, Utc::now()).unwrap();
        let err = t.transition(TaskStatus::Pending, Utc::now()).unwrap_err();
        assert!(matches!(err, TaskError::Conflict { .. }));
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn filter_matching() {
        let t = task();
        assert!(TaskFilter::new().matches(&t));
        assert!(TaskFilter::new().with_status(TaskStatus::Pending).matches(&t));
        assert!(!TaskFilter::new().with_status(TaskStatus::Running).matches(&t));
        assert!(!TaskFilter::new().with_priority(Priority::Critical).matches(&t));
        assert!(TaskFilter::new().with_action("shell_command").matches(&t));
    }
}
