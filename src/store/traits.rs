//! `TaskStore` trait: the single async interface to persisted task state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::task::{LogLevel, Task, TaskFilter, TaskLogEntry};

/// Read-modify-write step applied by [`TaskStore::update`] inside one transaction.
pub type TaskMutation = Box<dyn FnOnce(&mut Task) -> std::result::Result<(), TaskError> + Send>;

/// Durable storage for tasks, their dependency edges and their logs.
///
/// Every method is atomic with respect to every other call on the same store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<()>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task together with its dependency edges.
    ///
    /// Rejects unknown dependencies and cycles. The stored status is BLOCKED
    /// when any dependency has not completed, otherwise PENDING. Returns the
    /// task as stored.
    async fn create(&self, task: Task) -> Result<Task>;

    /// Fetch one task. `TaskError::NotFound` when absent.
    async fn get(&self, id: Uuid) -> Result<Task>;

    /// Apply `mutation` to the current record and persist the result.
    ///
    /// Fails with `TaskError::Conflict` when the task is terminal or the
    /// mutation asks for a status change the state machine forbids.
    async fn update(&self, id: Uuid, mutation: TaskMutation) -> Result<Task>;

    /// Atomically move a PENDING task whose dependencies all completed to
    /// RUNNING. `None` when another caller won or the task is not ready.
    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Task>>;

    /// Tasks matching `filter`, highest priority first, then oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Record handler progress. Ignored (returns false) unless the task is RUNNING.
    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<bool>;

    // ── Dependencies ────────────────────────────────────────────────

    /// Every `(task, depends_on)` edge.
    async fn dependency_edges(&self) -> Result<Vec<(Uuid, Uuid)>>;

    /// How many of the task's dependencies have not completed.
    async fn unmet_dependencies(&self, id: Uuid) -> Result<usize>;

    // ── Logs ────────────────────────────────────────────────────────

    /// Append a log entry; sequence numbers are per task and start at 1.
    async fn append_log(&self, id: Uuid, level: LogLevel, message: &str) -> Result<TaskLogEntry>;

    /// All log entries for a task in sequence order.
    async fn logs(&self, id: Uuid) -> Result<Vec<TaskLogEntry>>;
}
