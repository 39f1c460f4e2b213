//! Scheduler: readiness, exactly-once claims and dependency propagation.
//!
//! The store decides what is claimable (the claim is one guarded `UPDATE`),
//! the scheduler decides what to try and in which order, and pushes status
//! changes along dependency edges when a task finishes. The in-memory
//! [`DependencyGraph`] only answers "who waits on this task"; statuses are
//! always read back from the store.

pub mod graph;
pub mod retry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DependencyFailurePolicy;
use crate::error::{ActionError, Result, TaskError};
use crate::events::{EngineEvent, EventBus};
use crate::store::{TaskMutation, TaskStore};
use crate::task::{LogLevel, Task, TaskFilter, TaskStatus};

pub use graph::DependencyGraph;
pub use retry::{RetryController, RetryDecision, RetryPolicy, TerminalReason};

/// How many PENDING candidates one `next_ready` call tries to claim.
const CLAIM_BATCH: usize = 16;

/// Error kind recorded on tasks cancelled because an upstream task died.
pub const DEPENDENCY_FAILED: &str = "dependency_failed";

/// Mutation that moves a task from one of `expected` to `target`.
fn guarded(expected: &'static [TaskStatus], target: TaskStatus, now: DateTime<Utc>) -> TaskMutation {
    Box::new(move |t: &mut Task| {
        if !expected.contains(&t.status) {
            return Err(TaskError::Conflict {
                id: t.id,
                state: t.status.to_string(),
                target: target.to_string(),
            });
        }
        t.transition(target, now)
    })
}

/// Picks the next task for idle slots and propagates completion and failure
/// to dependents.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    graph: RwLock<DependencyGraph>,
    ready: Notify,
    events: EventBus,
    policy: DependencyFailurePolicy,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, events: EventBus, policy: DependencyFailurePolicy) -> Self {
        Self {
            store,
            graph: RwLock::new(DependencyGraph::new()),
            ready: Notify::new(),
            events,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn policy(&self) -> DependencyFailurePolicy {
        self.policy
    }

    // ── Claiming ────────────────────────────────────────────────────

    /// Claim the highest-priority, oldest ready task.
    ///
    /// Safe to call from many slots at once: each candidate is claimed with
    /// an atomic store update, so a task is handed to at most one caller.
    pub async fn next_ready(&self) -> Result<Option<Task>> {
        let filter = TaskFilter::new()
            .with_status(TaskStatus::Pending)
            .with_limit(CLAIM_BATCH);

        for candidate in self.store.list(&filter).await? {
            if let Some(task) = self.store.try_claim(candidate.id, Utc::now()).await? {
                debug!(task_id = %task.id, priority = %task.priority, "Claimed task");
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Wake every slot waiting for work.
    pub fn notify_ready(&self) {
        self.ready.notify_waiters();
    }

    /// Future resolving on the next [`Scheduler::notify_ready`].
    ///
    /// Enable it before calling [`Scheduler::next_ready`] so a wakeup between
    /// the empty claim and the wait is not lost.
    pub fn ready_signal(&self) -> Notified<'_> {
        self.ready.notified()
    }

    // ── Graph ───────────────────────────────────────────────────────

    /// Replace the graph with the edges currently in the store.
    ///
    /// Returns a cycle if the stored edges contain one.
    pub async fn rebuild_graph(&self) -> Result<Option<Vec<Uuid>>> {
        let edges = self.store.dependency_edges().await?;
        let graph = DependencyGraph::from_edges(edges);
        let cycle = graph.detect_cycle();
        info!(tasks = graph.len(), "Dependency graph rebuilt");
        *self.graph.write().await = graph;
        Ok(cycle)
    }

    pub async fn dependents(&self, id: Uuid) -> Vec<Uuid> {
        self.graph.read().await.dependents(id)
    }

    /// Register a freshly created task and settle its initial status.
    ///
    /// A BLOCKED task whose dependencies finished in the meantime is promoted;
    /// one waiting on a dead dependency follows the failure policy.
    pub async fn admit(&self, mut task: Task) -> Result<Task> {
        self.graph
            .write()
            .await
            .add_task(task.id, task.dependencies.iter().copied());

        if task.status == TaskStatus::Blocked {
            match self.dead_dependency(&task).await? {
                Some(upstream) => {
                    if self.policy == DependencyFailurePolicy::Cancel {
                        self.cancel_dependent(task.id, upstream).await?;
                    } else {
                        self.store
                            .append_log(
                                task.id,
                                LogLevel::Warn,
                                &format!("Dependency {upstream} will never complete"),
                            )
                            .await?;
                    }
                }
                None => {
                    self.promote(task.id).await?;
                }
            }
            task = self.store.get(task.id).await?;
        }

        if task.status == TaskStatus::Pending {
            self.notify_ready();
        }
        Ok(task)
    }

    async fn dead_dependency(&self, task: &Task) -> Result<Option<Uuid>> {
        for &dep in &task.dependencies {
            if self.store.get(dep).await?.is_dead() {
                return Ok(Some(dep));
            }
        }
        Ok(None)
    }

    // ── Propagation ─────────────────────────────────────────────────

    /// BLOCKED -> PENDING when every dependency has completed.
    ///
    /// Returns false when the task is not BLOCKED or still waits on something.
    pub async fn promote(&self, id: Uuid) -> Result<bool> {
        if self.store.unmet_dependencies(id).await? > 0 {
            return Ok(false);
        }
        match self
            .store
            .update(id, guarded(&[TaskStatus::Blocked], TaskStatus::Pending, Utc::now()))
            .await
        {
            Ok(_) => {
                self.store
                    .append_log(id, LogLevel::Info, "All dependencies completed")
                    .await?;
                debug!(task_id = %id, "Task unblocked");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// PENDING -> BLOCKED for a task that can no longer run.
    pub async fn demote(&self, id: Uuid) -> Result<bool> {
        match self
            .store
            .update(id, guarded(&[TaskStatus::Pending], TaskStatus::Blocked, Utc::now()))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cancel `id` because `upstream` died.
    pub async fn cancel_dependent(&self, id: Uuid, upstream: Uuid) -> Result<bool> {
        let reason = format!("Dependency {upstream} did not complete");
        let error = reason.clone();
        let now = Utc::now();
        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            if !matches!(
                t.status,
                TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Paused
            ) {
                return Err(TaskError::Conflict {
                    id: t.id,
                    state: t.status.to_string(),
                    target: TaskStatus::Cancelled.to_string(),
                });
            }
            t.transition(TaskStatus::Cancelled, now)?;
            t.error = Some(error);
            t.error_kind = Some(DEPENDENCY_FAILED.to_string());
            Ok(())
        });

        match self.store.update(id, mutation).await {
            Ok(_) => {
                self.store.append_log(id, LogLevel::Warn, &reason).await?;
                self.events.publish(EngineEvent::cancelled(id, &reason));
                info!(task_id = %id, upstream = %upstream, "Cancelled dependent of failed task");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fail a freshly submitted task that can never run: its action is
    /// unknown or denylisted. The task is terminal straight away, whatever
    /// its dependencies are doing.
    pub async fn reject(&self, id: Uuid, error: &ActionError) -> Result<bool> {
        let message = error.to_string();
        let kind = error.kind();
        let stored = message.clone();
        let now = Utc::now();
        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            if !matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked) {
                return Err(TaskError::Conflict {
                    id: t.id,
                    state: t.status.to_string(),
                    target: TaskStatus::Failed.to_string(),
                });
            }
            t.transition(TaskStatus::Failed, now)?;
            t.retry_at = None;
            t.error = Some(stored);
            t.error_kind = Some(kind.to_string());
            Ok(())
        });

        match self.store.update(id, mutation).await {
            Ok(_) => {}
            // A worker got to it first; dispatch applies the same checks.
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e),
        }

        self.store
            .append_log(id, LogLevel::Error, &format!("Rejected at submission: {message}"))
            .await?;
        self.events
            .publish(EngineEvent::failed(id, &message, kind, true));
        warn!(task_id = %id, error = %message, kind, "Task rejected");

        self.on_terminated(id).await?;
        Ok(true)
    }

    /// `id` completed: release direct dependents that are now ready.
    pub async fn on_completed(&self, id: Uuid) -> Result<usize> {
        let mut released = 0;
        for dependent in self.dependents(id).await {
            if self.store.get(dependent).await?.status != TaskStatus::Blocked {
                continue;
            }
            if self.promote(dependent).await? {
                released += 1;
            }
        }
        if released > 0 {
            debug!(task_id = %id, released, "Released dependents");
            self.notify_ready();
        }
        Ok(released)
    }

    /// `id` died (terminal FAILED or CANCELLED): apply the failure policy to
    /// every direct and transitive dependent.
    pub async fn on_terminated(&self, id: Uuid) -> Result<usize> {
        let dependents = self.graph.read().await.transitive_dependents(id);
        let mut affected = 0;

        for dependent in dependents {
            let changed = match self.policy {
                DependencyFailurePolicy::Cancel => self.cancel_dependent(dependent, id).await?,
                DependencyFailurePolicy::RemainBlocked => {
                    let task = self.store.get(dependent).await?;
                    if task.is_terminal() {
                        continue;
                    }
                    if task.status == TaskStatus::Pending {
                        self.demote(dependent).await?;
                    }
                    self.store
                        .append_log(
                            dependent,
                            LogLevel::Warn,
                            &format!("Upstream task {id} will never complete; remaining blocked"),
                        )
                        .await?;
                    true
                }
            };
            if changed {
                affected += 1;
            }
        }

        if affected > 0 {
            warn!(task_id = %id, affected, policy = ?self.policy, "Upstream task died");
        }
        Ok(affected)
    }

    /// Move a FAILED task whose retry is due back to PENDING.
    ///
    /// Returns `None` when the task is no longer waiting on a retry
    /// (cancelled in the meantime, or already released).
    pub async fn release_retry(&self, id: Uuid) -> Result<Option<Task>> {
        let now = Utc::now();
        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            if !t.awaiting_retry() {
                return Err(TaskError::Conflict {
                    id: t.id,
                    state: t.status.to_string(),
                    target: TaskStatus::Pending.to_string(),
                });
            }
            t.transition(TaskStatus::Pending, now)
        });

        let task = match self.store.update(id, mutation).await {
            Ok(task) => task,
            Err(e) if e.is_conflict() => {
                debug!(task_id = %id, "Retry no longer pending");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.store
            .append_log(
                id,
                LogLevel::Info,
                &format!("Retry {} of {} released", task.retry_count, task.max_retries),
            )
            .await?;
        info!(task_id = %id, retry = task.retry_count, "Retry released");
        self.notify_ready();
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlTaskStore;
    use crate::task::{NewTask, Priority};

    async fn scheduler(policy: DependencyFailurePolicy) -> Scheduler {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
        Scheduler::new(store, EventBus::new(), policy)
    }

    async fn submit(s: &Scheduler, new: NewTask) -> Task {
        let task = s
            .store()
            .create(new.into_task(3, Utc::now()).unwrap())
            .await
            .unwrap();
        s.admit(task).await.unwrap()
    }

    async fn finish(s: &Scheduler, id: Uuid, status: TaskStatus) {
        s.store()
            .update(
                id,
                Box::new(move |t: &mut Task| t.transition(status, Utc::now())),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claims_follow_priority_then_age() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let low = submit(&s, NewTask::new("low", "x").with_priority(Priority::Low)).await;
        let high = submit(&s, NewTask::new("high", "x").with_priority(Priority::High)).await;
        let critical =
            submit(&s, NewTask::new("critical", "x").with_priority(Priority::Critical)).await;

        let mut order = Vec::new();
        while let Some(task) = s.next_ready().await.unwrap() {
            assert_eq!(task.status, TaskStatus::Running);
            order.push(task.id);
        }
        assert_eq!(order, vec![critical.id, high.id, low.id]);
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_task_once() {
        let s = Arc::new(scheduler(DependencyFailurePolicy::RemainBlocked).await);
        for i in 0..5 {
            submit(&s, NewTask::new(format!("t{i}"), "x")).await;
        }

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = s.clone();
                tokio::spawn(async move { s.next_ready().await.unwrap().map(|t| t.id) })
            })
            .collect();

        let mut claimed = Vec::new();
        for h in handles {
            if let Some(id) = h.await.unwrap() {
                claimed.push(id);
            }
        }
        // Slots that lost every race come back empty and retry later.
        let mut unique = claimed.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), claimed.len());

        while let Some(task) = s.next_ready().await.unwrap() {
            claimed.push(task.id);
        }
        assert_eq!(claimed.len(), 5);
    }

    #[tokio::test]
    async fn completion_releases_blocked_dependent() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let a = submit(&s, NewTask::new("a", "x")).await;
        let b = submit(&s, NewTask::new("b", "x").depends_on(a.id)).await;
        assert_eq!(b.status, TaskStatus::Blocked);

        let claimed = s.next_ready().await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert!(s.next_ready().await.unwrap().is_none(), "b must wait for a");

        finish(&s, a.id, TaskStatus::Completed).await;
        assert_eq!(s.on_completed(a.id).await.unwrap(), 1);

        assert_eq!(s.store().get(b.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(s.next_ready().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn admit_promotes_when_dependency_already_completed() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let a = submit(&s, NewTask::new("a", "x")).await;
        s.next_ready().await.unwrap();
        finish(&s, a.id, TaskStatus::Completed).await;

        let b = submit(&s, NewTask::new("b", "x").depends_on(a.id)).await;
        assert_eq!(b.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn dead_upstream_leaves_dependents_blocked() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let a = submit(&s, NewTask::new("a", "x")).await;
        let b = submit(&s, NewTask::new("b", "x").depends_on(a.id)).await;
        let c = submit(&s, NewTask::new("c", "x").depends_on(b.id)).await;

        s.next_ready().await.unwrap();
        finish(&s, a.id, TaskStatus::Failed).await;
        s.on_terminated(a.id).await.unwrap();

        for id in [b.id, c.id] {
            let task = s.store().get(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Blocked);
            let logs = s.store().logs(id).await.unwrap();
            assert!(logs.iter().any(|l| l.level == LogLevel::Warn));
        }
        assert!(s.next_ready().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_policy_cancels_transitive_dependents() {
        let s = scheduler(DependencyFailurePolicy::Cancel).await;
        let mut events = s.events.subscribe();
        let a = submit(&s, NewTask::new("a", "x")).await;
        let b = submit(&s, NewTask::new("b", "x").depends_on(a.id)).await;
        let c = submit(&s, NewTask::new("c", "x").depends_on(b.id)).await;

        s.next_ready().await.unwrap();
        finish(&s, a.id, TaskStatus::Cancelled).await;
        assert_eq!(s.on_terminated(a.id).await.unwrap(), 2);

        for id in [b.id, c.id] {
            let task = s.store().get(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert_eq!(task.error_kind.as_deref(), Some(DEPENDENCY_FAILED));
        }
        let first = events.recv().await.unwrap();
        assert_eq!(first.task_id, b.id);

        // A late submission against a dead dependency is cancelled on arrival.
        let d = submit(&s, NewTask::new("d", "x").depends_on(a.id)).await;
        assert_eq!(d.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn reject_fails_blocked_task_terminally() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let mut events = s.events.subscribe();
        let a = submit(&s, NewTask::new("a", "x")).await;
        let b = s
            .store()
            .create(
                NewTask::new("b", "teleport")
                    .depends_on(a.id)
                    .into_task(3, Utc::now())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);

        let error = ActionError::Unsupported {
            action: "teleport".to_string(),
        };
        assert!(s.reject(b.id, &error).await.unwrap());
        assert!(!s.reject(b.id, &error).await.unwrap());

        let b = s.store().get(b.id).await.unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert!(b.is_terminal());
        assert_eq!(b.error_kind.as_deref(), Some("unsupported_action"));
        assert_eq!(b.retry_count, 0);

        let event = events.recv().await.unwrap();
        assert_eq!(event.task_id, b.id);
        assert_eq!(event.payload["terminal"], true);
    }

    #[tokio::test]
    async fn release_retry_is_one_shot() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let a = submit(&s, NewTask::new("a", "x")).await;
        s.next_ready().await.unwrap();
        s.store()
            .update(
                a.id,
                Box::new(|t: &mut Task| {
                    t.transition(TaskStatus::Failed, Utc::now())?;
                    t.retry_count = 1;
                    t.retry_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let released = s.release_retry(a.id).await.unwrap().unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.retry_count, 1);
        assert!(released.retry_at.is_none());

        assert!(s.release_retry(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_graph_restores_dependents() {
        let s = scheduler(DependencyFailurePolicy::RemainBlocked).await;
        let a = submit(&s, NewTask::new("a", "x")).await;
        let b = submit(&s, NewTask::new("b", "x").depends_on(a.id)).await;

        *s.graph.write().await = DependencyGraph::new();
        assert!(s.dependents(a.id).await.is_empty());

        assert!(s.rebuild_graph().await.unwrap().is_none());
        assert_eq!(s.dependents(a.id).await, vec![b.id]);
    }
}
