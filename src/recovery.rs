//! Startup reconciliation.
//!
//! Runs once before any slot claims work. Nothing cached from before the
//! restart is trusted: the dependency graph is rebuilt from the store, RUNNING
//! tasks are orphans by definition, and retry timers are re-armed from the
//! persisted `retry_at`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::DependencyFailurePolicy;
use crate::error::{Result, TaskError};
use crate::scheduler::{RetryController, Scheduler};
use crate::store::{TaskMutation, TaskStore};
use crate::task::{LogLevel, Task, TaskFilter, TaskStatus};

/// What a recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// RUNNING tasks reset to PENDING.
    pub orphans_reset: usize,
    /// Retry timers armed from persisted `retry_at`.
    pub retries_rearmed: usize,
    /// BLOCKED tasks whose dependencies had all completed.
    pub unblocked: usize,
    /// PENDING tasks waiting on unfinished dependencies.
    pub reblocked: usize,
    /// Dependents cancelled under the cancel policy.
    pub cancelled: usize,
}

impl RecoveryReport {
    /// True when the pass found nothing to repair.
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RecoveryManager {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<Scheduler>,
    retry: Arc<RetryController>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        scheduler: Arc<Scheduler>,
        retry: Arc<RetryController>,
    ) -> Self {
        Self {
            store,
            scheduler,
            retry,
        }
    }

    /// Reconcile persisted state. Running it again right away changes nothing.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        if let Some(cycle) = self.scheduler.rebuild_graph().await? {
            error!(?cycle, "Stored dependencies contain a cycle; tasks on it will never run");
        }

        for task in self.with_status(TaskStatus::Running).await? {
            if self.reset_orphan(&task).await? {
                report.orphans_reset += 1;
            }
        }

        for task in self.with_status(TaskStatus::Failed).await? {
            if let Some(at) = task.retry_at {
                if self.retry.schedule(task.id, at).await {
                    report.retries_rearmed += 1;
                }
            }
        }

        for task in self.with_status(TaskStatus::Blocked).await? {
            if let Some(upstream) = self.dead_dependency(&task).await? {
                if self.scheduler.policy() == DependencyFailurePolicy::Cancel
                    && self.scheduler.cancel_dependent(task.id, upstream).await?
                {
                    report.cancelled += 1;
                }
                continue;
            }
            if self.scheduler.promote(task.id).await? {
                report.unblocked += 1;
            }
        }

        for task in self.with_status(TaskStatus::Pending).await? {
            if self.store.unmet_dependencies(task.id).await? == 0 {
                continue;
            }
            if self.scheduler.demote(task.id).await? {
                warn!(task_id = %task.id, "Pending task had unfinished dependencies; blocked");
                report.reblocked += 1;
            }
            if self.scheduler.policy() == DependencyFailurePolicy::Cancel {
                if let Some(upstream) = self.dead_dependency(&task).await? {
                    if self.scheduler.cancel_dependent(task.id, upstream).await? {
                        report.cancelled += 1;
                    }
                }
            }
        }

        if report.is_clean() {
            info!("Recovery found nothing to repair");
        } else {
            info!(
                orphans = report.orphans_reset,
                retries = report.retries_rearmed,
                unblocked = report.unblocked,
                reblocked = report.reblocked,
                cancelled = report.cancelled,
                "Recovery complete"
            );
        }
        Ok(report)
    }

    async fn with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.store.list(&TaskFilter::new().with_status(status)).await
    }

    async fn dead_dependency(&self, task: &Task) -> Result<Option<uuid::Uuid>> {
        for &dep in &task.dependencies {
            if self.store.get(dep).await?.is_dead() {
                return Ok(Some(dep));
            }
        }
        Ok(None)
    }

    async fn reset_orphan(&self, task: &Task) -> Result<bool> {
        let now = Utc::now();
        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            if t.status != TaskStatus::Running {
                return Err(TaskError::Conflict {
                    id: t.id,
                    state: t.status.to_string(),
                    target: TaskStatus::Pending.to_string(),
                });
            }
            t.transition(TaskStatus::Pending, now)?;
            t.progress = 0;
            Ok(())
        });

        match self.store.update(task.id, mutation).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e),
        }

        self.store
            .append_log(
                task.id,
                LogLevel::Warn,
                &format!(
                    "Recovered after restart: was running with no live worker (attempt {})",
                    task.retry_count + 1
                ),
            )
            .await?;
        warn!(task_id = %task.id, name = %task.name, "Orphaned task reset to pending");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::events::EventBus;
    use crate::scheduler::RetryPolicy;
    use crate::store::LibSqlTaskStore;
    use crate::task::NewTask;

    struct Fixture {
        store: Arc<dyn TaskStore>,
        scheduler: Arc<Scheduler>,
        retry: Arc<RetryController>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store: Arc<dyn TaskStore> =
                Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
            Self {
                scheduler: Arc::new(Scheduler::new(
                    store.clone(),
                    EventBus::new(),
                    DependencyFailurePolicy::RemainBlocked,
                )),
                retry: Arc::new(RetryController::new(RetryPolicy::new(
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                ))),
                store,
            }
        }

        fn manager(&self) -> RecoveryManager {
            RecoveryManager::new(self.store.clone(), self.scheduler.clone(), self.retry.clone())
        }

        async fn create(&self, new: NewTask) -> Task {
            self.store
                .create(new.into_task(3, Utc::now()).unwrap())
                .await
                .unwrap()
        }

        async fn set(&self, id: uuid::Uuid, status: TaskStatus) {
            self.store
                .update(id, Box::new(move |t: &mut Task| t.transition(status, Utc::now())))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn orphans_reset_exactly_once() {
        let f = Fixture::new().await;
        let a = f.create(NewTask::new("a", "x")).await;
        let b = f.create(NewTask::new("b", "x")).await;
        f.store.try_claim(a.id, Utc::now()).await.unwrap().unwrap();

        let first = f.manager().run().await.unwrap();
        assert_eq!(first.orphans_reset, 1);

        let a = f.store.get(a.id).await.unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.retry_count, 0);
        assert_eq!(f.store.get(b.id).await.unwrap().status, TaskStatus::Pending);

        let second = f.manager().run().await.unwrap();
        assert!(second.is_clean(), "{second:?}");

        let warnings = f
            .store
            .logs(a.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.level == LogLevel::Warn)
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn completed_dependency_unblocks_stale_blocked_task() {
        let f = Fixture::new().await;
        let a = f.create(NewTask::new("a", "x")).await;
        let b = f.create(NewTask::new("b", "x").depends_on(a.id)).await;
        assert_eq!(b.status, TaskStatus::Blocked);

        // Crash between completing `a` and releasing `b`.
        f.store.try_claim(a.id, Utc::now()).await.unwrap().unwrap();
        f.set(a.id, TaskStatus::Completed).await;

        let report = f.manager().run().await.unwrap();
        assert_eq!(report.unblocked, 1);
        assert_eq!(f.store.get(b.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(f.scheduler.dependents(a.id).await, vec![b.id]);
    }

    #[tokio::test]
    async fn pending_retries_are_rearmed() {
        let f = Fixture::new().await;
        let a = f.create(NewTask::new("a", "x")).await;
        f.store.try_claim(a.id, Utc::now()).await.unwrap().unwrap();
        let at = Utc::now() + chrono::Duration::seconds(30);
        f.store
            .update(
                a.id,
                Box::new(move |t: &mut Task| {
                    t.transition(TaskStatus::Failed, Utc::now())?;
                    t.retry_count = 1;
                    t.retry_at = Some(at);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let report = f.manager().run().await.unwrap();
        assert_eq!(report.retries_rearmed, 1);
        assert_eq!(f.retry.pending().await, 1);

        assert!(f.manager().run().await.unwrap().is_clean());
        assert_eq!(f.retry.pending().await, 1);
    }
}
