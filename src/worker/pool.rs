//! Worker pool: `max_workers` independent slot loops.
//!
//! Each slot claims a ready task, runs its action through the dispatcher and
//! persists the outcome before asking for the next one. Handler failures end
//! up as task state; only store failures stop a slot, and they stop the
//! whole engine with it.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionContext, ActionDispatcher, ActionOutput, ProgressReporter};
use crate::error::{ActionError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::scheduler::{RetryController, RetryDecision, Scheduler, TerminalReason};
use crate::store::{TaskMutation, TaskStore};
use crate::task::{LogLevel, Task, TaskStatus};
use crate::worker::cancel::CancelRegistry;

/// Shared dependencies for every slot.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn TaskStore>,
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub retry: Arc<RetryController>,
    pub events: EventBus,
    pub cancels: Arc<CancelRegistry>,
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub cancel_grace: Duration,
}

/// How one attempt ended, before it is written back.
#[derive(Debug)]
enum Outcome {
    Succeeded(ActionOutput),
    Failed(ActionError),
    /// A user asked for cancellation.
    Cancelled,
    /// The engine is shutting down; the task stays RUNNING for recovery.
    Interrupted,
}

/// Bounded pool of worker slots.
pub struct WorkerPool {
    deps: WorkerDeps,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl WorkerPool {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Slots currently executing a task.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever busy at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Start every slot. They run until `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let slots = self.deps.max_workers.max(1);
        info!(slots, "Starting worker pool");
        (0..slots)
            .map(|slot| {
                let pool = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_slot(slot, shutdown).await })
            })
            .collect()
    }

    async fn run_slot(self: Arc<Self>, slot: usize, shutdown: CancellationToken) {
        debug!(slot, "Worker slot started");
        let scheduler = self.deps.scheduler.clone();

        while !shutdown.is_cancelled() {
            let ready = scheduler.ready_signal();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let result = match scheduler.next_ready().await {
                Ok(Some(task)) => {
                    let busy = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(busy, Ordering::SeqCst);
                    let result = self.execute(slot, task, &shutdown).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    result
                }
                Ok(None) => {
                    tokio::select! {
                        _ = &mut ready => {}
                        _ = tokio::time::sleep(self.deps.poll_interval) => {}
                        _ = shutdown.cancelled() => {}
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    error!(slot, error = %e, "Task store failure, stopping engine");
                    shutdown.cancel();
                    break;
                }
                warn!(slot, error = %e, "Worker slot error");
                tokio::time::sleep(self.deps.poll_interval).await;
            }
        }
        debug!(slot, "Worker slot stopped");
    }

    /// Run one claimed task to a persisted outcome.
    async fn execute(&self, slot: usize, task: Task, shutdown: &CancellationToken) -> Result<()> {
        let deps = &self.deps;
        let id = task.id;
        let token = deps.cancels.register(id, shutdown).await;

        info!(slot, task_id = %id, action = %task.action, attempt = task.retry_count, "Task started");
        deps.events
            .publish(EngineEvent::started(id, &task.action, task.retry_count));
        deps.store
            .append_log(
                id,
                LogLevel::Info,
                &format!("Attempt {} started on slot {slot}", task.retry_count + 1),
            )
            .await?;

        let progress = ProgressReporter::new(id, deps.store.clone(), deps.events.clone());
        let outcome = if token.is_cancelled() {
            None
        } else {
            let ctx = ActionContext {
                task_id: id,
                attempt: task.retry_count,
                context: task.context.clone(),
                dependency_results: self.dependency_results(&task).await?,
                progress: progress.clone(),
                cancel: token.clone(),
                workdir: PathBuf::new(),
            };
            Some(self.run_handler(&task, ctx, &token).await)
        };
        progress.close().await;

        let cancel_requested = deps.cancels.remove(id).await;
        let outcome = match outcome {
            _ if cancel_requested => Outcome::Cancelled,
            None | Some(Err(ActionError::Cancelled)) if shutdown.is_cancelled() => {
                Outcome::Interrupted
            }
            None | Some(Err(ActionError::Cancelled)) => Outcome::Cancelled,
            Some(Ok(output)) => Outcome::Succeeded(output),
            Some(Err(e)) => Outcome::Failed(e),
        };

        match self.finalize(task, outcome).await {
            Err(e) if e.is_conflict() => {
                warn!(task_id = %id, error = %e, "Task changed under the worker; outcome dropped");
                Ok(())
            }
            other => other,
        }
    }

    /// `result` of every dependency, keyed by dependency id.
    async fn dependency_results(&self, task: &Task) -> Result<Map<String, Value>> {
        let mut results = Map::new();
        for &dep in &task.dependencies {
            let upstream = self.deps.store.get(dep).await?;
            results.insert(dep.to_string(), upstream.result.unwrap_or(Value::Null));
        }
        Ok(results)
    }

    /// Dispatch on its own tokio task so a panic stays contained, and give a
    /// cancelled handler `cancel_grace` to wind down before abandoning it.
    async fn run_handler(
        &self,
        task: &Task,
        ctx: ActionContext,
        token: &CancellationToken,
    ) -> std::result::Result<ActionOutput, ActionError> {
        let dispatcher = self.deps.dispatcher.clone();
        let action = task.action.clone();
        let params = task.parameters.clone();
        let mut handle =
            tokio::spawn(async move { dispatcher.dispatch(&action, &params, ctx).await });

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = token.cancelled() => {
                match tokio::time::timeout(self.deps.cancel_grace, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(task_id = %task.id, grace = ?self.deps.cancel_grace, "Handler ignored cancellation, aborting");
                        handle.abort();
                        return Err(ActionError::Cancelled);
                    }
                }
            }
        };

        joined.unwrap_or_else(|e| Err(join_failure(&task.action, e)))
    }

    async fn finalize(&self, task: Task, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Succeeded(output) => self.complete(task, output).await,
            Outcome::Failed(error) => self.fail(task, error).await,
            Outcome::Cancelled => self.cancel(task).await,
            Outcome::Interrupted => {
                self.deps
                    .store
                    .append_log(
                        task.id,
                        LogLevel::Warn,
                        "Interrupted by shutdown; will be recovered on restart",
                    )
                    .await?;
                info!(task_id = %task.id, "Task interrupted by shutdown");
                Ok(())
            }
        }
    }

    async fn complete(&self, task: Task, output: ActionOutput) -> Result<()> {
        let deps = &self.deps;
        let id = task.id;
        let now = Utc::now();
        let result = output.result.clone();

        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            t.transition(TaskStatus::Completed, now)?;
            t.result = Some(output.result);
            t.progress = 100;
            t.error = None;
            t.error_kind = None;
            if let Some(context) = output.context {
                t.context.extend(context);
            }
            Ok(())
        });
        deps.store.update(id, mutation).await?;

        deps.store
            .append_log(id, LogLevel::Info, "Completed")
            .await?;
        deps.events.publish(EngineEvent::completed(id, &result));
        info!(task_id = %id, "Task completed");

        deps.scheduler.on_completed(id).await?;
        Ok(())
    }

    async fn fail(&self, task: Task, error: ActionError) -> Result<()> {
        let deps = &self.deps;
        let id = task.id;
        let now = Utc::now();
        let message = error.to_string();
        let kind = error.kind();

        match deps.retry.decide(&task, &error) {
            RetryDecision::Retry { retry_count, delay } => {
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);

                let stored_message = message.clone();
                let mutation: TaskMutation = Box::new(move |t: &mut Task| {
                    t.transition(TaskStatus::Failed, now)?;
                    t.retry_count = retry_count;
                    t.retry_at = Some(retry_at);
                    t.error = Some(stored_message);
                    t.error_kind = Some(kind.to_string());
                    Ok(())
                });
                deps.store.update(id, mutation).await?;

                deps.store
                    .append_log(
                        id,
                        LogLevel::Warn,
                        &format!(
                            "Attempt failed: {message}; retry {retry_count}/{} in {delay:?}",
                            task.max_retries
                        ),
                    )
                    .await?;
                deps.events
                    .publish(EngineEvent::failed(id, &message, kind, false));
                deps.events
                    .publish(EngineEvent::retry_scheduled(id, retry_count, retry_at));
                warn!(task_id = %id, error = %message, retry_count, ?delay, "Task failed, retry scheduled");

                deps.retry.schedule(id, retry_at).await;
            }
            RetryDecision::Terminal { reason } => {
                let stored_message = message.clone();
                let mutation: TaskMutation = Box::new(move |t: &mut Task| {
                    t.transition(TaskStatus::Failed, now)?;
                    t.retry_at = None;
                    t.error = Some(stored_message);
                    t.error_kind = Some(kind.to_string());
                    Ok(())
                });
                deps.store.update(id, mutation).await?;

                let why = match reason {
                    TerminalReason::NotRetryable => "not retryable",
                    TerminalReason::Exhausted => "retries exhausted",
                };
                deps.store
                    .append_log(id, LogLevel::Error, &format!("Failed ({why}): {message}"))
                    .await?;
                deps.events
                    .publish(EngineEvent::failed(id, &message, kind, true));
                error!(task_id = %id, error = %message, kind, reason = why, "Task failed");

                deps.scheduler.on_terminated(id).await?;
            }
        }
        Ok(())
    }

    async fn cancel(&self, task: Task) -> Result<()> {
        let deps = &self.deps;
        let id = task.id;
        let now = Utc::now();

        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            t.transition(TaskStatus::Cancelled, now)?;
            t.error = Some("Cancelled on request".to_string());
            t.error_kind = Some(ActionError::Cancelled.kind().to_string());
            Ok(())
        });
        deps.store.update(id, mutation).await?;

        deps.store
            .append_log(id, LogLevel::Warn, "Cancelled while running")
            .await?;
        deps.events
            .publish(EngineEvent::cancelled(id, "cancelled while running"));
        info!(task_id = %id, "Task cancelled");

        deps.scheduler.on_terminated(id).await?;
        Ok(())
    }
}

fn join_failure(action: &str, e: JoinError) -> ActionError {
    if e.is_panic() {
        ActionError::transient(action, "handler panicked")
    } else {
        ActionError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use crate::actions::ActionHandler;
    use crate::config::{DependencyFailurePolicy, EngineConfig};
    use crate::scheduler::RetryPolicy;
    use crate::store::LibSqlTaskStore;
    use crate::task::NewTask;

    struct PanickingHandler;

    #[async_trait]
    impl ActionHandler for PanickingHandler {
        fn action(&self) -> &str {
            "panics"
        }

        async fn execute(
            &self,
            _params: &Map<String, Value>,
            _ctx: ActionContext,
        ) -> std::result::Result<ActionOutput, ActionError> {
            panic!("handler bug");
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ActionHandler for EchoHandler {
        fn action(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            params: &Map<String, Value>,
            ctx: ActionContext,
        ) -> std::result::Result<ActionOutput, ActionError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(ActionOutput::new(json!({
                "echo": params.get("value").cloned().unwrap_or(Value::Null),
                "upstream": ctx.dependency_results,
            })))
        }
    }

    async fn pool(dir: &std::path::Path, max_workers: usize) -> Arc<WorkerPool> {
        let config = EngineConfig {
            workdir_root: dir.to_path_buf(),
            file_root: dir.join("files"),
            max_workers,
            poll_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
        let events = EventBus::new();
        let dispatcher = Arc::new(ActionDispatcher::new(&config).unwrap());
        dispatcher.register(Arc::new(PanickingHandler)).await;
        dispatcher.register(Arc::new(EchoHandler)).await;

        Arc::new(WorkerPool::new(WorkerDeps {
            store: store.clone(),
            scheduler: Arc::new(Scheduler::new(
                store,
                events.clone(),
                DependencyFailurePolicy::RemainBlocked,
            )),
            dispatcher,
            retry: Arc::new(RetryController::new(RetryPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(50),
            ))),
            events,
            cancels: Arc::new(CancelRegistry::new()),
            max_workers,
            poll_interval: config.poll_interval,
            cancel_grace: Duration::from_millis(200),
        }))
    }

    async fn submit(pool: &WorkerPool, new: NewTask) -> Uuid {
        let task = pool
            .deps
            .store
            .create(new.into_task(0, Utc::now()).unwrap())
            .await
            .unwrap();
        pool.deps.scheduler.admit(task).await.unwrap().id
    }

    async fn wait_terminal(pool: &WorkerPool, id: Uuid) -> Task {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let task = pool.deps.store.get(id).await.unwrap();
                if task.is_terminal() {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task did not finish in time")
    }

    #[tokio::test]
    async fn dependency_results_flow_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 2).await;
        let shutdown = CancellationToken::new();
        let handles = pool.spawn(shutdown.clone());

        let a = submit(&pool, NewTask::new("a", "echo").with_param("value", "hi")).await;
        let b = submit(&pool, NewTask::new("b", "echo").depends_on(a)).await;

        let b = wait_terminal(&pool, b).await;
        assert_eq!(b.status, TaskStatus::Completed);
        assert_eq!(b.progress, 100);
        assert_eq!(b.result.unwrap()["upstream"][a.to_string()]["echo"], "hi");

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn panicking_handler_fails_task_not_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1).await;
        let shutdown = CancellationToken::new();
        let handles = pool.spawn(shutdown.clone());

        let bad = submit(&pool, NewTask::new("bad", "panics")).await;
        let good = submit(&pool, NewTask::new("good", "echo")).await;

        let bad = wait_terminal(&pool, bad).await;
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.error_kind.as_deref(), Some("application"));

        let good = wait_terminal(&pool, good).await;
        assert_eq!(good.status, TaskStatus::Completed);

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn running_tasks_never_exceed_slots() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 2).await;
        let shutdown = CancellationToken::new();

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(submit(&pool, NewTask::new(format!("t{i}"), "echo")).await);
        }
        let handles = pool.spawn(shutdown.clone());

        for id in ids {
            assert_eq!(wait_terminal(&pool, id).await.status, TaskStatus::Completed);
        }
        assert!(pool.peak() <= 2);
        assert_eq!(pool.active(), 0);

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
