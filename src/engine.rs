//! `WorkEngine`: the submission API and the owner of every background task.
//!
//! ```text
//! submit ──► TaskStore ◄── WorkerPool (N slots) ──► ActionDispatcher
//!               ▲   ▲            │
//!               │   └── Scheduler ◄── RetryController timer
//!               └────── RecoveryManager (once, at start)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actions::ActionDispatcher;
use crate::config::EngineConfig;
use crate::error::{Result, TaskError};
use crate::events::{EngineEvent, EventBus};
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::scheduler::{RetryController, RetryPolicy, Scheduler};
use crate::store::{LibSqlTaskStore, TaskMutation, TaskStore};
use crate::task::{LogLevel, NewTask, Task, TaskFilter, TaskLogEntry, TaskStatus};
use crate::worker::{CancelRegistry, WorkerDeps, WorkerPool};

/// How often `cancel` re-reads a task that changed under it.
const CANCEL_ATTEMPTS: usize = 5;

/// Extra time on top of `cancel_grace` that shutdown waits for each slot.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(1);

fn conflict(task: &Task, target: TaskStatus) -> TaskError {
    TaskError::Conflict {
        id: task.id,
        state: task.status.to_string(),
        target: target.to_string(),
    }
}

pub struct WorkEngine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<ActionDispatcher>,
    retry: Arc<RetryController>,
    events: EventBus,
    cancels: Arc<CancelRegistry>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkEngine {
    /// Open the database at `config.db_path` with the built-in actions.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(LibSqlTaskStore::new_local(&config.db_path).await?);
        let dispatcher = ActionDispatcher::with_builtins(&config)?;
        Ok(Self::with_store(config, store, dispatcher))
    }

    /// Assemble an engine around an existing store and dispatcher.
    pub fn with_store(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        dispatcher: ActionDispatcher,
    ) -> Self {
        let events = EventBus::new();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            events.clone(),
            config.dependency_failure_policy,
        ));
        let dispatcher = Arc::new(dispatcher);
        let retry = Arc::new(RetryController::new(RetryPolicy::new(
            config.base_retry_delay,
            config.max_retry_delay,
        )));
        let cancels = Arc::new(CancelRegistry::new());

        let pool = Arc::new(WorkerPool::new(WorkerDeps {
            store: store.clone(),
            scheduler: scheduler.clone(),
            dispatcher: dispatcher.clone(),
            retry: retry.clone(),
            events: events.clone(),
            cancels: cancels.clone(),
            max_workers: config.max_workers,
            poll_interval: config.poll_interval,
            cancel_grace: config.cancel_grace,
        }));

        Self {
            config,
            store,
            scheduler,
            dispatcher,
            retry,
            events,
            cancels,
            pool,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Recover persisted state, then start the worker slots and the retry timer.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TaskError::InvalidInput("engine already started".into()).into());
        }

        let report = RecoveryManager::new(
            self.store.clone(),
            self.scheduler.clone(),
            self.retry.clone(),
        )
        .run()
        .await?;

        let mut handles = self.pool.spawn(self.shutdown.clone());
        handles.push(
            self.retry
                .clone()
                .spawn_timer_loop(self.scheduler.clone(), self.shutdown.clone()),
        );
        self.handles.lock().await.extend(handles);

        info!(
            workers = self.config.max_workers,
            policy = ?self.config.dependency_failure_policy,
            "Work engine started"
        );
        Ok(report)
    }

    // ── Submission API ──────────────────────────────────────────────

    /// Persist a new task and make it eligible for scheduling.
    ///
    /// An unknown or denylisted action is still recorded, but as a terminal
    /// FAILED task that no worker ever picks up.
    pub async fn submit(&self, new: NewTask) -> Result<Uuid> {
        let task = new.into_task(self.config.default_max_retries, Utc::now())?;
        let rejection = self
            .dispatcher
            .screen(&task.action, &task.parameters)
            .await
            .err();
        let task = self.store.create(task).await?;
        let id = task.id;

        self.store
            .append_log(
                id,
                LogLevel::Info,
                &format!("Submitted as {} ({})", task.status, task.action),
            )
            .await?;
        self.events
            .publish(EngineEvent::created(id, &task.name, task.status.as_str()));
        info!(task_id = %id, name = %task.name, action = %task.action, status = %task.status, "Task submitted");

        match rejection {
            Some(error) => {
                self.scheduler.reject(id, &error).await?;
            }
            None => {
                self.scheduler.admit(task).await?;
            }
        }
        Ok(id)
    }

    /// Cancel a task.
    ///
    /// A RUNNING task gets its handler interrupted and is finalized by its
    /// worker; anything else not yet terminal is cancelled here. Terminal
    /// tasks fail with `Conflict`.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        for _ in 0..CANCEL_ATTEMPTS {
            let task = self.store.get(id).await?;
            if task.is_terminal() {
                return Err(conflict(&task, TaskStatus::Cancelled).into());
            }

            if task.status == TaskStatus::Running {
                self.cancels.request(id).await;
                // The worker may have written its outcome in the meantime.
                if self.store.get(id).await?.status == TaskStatus::Running {
                    info!(task_id = %id, "Cancellation requested for running task");
                    return Ok(());
                }
                self.cancels.remove(id).await;
                continue;
            }

            let now = Utc::now();
            let mutation: TaskMutation = Box::new(move |t: &mut Task| {
                if t.status == TaskStatus::Running {
                    return Err(conflict(t, TaskStatus::Cancelled));
                }
                t.transition(TaskStatus::Cancelled, now)?;
                t.error = Some("Cancelled on request".to_string());
                t.error_kind = Some("cancelled".to_string());
                Ok(())
            });

            match self.store.update(id, mutation).await {
                Ok(task) => {
                    self.store
                        .append_log(id, LogLevel::Warn, "Cancelled on request")
                        .await?;
                    self.events
                        .publish(EngineEvent::cancelled(id, "cancelled on request"));
                    info!(task_id = %id, name = %task.name, "Task cancelled");
                    self.scheduler.on_terminated(id).await?;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        let task = self.store.get(id).await?;
        Err(conflict(&task, TaskStatus::Cancelled).into())
    }

    /// Hold a PENDING or BLOCKED task back from scheduling.
    pub async fn pause(&self, id: Uuid) -> Result<Task> {
        let now = Utc::now();
        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            if !matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked) {
                return Err(conflict(t, TaskStatus::Paused));
            }
            t.transition(TaskStatus::Paused, now)
        });
        let task = self.store.update(id, mutation).await?;
        self.store.append_log(id, LogLevel::Info, "Paused").await?;
        info!(task_id = %id, "Task paused");
        Ok(task)
    }

    /// Return a PAUSED task to PENDING, or BLOCKED if it still waits on dependencies.
    pub async fn resume(&self, id: Uuid) -> Result<Task> {
        let target = if self.store.unmet_dependencies(id).await? == 0 {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        let now = Utc::now();
        let mutation: TaskMutation = Box::new(move |t: &mut Task| {
            if t.status != TaskStatus::Paused {
                return Err(conflict(t, target));
            }
            t.transition(target, now)
        });
        let mut task = self.store.update(id, mutation).await?;
        self.store
            .append_log(id, LogLevel::Info, &format!("Resumed as {target}"))
            .await?;
        info!(task_id = %id, status = %target, "Task resumed");

        if target == TaskStatus::Pending {
            self.scheduler.notify_ready();
        } else {
            // The readiness read above is not atomic with the write: the last
            // dependency may have completed in between, or died while paused.
            task = self.scheduler.admit(task).await?;
        }
        Ok(task)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Task> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list(filter).await
    }

    /// Persisted log entries of a task, oldest first.
    pub async fn logs(&self, id: Uuid) -> Result<Vec<TaskLogEntry>> {
        self.store.get(id).await?;
        self.store.logs(id).await
    }

    // ── Observation ─────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> BroadcastStream<EngineEvent> {
        self.events.stream()
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Slots executing a task right now.
    pub fn active_workers(&self) -> usize {
        self.pool.active()
    }

    /// Most slots ever busy at once since start.
    pub fn peak_workers(&self) -> usize {
        self.pool.peak()
    }

    /// Resolves once the engine stops, by request or after a store failure.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stop claiming, interrupt running handlers and wait for the slots.
    ///
    /// Tasks interrupted here stay RUNNING in the store and are picked up by
    /// recovery on the next start.
    pub async fn shutdown(&self) {
        info!("Shutting down work engine");
        self.shutdown.cancel();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let wait = self.config.cancel_grace + SHUTDOWN_MARGIN;
        for handle in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(wait, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task ended abnormally"),
                Err(_) => {
                    warn!("Background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!("Work engine stopped");
    }
}
