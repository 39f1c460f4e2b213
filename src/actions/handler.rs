//! Handler interface shared by every action.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ActionError;
use crate::events::{EngineEvent, EventBus};
use crate::store::TaskStore;

/// Successful handler outcome.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    /// Stored as the task's `result`.
    pub result: Value,
    /// Keys merged into the task's `context` on completion.
    pub context: Option<Map<String, Value>>,
}

impl ActionOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            context: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Clone)]
struct ProgressSink {
    store: Arc<dyn TaskStore>,
    events: EventBus,
    /// False once the worker has started finalizing the attempt.
    open: Arc<RwLock<bool>>,
}

/// Fire-and-forget progress channel from a handler to the store.
///
/// `report` never blocks the handler. Updates arriving after the task left
/// RUNNING, or after [`ProgressReporter::close`], are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub fn new(task_id: Uuid, store: Arc<dyn TaskStore>, events: EventBus) -> Self {
        Self {
            task_id,
            sink: Some(ProgressSink {
                store,
                events,
                open: Arc::new(RwLock::new(true)),
            }),
        }
    }

    /// A reporter that discards every update.
    pub fn detached(task_id: Uuid) -> Self {
        Self {
            task_id,
            sink: None,
        }
    }

    /// Record `progress` (clamped to 0..=100).
    pub fn report(&self, progress: u8) {
        let progress = progress.min(100);
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let task_id = self.task_id;

        tokio::spawn(async move {
            // Held across persist + publish so `close` waits for this event.
            let open = sink.open.read().await;
            if !*open {
                debug!(task_id = %task_id, progress, "Dropped progress after attempt ended");
                return;
            }
            match sink.store.set_progress(task_id, progress).await {
                Ok(true) => sink.events.publish(EngineEvent::progress(task_id, progress)),
                Ok(false) => debug!(task_id = %task_id, progress, "Dropped progress for non-running task"),
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to persist progress"),
            }
        });
    }

    /// Stop accepting updates. Returns once every in-flight update has been
    /// published, so events sent afterwards follow all progress events.
    pub async fn close(&self) {
        if let Some(sink) = &self.sink {
            *sink.open.write().await = false;
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// Everything a handler gets besides its parameters.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub task_id: Uuid,
    /// Zero on the first attempt.
    pub attempt: u32,
    /// The task's context, unchanged across retries.
    pub context: Map<String, Value>,
    /// `result` of each dependency, keyed by dependency id.
    pub dependency_results: Map<String, Value>,
    pub progress: ProgressReporter,
    /// Cancelled when the task is cancelled or the engine shuts down.
    pub cancel: CancellationToken,
    /// Fresh per invocation; removed after the handler returns.
    pub workdir: PathBuf,
}

impl ActionContext {
    /// Context with no persistence behind it, rooted in `workdir`.
    pub fn detached(task_id: Uuid, workdir: PathBuf) -> Self {
        Self {
            task_id,
            attempt: 0,
            context: Map::new(),
            dependency_results: Map::new(),
            progress: ProgressReporter::detached(task_id),
            cancel: CancellationToken::new(),
            workdir,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An action implementation selected by the task's `action` key.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The `action` key this handler serves.
    fn action(&self) -> &str;

    /// Whether parameters must pass the command denylist before execution.
    fn requires_screening(&self) -> bool {
        false
    }

    /// Run the action. Must return promptly once `ctx.cancel` fires.
    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: ActionContext,
    ) -> Result<ActionOutput, ActionError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    action: &str,
    params: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::InvalidParameters {
            action: action.to_string(),
            reason: format!("missing string parameter `{key}`"),
        })
}

/// Extract an optional string parameter; present-but-not-a-string is an error.
pub fn optional_str<'a>(
    action: &str,
    params: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ActionError::InvalidParameters {
            action: action.to_string(),
            reason: format!("parameter `{key}` must be a string"),
        }),
    }
}
