//! Lifecycle event feed for external observers (UI, log shippers).
//!
//! Events are broadcast on a `tokio::sync::broadcast` channel. Publishing
//! never blocks and never fails the engine: with no subscribers the event is
//! simply dropped, and a slow subscriber sees `Lagged` instead of stalling workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;
use uuid::Uuid;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    RetryScheduled,
}

/// One entry in the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub task_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl EngineEvent {
    pub fn new(task_id: Uuid, event_type: EventType, payload: Value) -> Self {
        Self {
            task_id,
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn created(task_id: Uuid, name: &str, status: &str) -> Self {
        Self::new(
            task_id,
            EventType::Created,
            json!({ "name": name, "status": status }),
        )
    }

    pub fn started(task_id: Uuid, action: &str, attempt: u32) -> Self {
        Self::new(
            task_id,
            EventType::Started,
            json!({ "action": action, "attempt": attempt }),
        )
    }

    pub fn progress(task_id: Uuid, progress: u8) -> Self {
        Self::new(task_id, EventType::Progress, json!({ "progress": progress }))
    }

    pub fn completed(task_id: Uuid, result: &Value) -> Self {
        Self::new(task_id, EventType::Completed, json!({ "result": result }))
    }

    pub fn failed(task_id: Uuid, error: &str, kind: &str, terminal: bool) -> Self {
        Self::new(
            task_id,
            EventType::Failed,
            json!({ "error": error, "error_kind": kind, "terminal": terminal }),
        )
    }

    pub fn cancelled(task_id: Uuid, reason: &str) -> Self {
        Self::new(task_id, EventType::Cancelled, json!({ "reason": reason }))
    }

    pub fn retry_scheduled(task_id: Uuid, retry_count: u32, retry_at: DateTime<Utc>) -> Self {
        Self::new(
            task_id,
            EventType::RetryScheduled,
            json!({ "retry_count": retry_count, "retry_at": retry_at }),
        )
    }
}

/// Broadcast hub for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: EngineEvent) {
        trace!(task_id = %event.task_id, event = ?event.event_type, "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Same feed as [`EventBus::subscribe`], as a `Stream`.
    ///
    /// Items are `Err` when the consumer lagged and events were skipped.
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
