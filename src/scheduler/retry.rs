//! Retry policy and deferred retry timers.
//!
//! A failed task that may retry is persisted as FAILED with `retry_at` set and
//! pushed onto a min-heap here. One timer task drains the heap and hands due
//! ids back to the [`Scheduler`], so waiting retries never occupy a worker slot.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ActionError;
use crate::scheduler::Scheduler;
use crate::task::Task;

/// Idle wait when no retry is scheduled; any new schedule wakes the loop early.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Exponential backoff: `base_delay * 2^retry_count`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the attempt numbered `retry_count` (already incremented).
    ///
    /// With base=1s: retry 1 -> 2s, retry 2 -> 4s, retry 3 -> 8s.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Outcome of a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Go back to PENDING after `delay`, with `retry_count` bumped to this value.
    Retry { retry_count: u32, delay: Duration },
    /// Mark FAILED for good.
    Terminal { reason: TerminalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// The error kind is never retried (security, unsupported action, handler said no).
    NotRetryable,
    /// `retry_count` reached `max_retries`.
    Exhausted,
}

/// Decides the fate of failed tasks and owns the retry timer heap.
pub struct RetryController {
    policy: RetryPolicy,
    timers: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>>,
    wake: Notify,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            timers: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide whether `task`, which just failed with `error`, gets another attempt.
    pub fn decide(&self, task: &Task, error: &ActionError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Terminal {
                reason: TerminalReason::NotRetryable,
            };
        }
        if task.retry_count >= task.max_retries {
            return RetryDecision::Terminal {
                reason: TerminalReason::Exhausted,
            };
        }

        let retry_count = task.retry_count + 1;
        RetryDecision::Retry {
            retry_count,
            delay: self.policy.delay_for(retry_count),
        }
    }

    /// Arm a deferred PENDING transition for `task_id` at `at`.
    ///
    /// Returns false if exactly this timer is already armed.
    pub async fn schedule(&self, task_id: Uuid, at: DateTime<Utc>) -> bool {
        let mut timers = self.timers.lock().await;
        let entry = Reverse((at, task_id));
        if timers.iter().any(|armed| *armed == entry) {
            return false;
        }
        timers.push(entry);
        drop(timers);

        debug!(task_id = %task_id, retry_at = %at, "Retry scheduled");
        self.wake.notify_one();
        true
    }

    /// Number of armed timers.
    pub async fn pending(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Earliest armed deadline.
    pub async fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.lock().await.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove and return every id due at or before `now`, earliest first.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut timers = self.timers.lock().await;
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = timers.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, id))) = timers.pop() {
                due.push(id);
            }
        }
        due
    }

    /// Spawn the single timer task that releases due retries.
    pub fn spawn_timer_loop(
        self: Arc<Self>,
        scheduler: Arc<Scheduler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retry timer loop started");
            loop {
                let woken = self.wake.notified();
                tokio::pin!(woken);
                woken.as_mut().enable();

                let now = Utc::now();
                for task_id in self.pop_due(now).await {
                    match scheduler.release_retry(task_id).await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            error!(task_id = %task_id, error = %e, "Failed to persist retry release");
                            shutdown.cancel();
                            return;
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Skipping retry release");
                        }
                    }
                }

                let wait = match self.next_deadline().await {
                    Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                    None => IDLE_WAIT,
                };

                tokio::select! {
                    _ = &mut woken => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("Retry timer loop stopped");
        })
    }
}
