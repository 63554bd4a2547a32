//! Task queue with delayed delivery and dedup keys.
//!
//! Delivery is at-least-once: an item stays owned by the queue until it is acked, and a
//! failed attempt is put back with a delay via [`TaskQueue::retry`]. Enqueueing a key that
//! is already queued, in flight, or was acked within the dedup window is a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::QueueError;
use crate::pipeline::CompletionEvent;
use crate::state_machine::Stage;

/// Work item payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run `stage` for the job.
    Advance { job_id: String, stage: Stage },
    /// Ask the provider about the task outstanding at `stage`.
    Poll {
        job_id: String,
        stage: Stage,
        task_id: String,
        attempt: u32,
    },
    /// A pushed completion waiting to be resolved.
    Resolve(CompletionEvent),
}

impl TaskPayload {
    pub fn job_id(&self) -> &str {
        match self {
            TaskPayload::Advance { job_id, .. } | TaskPayload::Poll { job_id, .. } => job_id,
            TaskPayload::Resolve(event) => &event.job_id,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            TaskPayload::Advance { stage, .. } | TaskPayload::Poll { stage, .. } => *stage,
            TaskPayload::Resolve(event) => event.stage,
        }
    }
}

/// One delivery of a queued item.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: u64,
    pub key: String,
    pub payload: TaskPayload,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        key: &str,
        payload: TaskPayload,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Take the next item whose scheduled time has passed, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery as done. Its key stays deduplicated for the dedup window.
    async fn ack(&self, delivery_id: u64) -> Result<(), QueueError>;

    /// Put a delivery back to be delivered again after `delay`.
    async fn retry(&self, delivery_id: u64, delay: Duration) -> Result<(), QueueError>;

    /// Put a delivery back for immediate redelivery without counting it as an attempt.
    async fn release(&self, delivery_id: u64) -> Result<(), QueueError>;

    /// Signalled whenever an item is enqueued or rescheduled.
    fn notifier(&self) -> Arc<Notify>;
}

#[derive(Debug)]
struct Entry {
    id: u64,
    key: String,
    payload: TaskPayload,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    scheduled: BTreeMap<(Instant, u64), Entry>,
    in_flight: HashMap<u64, Entry>,
    live_keys: HashSet<String>,
    settled: HashMap<String, Instant>,
}

/// In-process [`TaskQueue`].
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
    dedup_window: Duration,
    notify: Arc<Notify>,
}

impl MemoryTaskQueue {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            dedup_window,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[cfg(test)]
impl MemoryTaskQueue {
    /// When the earliest scheduled item becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.state.lock().scheduled.keys().next().map(|(at, _)| *at)
    }

    /// Items scheduled or in flight.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.scheduled.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently scheduled, in delivery order.
    pub fn scheduled_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .scheduled
            .values()
            .map(|e| e.key.clone())
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(
        &self,
        key: &str,
        payload: TaskPayload,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let window = self.dedup_window;
            state
                .settled
                .retain(|_, acked_at| now.duration_since(*acked_at) < window);

            if state.live_keys.contains(key) || state.settled.contains_key(key) {
                debug!(key, "duplicate enqueue collapsed");
                return Ok(EnqueueOutcome::Duplicate);
            }

            state.next_id += 1;
            let id = state.next_id;
            state.live_keys.insert(key.to_string());
            state.scheduled.insert(
                (now + delay, id),
                Entry {
                    id,
                    key: key.to_string(),
                    payload,
                    attempt: 0,
                },
            );
            debug!(key, delay_ms = delay.as_millis() as u64, "task enqueued");
        }
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let due = match state.scheduled.keys().next() {
            Some(slot) if slot.0 <= now => *slot,
            _ => return Ok(None),
        };
        let Some(mut entry) = state.scheduled.remove(&due) else {
            return Ok(None);
        };
        entry.attempt += 1;
        let delivery = Delivery {
            id: entry.id,
            key: entry.key.clone(),
            payload: entry.payload.clone(),
            attempt: entry.attempt,
        };
        state.in_flight.insert(entry.id, entry);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_id: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let entry = state
            .in_flight
            .remove(&delivery_id)
            .ok_or(QueueError::UnknownDelivery(delivery_id))?;
        state.live_keys.remove(&entry.key);
        if !self.dedup_window.is_zero() {
            state.settled.insert(entry.key, Instant::now());
        }
        Ok(())
    }

    async fn retry(&self, delivery_id: u64, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .in_flight
                .remove(&delivery_id)
                .ok_or(QueueError::UnknownDelivery(delivery_id))?;
            debug!(key = %entry.key, attempt = entry.attempt, "task rescheduled");
            state.scheduled.insert((Instant::now() + delay, entry.id), entry);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn release(&self, delivery_id: u64) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let mut entry = state
                .in_flight
                .remove(&delivery_id)
                .ok_or(QueueError::UnknownDelivery(delivery_id))?;
            entry.attempt = entry.attempt.saturating_sub(1);
            debug!(key = %entry.key, "task released");
            state.scheduled.insert((Instant::now(), entry.id), entry);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
