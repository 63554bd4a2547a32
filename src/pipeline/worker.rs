//! Bounded worker pool pulling items off the task queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Orchestrator, StepOutcome};
use crate::error::PipelineError;
use crate::queue::Delivery;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// How long an idle worker sleeps before looking at the queue again.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval_ms: 250,
        }
    }
}

/// What the worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The item ran to an outcome and was acked.
    Completed(StepOutcome),
    /// The item failed transiently and was put back on the queue.
    Retried(Duration),
    /// The item failed for good; the job was failed and the item acked.
    Escalated(StepOutcome),
    /// Neither the item nor its failure could be recorded against a job; the item was acked.
    Dropped,
}

/// Execute one delivery and settle it on the queue.
///
/// Transient errors are redelivered with exponential backoff until the retry bound; every
/// other error, and a transient one that ran out of attempts, fails the job.
pub async fn handle_delivery(
    orchestrator: &Orchestrator,
    delivery: &Delivery,
    cancel: &CancellationToken,
) -> Result<DeliveryResult, PipelineError> {
    let queue = orchestrator.queue();
    let retry = &orchestrator.settings().retry;

    let error = match orchestrator.execute(&delivery.payload, cancel).await {
        Ok(outcome) => {
            queue.ack(delivery.id).await?;
            return Ok(DeliveryResult::Completed(outcome));
        }
        Err(error) => error,
    };

    // Interrupted by shutdown: hand the item back without spending an attempt.
    if cancel.is_cancelled() {
        queue.release(delivery.id).await?;
        return Ok(DeliveryResult::Retried(Duration::ZERO));
    }

    if error.is_transient() && retry.allows_retry(delivery.attempt) {
        let delay = retry.delay_for_attempt(delivery.attempt);
        warn!(
            key = %delivery.key,
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "transient failure, retrying"
        );
        queue.retry(delivery.id, delay).await?;
        return Ok(DeliveryResult::Retried(delay));
    }

    warn!(key = %delivery.key, attempt = delivery.attempt, %error, "escalating failure");
    match orchestrator.escalate(&delivery.payload, &error).await {
        Ok(outcome) => {
            queue.ack(delivery.id).await?;
            Ok(DeliveryResult::Escalated(outcome))
        }
        Err(escalation) if escalation.is_transient() && retry.allows_retry(delivery.attempt) => {
            error!(key = %delivery.key, error = %escalation, "could not record failure, redelivering");
            let delay = retry.delay_for_attempt(delivery.attempt);
            queue.retry(delivery.id, delay).await?;
            Ok(DeliveryResult::Retried(delay))
        }
        Err(escalation) => {
            error!(key = %delivery.key, error = %escalation, "could not record failure, dropping item");
            queue.ack(delivery.id).await?;
            Ok(DeliveryResult::Dropped)
        }
    }
}

/// A fixed set of workers, each executing one queue item at a time.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            config: WorkerPoolConfig {
                max_workers,
                ..config
            },
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, orchestrator: Orchestrator) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(workers = self.config.max_workers, "starting worker pool");

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut().filter(|_| self.is_running()) else {
            warn!("worker pool already stopped");
            return;
        };

        for i in 0..self.config.max_workers {
            let orchestrator = orchestrator.clone();
            let semaphore = self.semaphore.clone();
            let active = self.active_workers.clone();
            let cancel = self.cancellation_token.clone();
            let notifier = orchestrator.queue().notifier();

            join_set.spawn(async move {
                debug!(worker = i, "worker started");
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let delivery = match orchestrator.queue().dequeue().await {
                        Ok(Some(delivery)) => delivery,
                        Ok(None) => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = notifier.notified() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                            continue;
                        }
                        Err(e) => {
                            error!(worker = i, error = %e, "error dequeuing item");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                            continue;
                        }
                    };

                    let Ok(_permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    active.fetch_add(1, Ordering::SeqCst);
                    debug!(worker = i, key = %delivery.key, attempt = delivery.attempt, "processing item");

                    match handle_delivery(&orchestrator, &delivery, &cancel).await {
                        Ok(DeliveryResult::Completed(outcome)) => {
                            debug!(worker = i, key = %delivery.key, ?outcome, "item done");
                        }
                        Ok(DeliveryResult::Escalated(outcome)) => {
                            info!(worker = i, key = %delivery.key, ?outcome, "item escalated");
                        }
                        Ok(DeliveryResult::Retried(_)) => {}
                        Ok(DeliveryResult::Dropped) => {
                            warn!(worker = i, key = %delivery.key, "item dropped");
                        }
                        Err(e) => {
                            error!(worker = i, key = %delivery.key, error = %e, "failed to settle item");
                        }
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                debug!(worker = i, "worker shutting down");
            });
        }
    }

    /// Cancel the workers and wait for in-flight items to settle.
    pub async fn stop(&self) {
        info!(in_flight = self.active_count(), "stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
        info!("worker pool stopped");
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
