//! Re-enqueue work for jobs that have no live queue item, e.g. after a restart.

use tracing::{debug, info};

use super::Orchestrator;
use crate::error::PipelineError;
use crate::queue::EnqueueOutcome;
use crate::state_machine::Stage;

/// Counts of what a recovery sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs picked up from the backing store that this process had not seen.
    pub discovered: usize,
    pub advances: usize,
    pub polls: usize,
}

impl Orchestrator {
    /// Sweep non-terminal jobs and enqueue whatever item moves each one forward.
    ///
    /// Dedup keys make this safe to run at any time: items that are already queued or in
    /// flight collapse. Jobs waiting on a webhook get their backstop poll; with
    /// `after_restart` it follows the regular poll schedule instead, since callbacks
    /// accepted by a previous process may have been lost with its queue.
    pub async fn recover(&self, after_restart: bool) -> Result<RecoveryReport, PipelineError> {
        let mut report = RecoveryReport {
            discovered: self.store.refresh().await?,
            ..Default::default()
        };

        for job in self.store.list().await? {
            if job.stage.is_terminal() {
                continue;
            }
            match &job.pending_task {
                None => {
                    let stage = if job.stage == Stage::Pending {
                        Stage::Analyzing
                    } else {
                        job.stage
                    };
                    if self.enqueue_advance(&job.id, stage).await? == EnqueueOutcome::Enqueued {
                        report.advances += 1;
                    }
                }
                Some(task) => {
                    let backstop = task.webhook && !after_restart;
                    let outcome = self
                        .schedule_poll(
                            &job.id,
                            job.stage,
                            &task.provider_task_id,
                            task.poll_attempts + 1,
                            backstop,
                        )
                        .await?;
                    if outcome == EnqueueOutcome::Enqueued {
                        report.polls += 1;
                    } else {
                        debug!(job_id = %job.id, task_id = %task.provider_task_id, "poll already queued");
                    }
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                discovered = report.discovered,
                advances = report.advances,
                polls = report.polls,
                "recovery sweep re-enqueued work"
            );
        }
        Ok(report)
    }
}
