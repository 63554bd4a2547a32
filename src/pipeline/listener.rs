//! Completion listener: webhook pushes and poll results converge on [`Orchestrator::resolve`].

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Orchestrator, StepOutcome};
use crate::dispatch;
use crate::error::{PipelineError, ProviderError, WebhookError};
use crate::provider::TaskStatus;
use crate::queue::{EnqueueOutcome, TaskPayload};
use crate::state_machine::{FailureKind, Job, Mutation, Stage, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    Webhook,
    Poll,
}

/// "A result is available for the task outstanding at `stage`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub stage: Stage,
    pub task_id: String,
    pub status: TaskStatus,
    pub source: CompletionSource,
}

impl Orchestrator {
    /// Resolve the outstanding task of a job.
    ///
    /// Only the first resolution for a (job, stage, task) changes anything; later ones,
    /// from a replayed webhook or a racing poll, are no-ops.
    pub async fn resolve(&self, event: CompletionEvent) -> Result<StepOutcome, PipelineError> {
        let job = self.store.load(&event.job_id).await?;
        if job.stage == event.stage && job.pending_task.is_none() {
            // The submission is still in flight; try again once its task is recorded.
            return Err(PipelineError::TaskNotRecorded {
                stage: event.stage,
                task_id: event.task_id,
            });
        }
        if !owns_task(&job, event.stage, &event.task_id) {
            debug!(
                job_id = %event.job_id,
                stage = %event.stage,
                task_id = %event.task_id,
                current = %job.stage,
                source = ?event.source,
                "stale completion ignored"
            );
            return Ok(StepOutcome::Skipped);
        }

        match event.status {
            TaskStatus::Pending => Ok(StepOutcome::Suspended),
            TaskStatus::Succeeded { output } => {
                info!(job_id = %event.job_id, stage = %event.stage, source = ?event.source, "provider task succeeded");
                self.complete_stage(&event.job_id, event.stage, output).await
            }
            TaskStatus::Failed { reason } => {
                self.fail_stage(
                    &event.job_id,
                    event.stage,
                    FailureKind::ProviderRejection,
                    reason,
                )
                .await
            }
        }
    }

    /// Ask the provider about an outstanding task; reschedule while it is still pending.
    pub(crate) async fn poll(
        &self,
        job_id: &str,
        stage: Stage,
        task_id: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        let job = self.store.load(job_id).await?;
        if !owns_task(&job, stage, task_id) {
            debug!(job_id, %stage, task_id, current = %job.stage, "stale poll ignored");
            return Ok(StepOutcome::Skipped);
        }
        let webhook = job.pending_task.as_ref().is_some_and(|t| t.webhook);

        let provider = self
            .gateway
            .for_stage(stage)?
            .ok_or(ProviderError::NotConfigured(stage))?;
        let status = self
            .with_deadline(cancel, provider.fetch_status(task_id))
            .await?;

        if status != TaskStatus::Pending {
            return self
                .resolve(CompletionEvent {
                    job_id: job_id.to_string(),
                    stage,
                    task_id: task_id.to_string(),
                    status,
                    source: CompletionSource::Poll,
                })
                .await;
        }

        let poll = &self.settings.poll;
        if poll.is_exhausted(attempt + 1) {
            return self
                .fail_stage(
                    job_id,
                    stage,
                    FailureKind::PollExhausted,
                    format!("provider task {task_id} still pending after {attempt} polls"),
                )
                .await;
        }

        let outcome = self
            .store
            .try_transition(job_id, stage, Mutation::RecordPoll {
                task_id: task_id.to_string(),
                attempt,
            })
            .await?;
        if !outcome.applied {
            debug!(job_id, %stage, task_id, attempt, "poll already recorded");
            return Ok(StepOutcome::Skipped);
        }
        self.schedule_poll(job_id, stage, task_id, attempt + 1, webhook)
            .await?;
        debug!(job_id, %stage, task_id, attempt, webhook, "provider task still pending");
        Ok(StepOutcome::Suspended)
    }

    /// Normalise a pushed callback into a queued resolve item.
    ///
    /// Progress reports (still pending) are accepted and dropped.
    pub async fn ingest_callback(
        &self,
        job_id: &str,
        stage: Stage,
        body: &serde_json::Value,
    ) -> Result<EnqueueOutcome, WebhookError> {
        if stage.kind() != StageKind::Provider {
            return Err(WebhookError::NotCallbackStage(stage));
        }
        let provider = self
            .gateway
            .for_stage(stage)
            .ok()
            .flatten()
            .ok_or(WebhookError::NotCallbackStage(stage))?;
        let (task_id, status) = provider
            .parse_callback(body)
            .map_err(|e| WebhookError::Payload(e.to_string()))?;

        if status == TaskStatus::Pending {
            debug!(job_id, %stage, %task_id, "progress callback ignored");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let key = dispatch::resolve_token(job_id, stage, &task_id, status.label());
        let event = CompletionEvent {
            job_id: job_id.to_string(),
            stage,
            task_id,
            status,
            source: CompletionSource::Webhook,
        };
        let outcome = self
            .queue
            .enqueue(&key, TaskPayload::Resolve(event), std::time::Duration::ZERO)
            .await?;
        if outcome == EnqueueOutcome::Duplicate {
            warn!(job_id, %stage, "replayed callback collapsed");
        }
        Ok(outcome)
    }
}

fn owns_task(job: &Job, stage: Stage, task_id: &str) -> bool {
    job.stage == stage
        && job
            .pending_task
            .as_ref()
            .is_some_and(|t| t.stage == stage && t.provider_task_id == task_id)
}
