//! Stage handlers, one per stage, selected by the stage's [`StageKind`].

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Orchestrator, StepOutcome};
use crate::error::{PipelineError, ProviderError};
use crate::provider::{StageInput, Submission, TaskStatus};
use crate::state_machine::{Job, Mutation, PendingTask, Stage, StageKind, StageOutput};

impl Orchestrator {
    /// Run `stage` for the job, if the job is (still) there.
    pub(crate) async fn advance(
        &self,
        job_id: &str,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        let mut job = self.store.load(job_id).await?;

        if job.stage.is_past(stage) {
            debug!(job_id, %stage, current = %job.stage, "job already past stage, skipping");
            return Ok(StepOutcome::Skipped);
        }

        if job.stage != stage {
            if job.stage != Stage::Pending || stage.previous() != Some(Stage::Pending) {
                warn!(job_id, %stage, current = %job.stage, "advance item ahead of job, skipping");
                return Ok(StepOutcome::Skipped);
            }
            let outcome = self
                .store
                .try_transition(job_id, Stage::Pending, Mutation::Enter(stage))
                .await?;
            if outcome.job.stage != stage {
                return Ok(StepOutcome::Skipped);
            }
            job = outcome.job;
        }

        match stage.kind() {
            StageKind::Provider => self.run_provider_stage(job, cancel).await,
            StageKind::InProcess => self.select_song(job).await,
            StageKind::Assembly => self.assemble_video(job, cancel).await,
            StageKind::Idle => Ok(StepOutcome::Skipped),
        }
    }

    async fn run_provider_stage(
        &self,
        job: Job,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        let stage = job.stage;

        // Redelivered after the submission was recorded: never submit twice.
        if let Some(task) = &job.pending_task {
            self.schedule_poll(
                &job.id,
                stage,
                &task.provider_task_id,
                task.poll_attempts + 1,
                task.webhook,
            )
            .await?;
            debug!(job_id = %job.id, %stage, task_id = %task.provider_task_id, "task already outstanding");
            return Ok(StepOutcome::Suspended);
        }

        let Some(provider) = self.gateway.for_stage(stage)? else {
            info!(job_id = %job.id, %stage, "no provider configured, stage skipped");
            return self
                .complete_stage(&job.id, stage, StageOutput::Upload(None))
                .await;
        };

        let callback_url = self
            .settings
            .callback
            .as_ref()
            .filter(|_| provider.supports_callbacks())
            .map(|c| c.url_for(&job.id, stage));
        let input = StageInput::from_job(&job, callback_url.clone());
        info!(job_id = %job.id, %stage, provider = provider.name(), "submitting to provider");
        let submission = self.with_deadline(cancel, provider.submit(&input)).await?;

        match submission {
            Submission::Ready(output) => self.complete_stage(&job.id, stage, output).await,
            Submission::Accepted { task_id } => {
                let webhook = callback_url.is_some();
                let task = PendingTask::new(stage, task_id.clone(), webhook);
                let outcome = self
                    .store
                    .try_transition(&job.id, stage, Mutation::RegisterPending(task))
                    .await?;
                if !outcome.applied {
                    warn!(job_id = %job.id, %stage, %task_id, "could not record provider task, another delivery won");
                    return Ok(StepOutcome::Skipped);
                }
                self.schedule_poll(&job.id, stage, &task_id, 1, webhook).await?;
                info!(job_id = %job.id, %stage, %task_id, webhook, "job suspended awaiting provider");
                Ok(StepOutcome::Suspended)
            }
        }
    }

    async fn select_song(&self, job: Job) -> Result<StepOutcome, PipelineError> {
        let chosen = self
            .selector
            .select(&job.song_candidates, job.analysis.as_ref())
            .ok_or(PipelineError::EmptyResult(Stage::SelectingSong))?;
        info!(job_id = %job.id, song = %chosen.id, "song selected");
        self.complete_stage(&job.id, Stage::SelectingSong, StageOutput::Selection(chosen))
            .await
    }

    async fn assemble_video(
        &self,
        job: Job,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        let (Some(song), Some(image)) = (&job.selected_song, &job.image) else {
            return Err(PipelineError::Assembly(
                "selected song or image missing".into(),
            ));
        };
        let assembled = self
            .with_deadline(
                cancel,
                self.assembler
                    .assemble(cancel.child_token(), &job.id, &song.audio_url, &image.url),
            )
            .await?;
        info!(job_id = %job.id, artifact = %assembled.artifact_ref, "video assembled");
        self.complete_stage(&job.id, Stage::ProcessingVideo, StageOutput::Video(assembled))
            .await
    }

    /// Record a stage's output and enqueue the next stage, exactly once.
    pub(crate) async fn complete_stage(
        &self,
        job_id: &str,
        stage: Stage,
        output: StageOutput,
    ) -> Result<StepOutcome, PipelineError> {
        if output.stage() != stage {
            return Err(PipelineError::ProviderRejection(format!(
                "provider returned {} output for {stage}",
                output.stage()
            )));
        }
        if !output.is_usable() {
            return Err(PipelineError::EmptyResult(stage));
        }

        let outcome = self
            .store
            .try_transition(job_id, stage, Mutation::Advance(output))
            .await?;
        if let Some(rejection) = outcome.rejection {
            return Err(PipelineError::Refused { stage, rejection });
        }
        if !outcome.applied {
            debug!(job_id, %stage, current = %outcome.job.stage, "stage already resolved, no-op");
            return Ok(StepOutcome::Skipped);
        }

        let next = outcome.job.stage;
        if !next.is_terminal() {
            self.enqueue_advance(job_id, next).await?;
        } else {
            info!(job_id, "job completed");
        }
        Ok(StepOutcome::Advanced(next))
    }

    /// Publish a completed job's video again and append the publication.
    ///
    /// Waits for the publisher inline, polling on the configured schedule.
    pub async fn publish(&self, job_id: &str) -> Result<Job, PipelineError> {
        let job = self.store.load(job_id).await?;
        if job.stage != Stage::Completed {
            return Err(PipelineError::InvalidJob(format!(
                "job {job_id} is {} and cannot be published",
                job.stage
            )));
        }
        let provider = self
            .gateway
            .publisher
            .clone()
            .ok_or(ProviderError::NotConfigured(Stage::Uploading))?;
        let cancel = CancellationToken::new();
        let mut input = StageInput::from_job(&job, None);
        input.stage = Stage::Uploading;

        let output = match self.with_deadline(&cancel, provider.submit(&input)).await? {
            Submission::Ready(output) => output,
            Submission::Accepted { task_id } => {
                let poll = &self.settings.poll;
                let mut resolved = None;
                for attempt in 1..=poll.max_attempts {
                    tokio::time::sleep(poll.delay_for_attempt(attempt)).await;
                    match self.with_deadline(&cancel, provider.fetch_status(&task_id)).await? {
                        TaskStatus::Pending => continue,
                        TaskStatus::Succeeded { output } => {
                            resolved = Some(output);
                            break;
                        }
                        TaskStatus::Failed { reason } => {
                            return Err(PipelineError::ProviderRejection(reason));
                        }
                    }
                }
                resolved.ok_or_else(|| {
                    PipelineError::Transport(format!(
                        "publisher task {task_id} did not finish within {} polls",
                        poll.max_attempts
                    ))
                })?
            }
        };

        let StageOutput::Upload(Some(publication)) = output else {
            return Err(PipelineError::ProviderRejection(format!(
                "publisher {} did not report a publication",
                provider.name()
            )));
        };
        let outcome = self
            .store
            .try_transition(job_id, Stage::Completed, Mutation::AppendPublication(publication))
            .await?;
        if !outcome.applied {
            return Err(PipelineError::InvalidJob(format!(
                "job {job_id} changed while publishing"
            )));
        }
        info!(job_id, publications = outcome.job.publications.len(), "job published");
        Ok(outcome.job)
    }
}
