//! The job pipeline orchestrator.
//!
//! Queue items drive everything: an `advance` item runs a stage handler, a `poll` item asks
//! a provider about an outstanding task, and a `resolve` item carries a pushed completion.
//! Handlers never block on a provider; an accepted task suspends the job until the
//! completion listener resolves it.

mod handlers;
mod listener;
mod recovery;
mod worker;


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assembler::MediaAssembler;
use crate::dispatch;
use crate::error::PipelineError;
use crate::provider::ProviderGateway;
use crate::queue::{EnqueueOutcome, TaskPayload, TaskQueue};
use crate::selection::SongSelector;
use crate::state_machine::{
    FailureKind, Job, ModelChoice, Mutation, PollConfig, RetryConfig, Stage,
};
use crate::store::JobStore;

pub use listener::CompletionEvent;
pub use worker::{WorkerPool, WorkerPoolConfig};

/// Where providers should push completions.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub public_base_url: String,
    pub secret: String,
}

impl CallbackConfig {
    /// Token authorising callbacks for one stage of one job.
    pub fn token_for(&self, job_id: &str, stage: Stage) -> String {
        callback_token(&self.secret, job_id, stage)
    }

    pub fn url_for(&self, job_id: &str, stage: Stage) -> String {
        format!(
            "{}/webhooks/{job_id}/{stage}?token={}",
            self.public_base_url.trim_end_matches('/'),
            self.token_for(job_id, stage)
        )
    }
}

/// `hex(sha256(secret ":" job_id ":" stage))`
pub fn callback_token(secret: &str, job_id: &str, stage: Stage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(job_id.as_bytes());
    hasher.update(b":");
    hasher.update(stage.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retry: RetryConfig,
    pub poll: PollConfig,
    /// `None` disables webhooks; every accepted task is then polled.
    pub callback: Option<CallbackConfig>,
    /// Deadline for a single provider or assembler call.
    pub stage_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            callback: None,
            stage_timeout: Duration::from_secs(600),
        }
    }
}

/// What executing one queue item did to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The stage recorded its output; the job is now at the given stage.
    Advanced(Stage),
    /// A provider task is outstanding; the job waits for a completion.
    Suspended,
    /// The job was failed.
    Failed(FailureKind),
    /// The job had already moved on, or the item was stale. Nothing changed.
    Skipped,
}

/// Collaborators shared by all handlers. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    gateway: ProviderGateway,
    assembler: Arc<dyn MediaAssembler>,
    selector: Arc<dyn SongSelector>,
    settings: Arc<PipelineSettings>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        gateway: ProviderGateway,
        assembler: Arc<dyn MediaAssembler>,
        selector: Arc<dyn SongSelector>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            queue,
            gateway,
            assembler,
            selector,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Persist a new job and enqueue its first stage.
    pub async fn create_job(
        &self,
        owner: &str,
        concept: &str,
        model_choice: ModelChoice,
    ) -> Result<Job, PipelineError> {
        if concept.trim().is_empty() {
            return Err(PipelineError::InvalidJob("concept must not be empty".into()));
        }
        let job = Job::new(owner, concept.trim(), model_choice);
        self.store.create(job.clone()).await?;
        self.enqueue_advance(&job.id, Stage::Analyzing).await?;
        info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// Execute one queue item.
    pub async fn execute(
        &self,
        payload: &TaskPayload,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        match payload {
            TaskPayload::Advance { job_id, stage } => self.advance(job_id, *stage, cancel).await,
            TaskPayload::Poll {
                job_id,
                stage,
                task_id,
                attempt,
            } => self.poll(job_id, *stage, task_id, *attempt, cancel).await,
            TaskPayload::Resolve(event) => self.resolve(event.clone()).await,
        }
    }

    /// Fail the job for an item whose error is terminal or whose retries ran out.
    ///
    /// An early completion that never found its task is dropped instead; the backstop poll
    /// of the task settles the stage.
    pub async fn escalate(
        &self,
        payload: &TaskPayload,
        error: &PipelineError,
    ) -> Result<StepOutcome, PipelineError> {
        if let PipelineError::TaskNotRecorded { stage, task_id } = error {
            warn!(job_id = payload.job_id(), %stage, %task_id, "early completion dropped, left to polling");
            return Ok(StepOutcome::Skipped);
        }
        self.fail_stage(
            payload.job_id(),
            payload.stage(),
            error.failure_kind(),
            error.to_string(),
        )
        .await
    }

    pub(crate) async fn fail_stage(
        &self,
        job_id: &str,
        stage: Stage,
        kind: FailureKind,
        message: String,
    ) -> Result<StepOutcome, PipelineError> {
        let outcome = self
            .store
            .try_transition(job_id, stage, Mutation::Fail {
                kind,
                message: message.clone(),
            })
            .await?;
        if outcome.applied {
            warn!(job_id, %stage, %kind, %message, "job failed");
            Ok(StepOutcome::Failed(kind))
        } else {
            Ok(StepOutcome::Skipped)
        }
    }

    pub(crate) async fn enqueue_advance(
        &self,
        job_id: &str,
        stage: Stage,
    ) -> Result<EnqueueOutcome, PipelineError> {
        let key = dispatch::advance_token(job_id, stage);
        let payload = TaskPayload::Advance {
            job_id: job_id.to_string(),
            stage,
        };
        Ok(self.queue.enqueue(&key, payload, Duration::ZERO).await?)
    }

    pub(crate) async fn schedule_poll(
        &self,
        job_id: &str,
        stage: Stage,
        task_id: &str,
        attempt: u32,
        webhook: bool,
    ) -> Result<EnqueueOutcome, PipelineError> {
        let key = dispatch::poll_token(job_id, stage, attempt);
        let payload = TaskPayload::Poll {
            job_id: job_id.to_string(),
            stage,
            task_id: task_id.to_string(),
            attempt,
        };
        let delay = self.settings.poll.delay_for(attempt, webhook);
        Ok(self.queue.enqueue(&key, payload, delay).await?)
    }

    /// Run an external call under the stage deadline and the worker's cancellation.
    pub(crate) async fn with_deadline<T, E, F>(
        &self,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, E>>,
        PipelineError: From<E>,
    {
        let timeout = self.settings.stage_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Transport("call cancelled".into())),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(inner) => inner.map_err(PipelineError::from),
                Err(_) => Err(PipelineError::Deadline(timeout.as_secs())),
            },
        }
    }
}
