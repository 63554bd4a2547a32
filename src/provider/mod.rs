//! Provider Gateway: typed wrappers around the external generation services.
//!
//! Providers know nothing about the pipeline. They accept a [`StageInput`], report either
//! an immediate result or an accepted task id, and answer status queries for that id.

pub mod http;
pub mod llm;
pub mod task;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::state_machine::{Analysis, Job, ModelChoice, SongCandidate, Stage, StageOutput, VideoArtifact};

pub use llm::LlmProvider;
pub use task::{TaskApiProvider, TaskKind};

/// Everything a provider may need to run one stage of one job.
#[derive(Debug, Clone, Serialize)]
pub struct StageInput {
    pub job_id: String,
    pub stage: Stage,
    pub concept: String,
    pub model_choice: ModelChoice,
    pub analysis: Option<Analysis>,
    pub selected_song: Option<SongCandidate>,
    pub video: Option<VideoArtifact>,
    /// Where the provider should push its completion, when webhooks are configured.
    pub callback_url: Option<String>,
}

impl StageInput {
    pub fn from_job(job: &Job, callback_url: Option<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            stage: job.stage,
            concept: job.concept.clone(),
            model_choice: job.model_choice,
            analysis: job.analysis.clone(),
            selected_song: job.selected_song.clone(),
            video: job.video.clone(),
            callback_url,
        }
    }
}

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The provider answered synchronously.
    Ready(StageOutput),
    /// The provider is processing; completion arrives by webhook or poll.
    Accepted { task_id: String },
}

/// Provider-reported state of an accepted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Succeeded { output: StageOutput },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Succeeded { .. } => "succeeded",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the provider can push completions to a callback URL.
    fn supports_callbacks(&self) -> bool {
        true
    }

    async fn submit(&self, input: &StageInput) -> Result<Submission, ProviderError>;

    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatus, ProviderError>;

    /// Translate a pushed callback body into the task id it reports on and its status.
    fn parse_callback(&self, body: &serde_json::Value) -> Result<(String, TaskStatus), ProviderError>;
}

/// One provider per external stage. The publisher is optional.
#[derive(Clone)]
pub struct ProviderGateway {
    pub llm: Arc<dyn Provider>,
    pub music: Arc<dyn Provider>,
    pub image: Arc<dyn Provider>,
    pub publisher: Option<Arc<dyn Provider>>,
}

impl ProviderGateway {
    /// The provider responsible for `stage`.
    ///
    /// `Ok(None)` means the stage is optional and nothing is configured for it.
    pub fn for_stage(&self, stage: Stage) -> Result<Option<Arc<dyn Provider>>, ProviderError> {
        match stage {
            Stage::Analyzing => Ok(Some(self.llm.clone())),
            Stage::GeneratingMusic => Ok(Some(self.music.clone())),
            Stage::GeneratingImage => Ok(Some(self.image.clone())),
            Stage::Uploading => Ok(self.publisher.clone()),
            other => Err(ProviderError::NotConfigured(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_wire_format() {
        let status: TaskStatus = serde_json::from_str(r#"{"state":"pending"}"#).unwrap();
        assert_eq!(status, TaskStatus::Pending);

        let status: TaskStatus =
            serde_json::from_str(r#"{"state":"failed","reason":"policy"}"#).unwrap();
        assert_eq!(status.label(), "failed");
    }

    #[test]
    fn stage_input_copies_job_fields() {
        let job = Job::new("owner", "lofi rain", ModelChoice::Fast);
        let input = StageInput::from_job(&job, Some("https://hooks/x".into()));
        assert_eq!(input.job_id, job.id);
        assert_eq!(input.concept, "lofi rain");
        assert_eq!(input.stage, Stage::Pending);
        assert_eq!(input.callback_url.as_deref(), Some("https://hooks/x"));
    }
}
