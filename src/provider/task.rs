//! Generic submit/poll task API used by the music, image and publishing services.
//!
//! Wire format (shared by submission responses, status responses and callbacks):
//!
//! ```json
//! { "task_id": "t-1", "status": "pending" | "succeeded" | "failed",
//!   "result": { ... }, "error": "..." }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use super::http::HttpClient;
use super::{Provider, StageInput, Submission, TaskStatus};
use crate::error::ProviderError;
use crate::state_machine::{Publication, SongCandidate, StageOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Music,
    Image,
    Publish,
}

impl TaskKind {
    fn as_str(self) -> &'static str {
        match self {
            TaskKind::Music => "music",
            TaskKind::Image => "image",
            TaskKind::Publish => "publish",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    task_id: String,
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MusicResult {
    #[serde(default)]
    tracks: Vec<SongCandidate>,
}

#[derive(Debug, Deserialize)]
struct ImageResult {
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PublishResult {
    external_id: String,
    #[serde(default)]
    url: Option<String>,
}

pub struct TaskApiProvider {
    kind: TaskKind,
    name: String,
    base_url: String,
    api_key: String,
    callbacks: bool,
    http: HttpClient,
}

impl TaskApiProvider {
    pub fn new(kind: TaskKind, name: impl Into<String>, base_url: String, api_key: String, http: HttpClient) -> Self {
        Self {
            kind,
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            callbacks: true,
            http,
        }
    }

    /// Turn off callback URLs for services that cannot push; their tasks are polled.
    pub fn with_callbacks(mut self, callbacks: bool) -> Self {
        self.callbacks = callbacks;
        self
    }

    fn request_body(&self, input: &StageInput) -> Result<Value, ProviderError> {
        let payload = match self.kind {
            TaskKind::Music => {
                let analysis = input
                    .analysis
                    .as_ref()
                    .ok_or_else(|| ProviderError::Rejected("music generation needs an analysis".into()))?;
                json!({
                    "prompt": analysis.music_prompt,
                    "title": analysis.title,
                    "style": analysis.style,
                    "tags": analysis.tags,
                })
            }
            TaskKind::Image => {
                let analysis = input
                    .analysis
                    .as_ref()
                    .ok_or_else(|| ProviderError::Rejected("image generation needs an analysis".into()))?;
                json!({ "prompt": analysis.image_prompt, "style": analysis.style })
            }
            TaskKind::Publish => {
                let video = input
                    .video
                    .as_ref()
                    .ok_or_else(|| ProviderError::Rejected("publishing needs an assembled video".into()))?;
                json!({
                    "video": video.artifact_ref,
                    "title": input.analysis.as_ref().map(|a| a.title.as_str()).unwrap_or(input.concept.as_str()),
                    "description": input.concept,
                })
            }
        };
        Ok(json!({
            "kind": self.kind.as_str(),
            "reference": input.job_id,
            "input": payload,
            "callback_url": input.callback_url,
        }))
    }

    fn decode(&self, envelope: TaskEnvelope) -> Result<(String, TaskStatus), ProviderError> {
        let status = match envelope.status.as_str() {
            "pending" | "queued" | "processing" => TaskStatus::Pending,
            "failed" | "rejected" => TaskStatus::Failed {
                reason: envelope.error.unwrap_or_else(|| "provider reported failure".into()),
            },
            "succeeded" | "completed" => {
                let result = envelope.result.unwrap_or_else(|| json!({}));
                TaskStatus::Succeeded {
                    output: self.decode_result(result)?,
                }
            }
            other => {
                return Err(ProviderError::InvalidResponse(format!("unknown task status {other:?}")));
            }
        };
        Ok((envelope.task_id, status))
    }

    fn decode_result(&self, result: Value) -> Result<StageOutput, ProviderError> {
        let invalid = |e: serde_json::Error| ProviderError::InvalidResponse(e.to_string());
        Ok(match self.kind {
            TaskKind::Music => {
                let r: MusicResult = serde_json::from_value(result).map_err(invalid)?;
                StageOutput::Songs(r.tracks)
            }
            TaskKind::Image => {
                let r: ImageResult = serde_json::from_value(result).map_err(invalid)?;
                StageOutput::Images(r.images)
            }
            TaskKind::Publish => {
                let r: PublishResult = serde_json::from_value(result).map_err(invalid)?;
                StageOutput::Upload(Some(Publication {
                    destination: self.name.clone(),
                    external_id: r.external_id,
                    url: r.url,
                    published_at: Utc::now(),
                }))
            }
        })
    }
}

#[async_trait]
impl Provider for TaskApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_callbacks(&self) -> bool {
        self.callbacks
    }

    async fn submit(&self, input: &StageInput) -> Result<Submission, ProviderError> {
        let body = self.request_body(input)?;
        let url = format!("{}/v1/tasks", self.base_url);
        let envelope: TaskEnvelope = self
            .http
            .send_json(|c| c.post(&url).bearer_auth(&self.api_key).json(&body))
            .await?;
        match self.decode(envelope)? {
            (task_id, TaskStatus::Pending) => Ok(Submission::Accepted { task_id }),
            (_, TaskStatus::Succeeded { output }) => Ok(Submission::Ready(output)),
            (_, TaskStatus::Failed { reason }) => Err(ProviderError::Rejected(reason)),
        }
    }

    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let url = format!("{}/v1/tasks/{task_id}", self.base_url);
        let envelope: TaskEnvelope = self
            .http
            .send_json(|c| c.get(&url).bearer_auth(&self.api_key))
            .await?;
        let (reported, status) = self.decode(envelope)?;
        if reported != task_id {
            return Err(ProviderError::InvalidResponse(format!(
                "asked for task {task_id}, provider answered for {reported}"
            )));
        }
        Ok(status)
    }

    fn parse_callback(&self, body: &Value) -> Result<(String, TaskStatus), ProviderError> {
        let envelope: TaskEnvelope = serde_json::from_value(body.clone())
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        self.decode(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Analysis, Job, ModelChoice, RetryConfig};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(kind: TaskKind, base_url: String) -> TaskApiProvider {
        let http = HttpClient::new(Duration::from_secs(5), RetryConfig::default()).unwrap();
        TaskApiProvider::new(kind, kind.as_str(), base_url, "key".into(), http)
    }

    fn analyzed_job() -> Job {
        let mut job = Job::new("o", "desert road trip", ModelChoice::Balanced);
        job.analysis = Some(Analysis {
            title: "Mirage".into(),
            music_prompt: "desert rock".into(),
            image_prompt: "endless highway".into(),
            style: "warm".into(),
            tags: vec!["rock".into()],
        });
        job
    }

    #[tokio::test]
    async fn submit_music_returns_task_id_and_forwards_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tasks"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(json!({
                "kind": "music",
                "input": {"prompt": "desert rock"},
                "callback_url": "https://hooks.example/cb"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "mus-1", "status": "processing"
            })))
            .mount(&server)
            .await;

        let p = provider(TaskKind::Music, server.uri());
        let input = StageInput::from_job(&analyzed_job(), Some("https://hooks.example/cb".into()));
        let submission = p.submit(&input).await.unwrap();
        assert_eq!(
            submission,
            Submission::Accepted {
                task_id: "mus-1".into()
            }
        );
    }

    #[tokio::test]
    async fn fetch_status_decodes_tracks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/tasks/mus-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "mus-1",
                "status": "succeeded",
                "result": {"tracks": [
                    {"id": "a", "title": "A", "audio_url": "https://cdn/a.mp3", "duration_secs": 95.0},
                    {"id": "b", "audio_url": "https://cdn/b.mp3"}
                ]}
            })))
            .mount(&server)
            .await;

        let p = provider(TaskKind::Music, server.uri());
        match p.fetch_status("mus-1").await.unwrap() {
            TaskStatus::Succeeded {
                output: StageOutput::Songs(tracks),
            } => {
                assert_eq!(tracks.len(), 2);
                assert_eq!(tracks[0].duration_secs, Some(95.0));
                assert!(tracks[1].title.is_empty());
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_submission_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "img-1", "status": "failed", "error": "content policy"
            })))
            .mount(&server)
            .await;

        let p = provider(TaskKind::Image, server.uri());
        let err = p
            .submit(&StageInput::from_job(&analyzed_job(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(ref m) if m == "content policy"));
    }

    #[test]
    fn parse_callback_image_payload() {
        let p = provider(TaskKind::Image, "http://unused".into());
        let (task_id, status) = p
            .parse_callback(&json!({
                "task_id": "img-9",
                "status": "completed",
                "result": {"images": ["https://img/1.png"]}
            }))
            .unwrap();
        assert_eq!(task_id, "img-9");
        assert_eq!(
            status,
            TaskStatus::Succeeded {
                output: StageOutput::Images(vec!["https://img/1.png".into()])
            }
        );
    }

    #[test]
    fn parse_callback_rejects_unknown_status() {
        let p = provider(TaskKind::Music, "http://unused".into());
        assert!(p
            .parse_callback(&json!({"task_id": "x", "status": "exploded"}))
            .is_err());
    }

    #[test]
    fn publish_requires_video() {
        let p = provider(TaskKind::Publish, "http://unused".into());
        let err = p
            .request_body(&StageInput::from_job(&analyzed_job(), None))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }
}
