use thiserror::Error;

use crate::state_machine::{FailureKind, Rejection, Stage, UnknownStage};

/// Errors raised while executing a single queued pipeline item.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or HTTP failure; retried by the queue, then escalated.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider explicitly reported failure. Never retried.
    #[error("provider rejected the request: {0}")]
    ProviderRejection(String),

    /// The provider returned nothing usable for a stage that needs at least one result.
    #[error("{0} produced no usable results")]
    EmptyResult(Stage),

    #[error("media assembly failed: {0}")]
    Assembly(String),

    #[error("the stage deadline of {0}s elapsed")]
    Deadline(u64),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The stage produced output the job refused to record.
    #[error("{stage} output refused: {rejection}")]
    Refused { stage: Stage, rejection: Rejection },

    /// A completion arrived while the submission that created its task was still in flight.
    #[error("completion for task {task_id} at {stage} arrived before the task was recorded")]
    TaskNotRecorded { stage: Stage, task_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Transient errors are redelivered by the queue until the retry bound is reached.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(_)
                | PipelineError::Deadline(_)
                | PipelineError::TaskNotRecorded { .. }
                | PipelineError::Queue(_)
        ) || matches!(self, PipelineError::Store(err) if err.is_transient())
    }

    /// The failure recorded on the job when this error terminates it.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::ProviderRejection(_) => FailureKind::ProviderRejection,
            PipelineError::EmptyResult(_) => FailureKind::EmptyResult,
            PipelineError::Assembly(_) => FailureKind::AssemblyFailed,
            PipelineError::Refused { rejection, .. } => match rejection {
                Rejection::EmptyOutput(_)
                | Rejection::UnknownCandidate
                | Rejection::MissingPrerequisite(_) => FailureKind::EmptyResult,
                _ => FailureKind::ProviderRejection,
            },
            _ => FailureKind::TransportError,
        }
    }
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected(msg) => PipelineError::ProviderRejection(msg),
            ProviderError::InvalidResponse(msg) => PipelineError::ProviderRejection(msg),
            ProviderError::NotConfigured(stage) => {
                PipelineError::ProviderRejection(format!("no provider configured for {stage}"))
            }
            other => PipelineError::Transport(other.to_string()),
        }
    }
}

impl From<AssembleError> for PipelineError {
    fn from(err: AssembleError) -> Self {
        match err {
            AssembleError::Download(msg) => PipelineError::Transport(msg),
            AssembleError::Cancelled => PipelineError::Transport("assembly cancelled".into()),
            other => PipelineError::Assembly(other.to_string()),
        }
    }
}

/// Errors from an external generation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Terminal failure reported by the provider (content policy, invalid input).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no provider configured for {0}")]
    NotConfigured(Stage),
}

/// Errors from the local media assembler.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("failed to download asset: {0}")]
    Download(String),

    /// The asset source is not one the assembler may read. Never retried.
    #[error("unusable asset: {0}")]
    Asset(String),

    #[error("encoder exited with {status}: {stderr}")]
    Encoder { status: String, stderr: String },

    #[error("assembly cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Only IO failures may clear up on their own; a missing job or a corrupt record will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown delivery: {0}")]
    UnknownDelivery(u64),
}

/// Rejections at the webhook ingress boundary.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing or invalid webhook token")]
    InvalidToken,

    #[error(transparent)]
    UnknownStage(#[from] UnknownStage),

    #[error("stage {0} does not accept callbacks")]
    NotCallbackStage(Stage),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = ProviderError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn provider_rejection_is_not_transient() {
        let err = PipelineError::from(ProviderError::Rejected("content policy".into()));
        assert!(!err.is_transient());
        assert_eq!(err.failure_kind(), FailureKind::ProviderRejection);
    }

    #[test]
    fn api_errors_are_transport() {
        let err = PipelineError::from(ProviderError::Api {
            status: 503,
            message: "unavailable".into(),
        });
        assert!(err.is_transient());
        assert_eq!(err.failure_kind(), FailureKind::TransportError);
    }

    #[test]
    fn assembly_errors_map_by_cause() {
        assert!(PipelineError::from(AssembleError::Cancelled).is_transient());
        let err = PipelineError::from(AssembleError::Encoder {
            status: "exit status: 1".into(),
            stderr: "bad codec".into(),
        });
        assert!(!err.is_transient());
        assert_eq!(err.failure_kind(), FailureKind::AssemblyFailed);
    }

    #[test]
    fn missing_job_is_not_transient() {
        let missing = PipelineError::from(StoreError::NotFound("gone".into()));
        assert!(!missing.is_transient());
        let io = PipelineError::from(StoreError::Io(std::io::Error::other("disk busy")));
        assert!(io.is_transient());
    }

    #[test]
    fn refused_selection_is_an_empty_result() {
        let err = PipelineError::Refused {
            stage: Stage::SelectingSong,
            rejection: Rejection::UnknownCandidate,
        };
        assert!(!err.is_transient());
        assert_eq!(err.failure_kind(), FailureKind::EmptyResult);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
        assert_send_sync::<WebhookError>();
    }
}
