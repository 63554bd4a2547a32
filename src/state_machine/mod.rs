mod job;
mod policy;
mod stage;

pub use job::{
    Analysis, ErrorDetail, FailureKind, ImageArtifact, Job, ModelChoice, Mutation, PendingTask,
    Publication, Rejection, SongCandidate, StageOutput, StageRecord, VideoArtifact,
};
pub use policy::{PollConfig, RetryConfig};
pub use stage::{PIPELINE, Stage, StageKind, UnknownStage};
