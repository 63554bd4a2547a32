use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The stages of the reelforge pipeline, in canonical order.
///
/// Each job flows through:
/// PENDING → ANALYZING → GENERATING_MUSIC → SELECTING_SONG → GENERATING_IMAGE
/// → PROCESSING_VIDEO → UPLOADING → COMPLETED
///
/// `Failed` sits outside the ordering and is reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Analyzing,
    GeneratingMusic,
    SelectingSong,
    GeneratingImage,
    ProcessingVideo,
    Uploading,
    Completed,
    Failed,
}

/// Stages in pipeline order, excluding `Failed`.
pub const PIPELINE: [Stage; 8] = [
    Stage::Pending,
    Stage::Analyzing,
    Stage::GeneratingMusic,
    Stage::SelectingSong,
    Stage::GeneratingImage,
    Stage::ProcessingVideo,
    Stage::Uploading,
    Stage::Completed,
];

/// How a stage produces its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Nothing to execute (`Pending`, terminal stages).
    Idle,
    /// Calls an external provider through the gateway; may complete asynchronously.
    Provider,
    /// Pure in-process decision over already-resolved results.
    InProcess,
    /// Runs the local media assembler.
    Assembly,
}

impl Stage {
    /// Position in the canonical ordering. `None` for `Failed`.
    pub fn ordinal(self) -> Option<usize> {
        PIPELINE.iter().position(|s| *s == self)
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        let idx = self.ordinal()?;
        PIPELINE.get(idx + 1).copied()
    }

    /// The stage that precedes this one, if any.
    pub fn previous(self) -> Option<Stage> {
        let idx = self.ordinal()?;
        idx.checked_sub(1).map(|i| PIPELINE[i])
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Whether `self` comes strictly after `other` in the pipeline.
    ///
    /// `Failed` is considered past every stage.
    pub fn is_past(self, other: Stage) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    pub fn kind(self) -> StageKind {
        match self {
            Stage::Analyzing | Stage::GeneratingMusic | Stage::GeneratingImage | Stage::Uploading => {
                StageKind::Provider
            }
            Stage::SelectingSong => StageKind::InProcess,
            Stage::ProcessingVideo => StageKind::Assembly,
            Stage::Pending | Stage::Completed | Stage::Failed => StageKind::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Analyzing => "analyzing",
            Stage::GeneratingMusic => "generating_music",
            Stage::SelectingSong => "selecting_song",
            Stage::GeneratingImage => "generating_image",
            Stage::ProcessingVideo => "processing_video",
            Stage::Uploading => "uploading",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PIPELINE
            .iter()
            .chain(std::iter::once(&Stage::Failed))
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
