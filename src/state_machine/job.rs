use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::Stage;

/// LLM tier requested by the user when the job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelChoice {
    Fast,
    #[default]
    Balanced,
    Best,
}

/// Structured result of the analyzing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub title: String,
    pub music_prompt: String,
    pub image_prompt: String,
    pub style: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One generated track returned by the music provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongCandidate {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub audio_url: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub url: String,
    /// Additional images returned alongside `url`, kept for reference.
    #[serde(default)]
    pub alternates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoArtifact {
    pub artifact_ref: String,
    pub duration_secs: f64,
}

/// A record of the final video being made available somewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub destination: String,
    pub external_id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Output produced by a stage, consumed by [`Mutation::Advance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StageOutput {
    Analysis(Analysis),
    Songs(Vec<SongCandidate>),
    Selection(SongCandidate),
    Images(Vec<String>),
    Video(VideoArtifact),
    /// `None` when no publisher is configured.
    Upload(Option<Publication>),
}

impl StageOutput {
    /// The stage whose completion this output represents.
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Analysis(_) => Stage::Analyzing,
            StageOutput::Songs(_) => Stage::GeneratingMusic,
            StageOutput::Selection(_) => Stage::SelectingSong,
            StageOutput::Images(_) => Stage::GeneratingImage,
            StageOutput::Video(_) => Stage::ProcessingVideo,
            StageOutput::Upload(_) => Stage::Uploading,
        }
    }

    /// Stages that expect at least one result yield `false` when the provider returned none.
    pub fn is_usable(&self) -> bool {
        match self {
            StageOutput::Songs(songs) => songs.iter().any(|s| !s.audio_url.trim().is_empty()),
            StageOutput::Images(urls) => urls.iter().any(|u| !u.trim().is_empty()),
            _ => true,
        }
    }
}

/// Bookkeeping for an outstanding asynchronous provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub stage: Stage,
    pub provider_task_id: String,
    pub poll_attempts: u32,
    pub first_scheduled_at: DateTime<Utc>,
    /// Whether a callback URL was handed to the provider at submission time.
    pub webhook: bool,
}

impl PendingTask {
    pub fn new(stage: Stage, provider_task_id: impl Into<String>, webhook: bool) -> Self {
        Self {
            stage,
            provider_task_id: provider_task_id.into(),
            poll_attempts: 0,
            first_scheduled_at: Utc::now(),
            webhook,
        }
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network/HTTP failure that exhausted its retries.
    TransportError,
    /// The provider explicitly reported failure (policy rejection, bad payload).
    ProviderRejection,
    /// The provider never reported a terminal status within the poll budget.
    PollExhausted,
    /// The provider succeeded but returned nothing usable.
    EmptyResult,
    /// The local media assembler failed.
    AssemblyFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransportError => "TransportError",
            FailureKind::ProviderRejection => "ProviderRejection",
            FailureKind::PollExhausted => "PollExhausted",
            FailureKind::EmptyResult => "EmptyResult",
            FailureKind::AssemblyFailed => "AssemblyFailed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// A single concept-to-video job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub concept: String,
    pub model_choice: ModelChoice,
    pub stage: Stage,
    #[serde(default)]
    pub analysis: Option<Analysis>,
    #[serde(default)]
    pub song_candidates: Vec<SongCandidate>,
    #[serde(default)]
    pub selected_song: Option<SongCandidate>,
    #[serde(default)]
    pub image: Option<ImageArtifact>,
    #[serde(default)]
    pub video: Option<VideoArtifact>,
    #[serde(default)]
    pub publications: Vec<Publication>,
    #[serde(default)]
    pub upload_finished: bool,
    #[serde(default)]
    pub pending_task: Option<PendingTask>,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default)]
    pub stage_history: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A change to a job, applied atomically by the job store under a stage guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Move from the previous stage into `stage` without recording output.
    Enter(Stage),
    /// Record a submitted provider call for the current stage.
    RegisterPending(PendingTask),
    /// Bump the poll counter of the outstanding task.
    RecordPoll { task_id: String, attempt: u32 },
    /// Write the current stage's output and move to the next stage.
    Advance(StageOutput),
    /// Terminate the job.
    Fail { kind: FailureKind, message: String },
    /// Attach an extra publication to a completed job.
    AppendPublication(Publication),
}

/// Reasons [`Job::apply`] refuses a mutation. The job is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("job is terminal ({0})")]
    Terminal(Stage),
    #[error("cannot enter {target} from {current}")]
    SkipsStage { current: Stage, target: Stage },
    #[error("{output} output does not belong to stage {current}")]
    WrongStage { current: Stage, output: Stage },
    #[error("a provider task is already outstanding ({0})")]
    PendingTaskOutstanding(String),
    #[error("no outstanding provider task matches {0}")]
    UnknownTask(String),
    #[error("stale poll attempt {attempt} (already at {current})")]
    StalePoll { attempt: u32, current: u32 },
    #[error("output for {0} already recorded")]
    AlreadyRecorded(Stage),
    #[error("{0} produced no usable output")]
    EmptyOutput(Stage),
    #[error("missing prerequisite output from {0}")]
    MissingPrerequisite(Stage),
    #[error("selected song is not one of the generated candidates")]
    UnknownCandidate,
    #[error("publications can only be appended to completed jobs")]
    NotCompleted,
}

impl Job {
    pub fn new(owner: impl Into<String>, concept: impl Into<String>, model_choice: ModelChoice) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            concept: concept.into(),
            model_choice,
            stage: Stage::Pending,
            analysis: None,
            song_candidates: Vec::new(),
            selected_song: None,
            image: None,
            video: None,
            publications: Vec::new(),
            upload_finished: false,
            pending_task: None,
            error_detail: None,
            stage_history: vec![StageRecord {
                stage: Stage::Pending,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a mutation, enforcing the job invariants.
    ///
    /// On `Err` the job is unchanged.
    pub fn apply(&mut self, mutation: Mutation) -> Result<(), Rejection> {
        match mutation {
            Mutation::AppendPublication(publication) => {
                if self.stage != Stage::Completed {
                    return Err(Rejection::NotCompleted);
                }
                self.publications.push(publication);
            }
            _ if self.stage.is_terminal() => return Err(Rejection::Terminal(self.stage)),
            Mutation::Enter(target) => {
                if target.previous() != Some(self.stage) || target.is_terminal() {
                    return Err(Rejection::SkipsStage {
                        current: self.stage,
                        target,
                    });
                }
                self.check_prerequisites(target)?;
                self.move_to(target);
            }
            Mutation::RegisterPending(task) => {
                if task.stage != self.stage {
                    return Err(Rejection::WrongStage {
                        current: self.stage,
                        output: task.stage,
                    });
                }
                if let Some(existing) = &self.pending_task {
                    return Err(Rejection::PendingTaskOutstanding(existing.provider_task_id.clone()));
                }
                self.pending_task = Some(task);
            }
            Mutation::RecordPoll { task_id, attempt } => {
                let task = self
                    .pending_task
                    .as_mut()
                    .filter(|t| t.provider_task_id == task_id)
                    .ok_or(Rejection::UnknownTask(task_id))?;
                if attempt <= task.poll_attempts {
                    return Err(Rejection::StalePoll {
                        attempt,
                        current: task.poll_attempts,
                    });
                }
                task.poll_attempts = attempt;
            }
            Mutation::Advance(output) => {
                if output.stage() != self.stage {
                    return Err(Rejection::WrongStage {
                        current: self.stage,
                        output: output.stage(),
                    });
                }
                self.record_output(output)?;
                self.pending_task = None;
                if let Some(next) = self.stage.next() {
                    self.move_to(next);
                }
            }
            Mutation::Fail { kind, message } => {
                self.error_detail = Some(ErrorDetail {
                    stage: self.stage,
                    kind,
                    message,
                    failed_at: Utc::now(),
                });
                self.pending_task = None;
                self.move_to(Stage::Failed);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    fn move_to(&mut self, stage: Stage) {
        self.stage = stage;
        self.stage_history.push(StageRecord {
            stage,
            at: Utc::now(),
        });
    }

    /// A stage may only start once every earlier stage has recorded its output.
    fn check_prerequisites(&self, stage: Stage) -> Result<(), Rejection> {
        let required = [
            (Stage::Analyzing, self.analysis.is_some()),
            (Stage::GeneratingMusic, !self.song_candidates.is_empty()),
            (Stage::SelectingSong, self.selected_song.is_some()),
            (Stage::GeneratingImage, self.image.is_some()),
            (Stage::ProcessingVideo, self.video.is_some()),
            (Stage::Uploading, self.upload_finished),
        ];
        for (producer, present) in required {
            if stage.is_past(producer) && !present {
                return Err(Rejection::MissingPrerequisite(producer));
            }
        }
        Ok(())
    }

    fn record_output(&mut self, output: StageOutput) -> Result<(), Rejection> {
        let stage = output.stage();
        self.check_prerequisites(stage)?;
        match output {
            StageOutput::Analysis(analysis) => {
                if self.analysis.is_some() {
                    return Err(Rejection::AlreadyRecorded(stage));
                }
                self.analysis = Some(analysis);
            }
            StageOutput::Songs(songs) => {
                if !self.song_candidates.is_empty() {
                    return Err(Rejection::AlreadyRecorded(stage));
                }
                if songs.is_empty() {
                    return Err(Rejection::EmptyOutput(stage));
                }
                self.song_candidates = songs;
            }
            StageOutput::Selection(song) => {
                if self.selected_song.is_some() {
                    return Err(Rejection::AlreadyRecorded(stage));
                }
                if !self.song_candidates.iter().any(|c| c.id == song.id) {
                    return Err(Rejection::UnknownCandidate);
                }
                self.selected_song = Some(song);
            }
            StageOutput::Images(urls) => {
                if self.image.is_some() {
                    return Err(Rejection::AlreadyRecorded(stage));
                }
                let mut urls = urls.into_iter().filter(|u| !u.trim().is_empty());
                let url = urls.next().ok_or(Rejection::EmptyOutput(stage))?;
                self.image = Some(ImageArtifact {
                    url,
                    alternates: urls.collect(),
                });
            }
            StageOutput::Video(video) => {
                if self.video.is_some() {
                    return Err(Rejection::AlreadyRecorded(stage));
                }
                self.video = Some(video);
            }
            StageOutput::Upload(publication) => {
                if self.upload_finished {
                    return Err(Rejection::AlreadyRecorded(stage));
                }
                self.upload_finished = true;
                self.publications.extend(publication);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> Analysis {
        Analysis {
            title: "Night Drive".into(),
            music_prompt: "synthwave, 100bpm".into(),
            image_prompt: "neon highway".into(),
            style: "retro".into(),
            tags: vec!["synthwave".into()],
        }
    }

    fn song(id: &str) -> SongCandidate {
        SongCandidate {
            id: id.into(),
            title: format!("Track {id}"),
            audio_url: format!("https://cdn.example/{id}.mp3"),
            duration_secs: Some(120.0),
            tags: vec![],
        }
    }

    /// A job that has recorded everything up to and including `generating_music`.
    fn job_at_selection() -> Job {
        let mut job = Job::new("owner", "a concept", ModelChoice::Balanced);
        job.apply(Mutation::Enter(Stage::Analyzing)).unwrap();
        job.apply(Mutation::Advance(StageOutput::Analysis(analysis()))).unwrap();
        job.apply(Mutation::Advance(StageOutput::Songs(vec![song("a"), song("b")])))
            .unwrap();
        job
    }

    #[test]
    fn job_creation_defaults() {
        let job = Job::new("owner-1", "Concept", ModelChoice::Best);
        assert_eq!(job.stage, Stage::Pending);
        assert_eq!(job.model_choice, ModelChoice::Best);
        assert!(job.pending_task.is_none());
        assert!(job.error_detail.is_none());
        assert_eq!(job.stage_history.len(), 1);
    }

    #[test]
    fn enter_cannot_skip_a_stage() {
        let mut job = Job::new("o", "c", ModelChoice::Fast);
        let err = job.apply(Mutation::Enter(Stage::GeneratingMusic)).unwrap_err();
        assert_eq!(
            err,
            Rejection::SkipsStage {
                current: Stage::Pending,
                target: Stage::GeneratingMusic
            }
        );
        assert_eq!(job.stage, Stage::Pending);
    }

    #[test]
    fn advance_records_output_and_moves_on() {
        let job = job_at_selection();
        assert_eq!(job.stage, Stage::SelectingSong);
        assert_eq!(job.song_candidates.len(), 2);
        let stages: Vec<Stage> = job.stage_history.iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Pending,
                Stage::Analyzing,
                Stage::GeneratingMusic,
                Stage::SelectingSong
            ]
        );
    }

    #[test]
    fn advance_rejects_output_for_other_stage() {
        let mut job = job_at_selection();
        let err = job
            .apply(Mutation::Advance(StageOutput::Images(vec!["x".into()])))
            .unwrap_err();
        assert!(matches!(err, Rejection::WrongStage { .. }));
    }

    #[test]
    fn selection_must_be_a_candidate() {
        let mut job = job_at_selection();
        let err = job
            .apply(Mutation::Advance(StageOutput::Selection(song("zzz"))))
            .unwrap_err();
        assert_eq!(err, Rejection::UnknownCandidate);
        job.apply(Mutation::Advance(StageOutput::Selection(song("b")))).unwrap();
        assert_eq!(job.stage, Stage::GeneratingImage);
        assert_eq!(job.selected_song.as_ref().unwrap().id, "b");
    }

    #[test]
    fn only_one_pending_task_at_a_time() {
        let mut job = job_at_selection();
        job.apply(Mutation::Advance(StageOutput::Selection(song("a")))).unwrap();
        job.apply(Mutation::RegisterPending(PendingTask::new(
            Stage::GeneratingImage,
            "img-1",
            false,
        )))
        .unwrap();
        let err = job
            .apply(Mutation::RegisterPending(PendingTask::new(
                Stage::GeneratingImage,
                "img-2",
                false,
            )))
            .unwrap_err();
        assert_eq!(err, Rejection::PendingTaskOutstanding("img-1".into()));
    }

    #[test]
    fn pending_task_cleared_on_advance() {
        let mut job = job_at_selection();
        job.apply(Mutation::Advance(StageOutput::Selection(song("a")))).unwrap();
        job.apply(Mutation::RegisterPending(PendingTask::new(
            Stage::GeneratingImage,
            "img-1",
            true,
        )))
        .unwrap();
        job.apply(Mutation::Advance(StageOutput::Images(vec![
            "https://img/1.png".into(),
            "https://img/2.png".into(),
        ])))
        .unwrap();
        assert!(job.pending_task.is_none());
        assert_eq!(job.stage, Stage::ProcessingVideo);
        let image = job.image.unwrap();
        assert_eq!(image.url, "https://img/1.png");
        assert_eq!(image.alternates, vec!["https://img/2.png".to_string()]);
    }

    #[test]
    fn poll_attempts_only_increase() {
        let mut job = job_at_selection();
        job.apply(Mutation::Advance(StageOutput::Selection(song("a")))).unwrap();
        job.apply(Mutation::RegisterPending(PendingTask::new(
            Stage::GeneratingImage,
            "img-1",
            false,
        )))
        .unwrap();
        job.apply(Mutation::RecordPoll {
            task_id: "img-1".into(),
            attempt: 1,
        })
        .unwrap();
        let err = job
            .apply(Mutation::RecordPoll {
                task_id: "img-1".into(),
                attempt: 1,
            })
            .unwrap_err();
        assert_eq!(err, Rejection::StalePoll { attempt: 1, current: 1 });
        let err = job
            .apply(Mutation::RecordPoll {
                task_id: "other".into(),
                attempt: 2,
            })
            .unwrap_err();
        assert_eq!(err, Rejection::UnknownTask("other".into()));
    }

    #[test]
    fn failed_job_is_immutable() {
        let mut job = job_at_selection();
        job.apply(Mutation::Fail {
            kind: FailureKind::EmptyResult,
            message: "nothing".into(),
        })
        .unwrap();
        assert_eq!(job.stage, Stage::Failed);
        let detail = job.error_detail.clone().unwrap();
        assert_eq!(detail.stage, Stage::SelectingSong);
        assert_eq!(detail.kind, FailureKind::EmptyResult);

        let err = job
            .apply(Mutation::Advance(StageOutput::Selection(song("a"))))
            .unwrap_err();
        assert_eq!(err, Rejection::Terminal(Stage::Failed));
        let err = job
            .apply(Mutation::Fail {
                kind: FailureKind::TransportError,
                message: "again".into(),
            })
            .unwrap_err();
        assert_eq!(err, Rejection::Terminal(Stage::Failed));
        assert_eq!(job.error_detail.unwrap().kind, FailureKind::EmptyResult);
        assert!(job.selected_song.is_none());
    }

    #[test]
    fn publications_append_only_after_completion() {
        let mut job = job_at_selection();
        let publication = Publication {
            destination: "youtube".into(),
            external_id: "v1".into(),
            url: None,
            published_at: Utc::now(),
        };
        let err = job
            .apply(Mutation::AppendPublication(publication.clone()))
            .unwrap_err();
        assert_eq!(err, Rejection::NotCompleted);

        job.apply(Mutation::Advance(StageOutput::Selection(song("a")))).unwrap();
        job.apply(Mutation::Advance(StageOutput::Images(vec!["i".into()]))).unwrap();
        job.apply(Mutation::Advance(StageOutput::Video(VideoArtifact {
            artifact_ref: "out/v.mp4".into(),
            duration_secs: 120.0,
        })))
        .unwrap();
        job.apply(Mutation::Advance(StageOutput::Upload(None))).unwrap();
        assert_eq!(job.stage, Stage::Completed);
        assert!(job.publications.is_empty());

        job.apply(Mutation::AppendPublication(publication)).unwrap();
        assert_eq!(job.publications.len(), 1);
    }

    #[test]
    fn stage_output_usability() {
        assert!(!StageOutput::Songs(vec![]).is_usable());
        let mut silent = song("a");
        silent.audio_url = " ".into();
        assert!(!StageOutput::Songs(vec![silent]).is_usable());
        assert!(StageOutput::Songs(vec![song("a")]).is_usable());
        assert!(!StageOutput::Images(vec![String::new()]).is_usable());
        assert!(StageOutput::Upload(None).is_usable());
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::TransportError.to_string(), "TransportError");
        assert_eq!(FailureKind::PollExhausted.to_string(), "PollExhausted");
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = job_at_selection();
        let json = serde_json::to_string(&job).unwrap();
        let parsed: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.stage, Stage::SelectingSong);
        assert_eq!(parsed.song_candidates, job.song_candidates);
    }
}
