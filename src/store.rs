//! Durable job store.
//!
//! Every mutation goes through [`JobStore::try_transition`], a compare-and-swap on the
//! job's current stage. [`FileJobStore`] keeps jobs in memory behind one async lock per
//! job and, when opened on a directory, writes each accepted change to disk before the
//! in-memory copy is replaced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state_machine::{Job, Mutation, Rejection, Stage};

/// Result of a guarded transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// Whether the mutation was written.
    pub applied: bool,
    /// The job as stored after the call.
    pub job: Job,
    /// Why the mutation was refused, when the stage guard passed but the job refused it.
    pub rejection: Option<Rejection>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<(), StoreError>;

    async fn load(&self, job_id: &str) -> Result<Job, StoreError>;

    /// Apply `mutation` only if the job is currently at `expected`.
    ///
    /// A stage mismatch or a refused mutation is reported as `applied == false`, not as an error.
    async fn try_transition(
        &self,
        job_id: &str,
        expected: Stage,
        mutation: Mutation,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Pick up jobs created by other processes sharing the same backing storage.
    async fn refresh(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

pub struct FileJobStore {
    dir: Option<PathBuf>,
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

impl FileJobStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a store persisted as one JSON file per job under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self {
            dir: Some(dir),
            jobs: RwLock::new(HashMap::new()),
        };
        let loaded = store.scan_dir().await?;
        info!(jobs = loaded, "job store opened");
        Ok(store)
    }

    /// Load job files this store has not seen yet.
    async fn scan_dir(&self) -> Result<usize, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            let job: Job = match serde_json::from_str(&contents) {
                Ok(job) => job,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job file");
                    continue;
                }
            };
            let mut jobs = self.jobs.write();
            if !jobs.contains_key(&job.id) {
                jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    fn slot(&self, job_id: &str) -> Result<Arc<Mutex<Job>>, StoreError> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", job.id));
        let tmp = dir.join(format!(".{}.json.tmp", job.id));
        let contents = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        if self.jobs.read().contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        self.persist(&job).await?;
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        debug!(job_id = %job.id, "job created");
        jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Job, StoreError> {
        let slot = self.slot(job_id)?;
        let job = slot.lock().await;
        Ok(job.clone())
    }

    async fn try_transition(
        &self,
        job_id: &str,
        expected: Stage,
        mutation: Mutation,
    ) -> Result<TransitionOutcome, StoreError> {
        let slot = self.slot(job_id)?;
        let mut current = slot.lock().await;

        if current.stage != expected {
            debug!(
                job_id,
                expected = %expected,
                actual = %current.stage,
                "stage guard failed, transition skipped"
            );
            return Ok(TransitionOutcome {
                applied: false,
                job: current.clone(),
                rejection: None,
            });
        }

        let mut candidate = current.clone();
        if let Err(rejection) = candidate.apply(mutation) {
            debug!(job_id, stage = %expected, %rejection, "mutation refused");
            return Ok(TransitionOutcome {
                applied: false,
                job: current.clone(),
                rejection: Some(rejection),
            });
        }

        self.persist(&candidate).await?;
        if candidate.stage != current.stage {
            info!(job_id, from = %current.stage, to = %candidate.stage, "stage transition");
        }
        *current = candidate;
        Ok(TransitionOutcome {
            applied: true,
            job: current.clone(),
            rejection: None,
        })
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let slots: Vec<Arc<Mutex<Job>>> = self.jobs.read().values().cloned().collect();
        let mut jobs = Vec::with_capacity(slots.len());
        for slot in slots {
            jobs.push(slot.lock().await.clone());
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn refresh(&self) -> Result<usize, StoreError> {
        self.scan_dir().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{FailureKind, ModelChoice};

    fn new_job() -> Job {
        Job::new("owner", "rainy city at night", ModelChoice::Balanced)
    }

    #[tokio::test]
    async fn transition_applies_when_stage_matches() {
        let store = FileJobStore::in_memory();
        let job = new_job();
        let id = job.id.clone();
        store.create(job).await.unwrap();

        let outcome = store
            .try_transition(&id, Stage::Pending, Mutation::Enter(Stage::Analyzing))
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.job.stage, Stage::Analyzing);
        assert_eq!(store.load(&id).await.unwrap().stage, Stage::Analyzing);
    }

    #[tokio::test]
    async fn transition_is_noop_on_stage_mismatch() {
        let store = FileJobStore::in_memory();
        let job = new_job();
        let id = job.id.clone();
        store.create(job).await.unwrap();

        let outcome = store
            .try_transition(&id, Stage::Analyzing, Mutation::Enter(Stage::GeneratingMusic))
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert!(outcome.rejection.is_none());
        assert_eq!(outcome.job.stage, Stage::Pending);
    }

    #[tokio::test]
    async fn refused_mutation_leaves_job_untouched() {
        let store = FileJobStore::in_memory();
        let job = new_job();
        let id = job.id.clone();
        store.create(job).await.unwrap();

        let outcome = store
            .try_transition(&id, Stage::Pending, Mutation::Enter(Stage::Uploading))
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert!(matches!(outcome.rejection, Some(Rejection::SkipsStage { .. })));
        assert_eq!(store.load(&id).await.unwrap().stage, Stage::Pending);
    }

    #[tokio::test]
    async fn concurrent_failures_apply_once() {
        let store = Arc::new(FileJobStore::in_memory());
        let job = new_job();
        let id = job.id.clone();
        store.create(job).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_transition(
                        &id,
                        Stage::Pending,
                        Mutation::Fail {
                            kind: FailureKind::TransportError,
                            message: format!("attempt {i}"),
                        },
                    )
                    .await
                    .unwrap()
                    .applied
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = FileJobStore::in_memory();
        let job = new_job();
        store.create(job.clone()).await.unwrap();
        assert!(matches!(
            store.create(job).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = FileJobStore::in_memory();
        assert!(matches!(
            store.load("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn persisted_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            let job = new_job();
            let id = job.id.clone();
            store.create(job).await.unwrap();
            store
                .try_transition(&id, Stage::Pending, Mutation::Enter(Stage::Analyzing))
                .await
                .unwrap();
            id
        };

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let job = reopened.load(&id).await.unwrap();
        assert_eq!(job.stage, Stage::Analyzing);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_picks_up_jobs_from_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileJobStore::open(dir.path()).await.unwrap();
        let client = FileJobStore::open(dir.path()).await.unwrap();
        let job = new_job();
        let id = job.id.clone();
        client.create(job).await.unwrap();

        assert!(server.load(&id).await.is_err());
        assert_eq!(server.refresh().await.unwrap(), 1);
        assert_eq!(server.refresh().await.unwrap(), 0);
        assert_eq!(server.load(&id).await.unwrap().stage, Stage::Pending);
    }
}
