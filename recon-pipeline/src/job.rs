//! Job bookkeeping, kept apart from pipeline logic.
//!
//! The registry owns every [`Job`] record. Runs never touch it directly:
//! [`JobRegistry::drive`] folds a run's events into the record.

use crate::config::PipelineConfig;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub progress: u8,
    pub stage_description: String,
    pub error_message: Option<String>,
    pub output_artifact: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id}: cannot go from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id}: progress cannot go back from {from}% to {to}%")]
    ProgressRegression { id: Uuid, from: u8, to: u8 },
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        f(job)?;
        Ok(job.clone())
    }

    fn transition(job: &mut Job, to: JobStatus) -> Result<(), JobError> {
        let allowed = matches!(
            (job.status, to),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        );
        if !allowed {
            return Err(JobError::InvalidTransition {
                id: job.id,
                from: job.status,
                to,
            });
        }
        debug!("Job {}: {} -> {}", job.id, job.status, to);
        job.status = to;
        Ok(())
    }

    /// Register a queued job whose output lives in its own directory under `output_root`.
    pub fn create(&self, input_dir: impl Into<PathBuf>, output_root: &Path) -> Job {
        let id = Uuid::new_v4();
        let job = Job {
            id,
            input_dir: input_dir.into(),
            output_dir: output_root.join(id.to_string()),
            status: JobStatus::Queued,
            progress: 0,
            stage_description: "Queued".to_string(),
            error_message: None,
            output_artifact: None,
        };
        self.lock().insert(id, job.clone());
        info!("Job {} created", id);
        job
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    pub fn start(&self, id: Uuid) -> Result<Job, JobError> {
        self.update(id, |job| Self::transition(job, JobStatus::Processing))
    }

    pub fn apply_progress(&self, id: Uuid, event: &ProgressEvent) -> Result<Job, JobError> {
        self.update(id, |job| {
            if job.status != JobStatus::Processing {
                return Err(JobError::InvalidTransition {
                    id,
                    from: job.status,
                    to: JobStatus::Processing,
                });
            }
            if event.percentage < job.progress {
                return Err(JobError::ProgressRegression {
                    id,
                    from: job.progress,
                    to: event.percentage,
                });
            }
            job.progress = event.percentage;
            job.stage_description = event.message.clone();
            Ok(())
        })
    }

    pub fn complete(&self, id: Uuid, artifact: PathBuf) -> Result<Job, JobError> {
        self.update(id, |job| {
            Self::transition(job, JobStatus::Completed)?;
            job.progress = 100;
            job.output_artifact = Some(artifact);
            Ok(())
        })
    }

    pub fn fail(&self, id: Uuid, message: impl Into<String>) -> Result<Job, JobError> {
        self.update(id, |job| {
            Self::transition(job, JobStatus::Failed)?;
            job.error_message = Some(message.into());
            Ok(())
        })
    }

    /// An orchestrator bound to `job`'s directories.
    pub fn orchestrator(&self, job: &Job, config: PipelineConfig) -> Orchestrator {
        Orchestrator::new(
            job.id.to_string(),
            job.input_dir.clone(),
            job.output_dir.clone(),
            config,
        )
    }

    /// Run `orchestrator` for job `id` and record its progress and outcome.
    ///
    /// An event the record rejects stops the run and fails the job.
    pub async fn drive(&self, id: Uuid, orchestrator: Orchestrator) -> Result<Job, JobError> {
        self.start(id)?;
        let mut handle = orchestrator.run();
        while let Some(event) = handle.next_event().await {
            if let Err(e) = self.apply_progress(id, &event) {
                drop(handle);
                if let Err(fail) = self.fail(id, e.to_string()) {
                    warn!("Job {} could not be marked failed: {}", id, fail);
                }
                return Err(e);
            }
        }
        match handle.finish().await {
            Ok(outcome) => self.complete(id, outcome.scene),
            Err(e) => self.fail(id, e.to_string()),
        }
    }
}
