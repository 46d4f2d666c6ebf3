//! Error taxonomy for the supervisor and its workers.

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Failure that takes down a whole workload lifecycle.
///
/// Captured on the workload's state and raised to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadError {
    #[error("workload {workload} failed to start: {message}")]
    StartFailed { workload: String, message: String },

    #[error("workload {workload} failed to load: {message}")]
    LoadFailed { workload: String, message: String },
}

impl WorkloadError {
    pub fn start_failed(workload: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StartFailed {
            workload: workload.into(),
            message: message.into(),
        }
    }

    pub fn load_failed(workload: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadFailed {
            workload: workload.into(),
            message: message.into(),
        }
    }
}

/// Failure recorded as a single job's outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    #[error("routine {routine} not found in workload {workload}")]
    RoutineNotFound { workload: String, routine: String },

    #[error("routine {routine} failed: {message}")]
    Execution { routine: String, message: String },

    /// The lifecycle the job was queued on failed before running it.
    #[error("{error}")]
    Workload { error: WorkloadError },

    /// The worker exited (stop or crash) with the job still queued.
    #[error("worker for workload {workload} exited before the job completed")]
    WorkerExited { workload: String },
}

/// Failure resolving a workload inside the worker process.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Errors surfaced to supervisor callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error(transparent)]
    Job(JobError),

    #[error("workload {0} not found")]
    NotFound(String),

    #[error("job {0} is not pending and has no stored outcome")]
    JobNotFound(JobId),

    #[error("workload {0} is stopped")]
    Stopped(String),

    #[error("timed out waiting on workload")]
    Timeout,
}

impl From<JobError> for SupervisorError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::Workload { error } => Self::Workload(error),
            other => Self::Job(other),
        }
    }
}
