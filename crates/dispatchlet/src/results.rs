//! Job outcomes and the store they wait in until retrieved.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::JobError;
use crate::job::JobId;

/// Result of executing one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { value: serde_json::Value },
    Failed { error: JobError },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn into_result(self) -> Result<serde_json::Value, JobError> {
        match self {
            Self::Succeeded { value } => Ok(value),
            Self::Failed { error } => Err(error),
        }
    }
}

impl From<Result<serde_json::Value, JobError>> for Outcome {
    fn from(result: Result<serde_json::Value, JobError>) -> Self {
        match result {
            Ok(value) => Self::Succeeded { value },
            Err(error) => Self::Failed { error },
        }
    }
}

/// Outcomes keyed by job id, each written once and taken once.
#[derive(Default)]
pub struct ResultStore {
    outcomes: DashMap<JobId, Outcome>,
    written: Arc<Notify>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an outcome. A second write for the same id is refused and
    /// returns `false`; the first outcome is kept.
    pub fn insert(&self, id: JobId, outcome: Outcome) -> bool {
        let inserted = match self.outcomes.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(outcome);
                true
            }
        };
        if inserted {
            self.written.notify_waiters();
        } else {
            tracing::warn!(job_id = %id, "Duplicate outcome ignored");
        }
        inserted
    }

    /// Remove and return an outcome.
    pub fn take(&self, id: &JobId) -> Option<Outcome> {
        self.outcomes.remove(id).map(|(_, o)| o)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Handle for waiting on the next write; arm before checking.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.written)
    }
}
