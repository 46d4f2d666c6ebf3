//! Wire protocol between supervisor and worker process.
//!
//! One duplex channel per worker (stdin/stdout for OS processes):
//! - **requests** (supervisor → worker): Init, then Job envelopes, then Stop
//! - **responses** (worker → supervisor): lifecycle transitions and job outcomes

use serde::{Deserialize, Serialize};

use crate::job::{JobEnvelope, JobId, Params};
use crate::results::Outcome;

/// Messages from supervisor to worker, in inbox order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Always the first frame: which workload this process hosts.
    Init { workload: String },

    Job {
        id: JobId,
        routine: String,
        params: Params,
    },

    /// Sentinel: the worker acknowledges with `Stopped` and exits.
    Stop,
}

impl From<JobEnvelope> for WorkerRequest {
    fn from(envelope: JobEnvelope) -> Self {
        let (id, routine, params) = envelope.into_parts();
        Self::Job {
            id,
            routine,
            params,
        }
    }
}

/// Messages from worker to supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Loading,

    /// Load finished; lists the routines the workload exposes.
    Running { routines: Vec<String> },

    /// The worker exits right after sending this.
    LoadFailed { error: String },

    Outcome { id: JobId, outcome: Outcome },

    Stopped,
}
