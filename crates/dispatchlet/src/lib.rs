//! dispatchlet: process supervisor and job dispatch for isolated workloads.
//!
//! Each workload runs in its own worker process. The [`Supervisor`] starts
//! workers on demand, feeds them jobs in FIFO order, and collects outcomes.
//! A host binary registers its workloads in a [`WorkloadRegistry`] and calls
//! [`run_worker_stdio`] when [`is_worker_process`] reports it was launched as
//! a worker.

pub mod bridge;
pub mod error;
pub mod job;
pub mod results;
pub mod spawner;
pub mod state;
pub mod supervisor;
pub mod worker;
pub mod workload;

pub use error::{JobError, LoadError, SpawnError, SupervisorError, WorkloadError};
pub use job::{JobEnvelope, JobId, Params, optional, required};
pub use results::{Outcome, ResultStore};
pub use spawner::{CommandSpawner, InProcessSpawner, WorkerProcess, WorkerSpawner};
pub use state::{StateStore, WorkloadState, WorkloadStatus};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::{WORKER_ENV, is_worker_process, run_worker, run_worker_stdio};
pub use workload::{RegistryError, RoutineFn, Workload, WorkloadRegistry};
