//! Worker spawn strategies.
//!
//! - [`CommandSpawner`]: one OS process per workload (the host binary re-executed
//!   in worker mode by default)
//! - [`InProcessSpawner`]: a runtime task on an in-memory pipe; same protocol,
//!   no process isolation

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::SpawnError;
use crate::worker::{WORKER_ENV, run_worker};
use crate::workload::WorkloadRegistry;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Set on spawned processes so `ps` and logs show which workload they host.
pub const WORKLOAD_ENV: &str = "DISPATCHLET_WORKLOAD";

const PIPE_CAPACITY: usize = 64 * 1024;

/// Channel ends of a freshly spawned worker.
pub struct WorkerProcess {
    /// Request stream into the worker.
    pub stdin: BoxedWriter,
    /// Response stream out of the worker.
    pub stdout: BoxedReader,
    /// OS process handle, absent for in-process workers.
    pub child: Option<Child>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

/// Extension point for different worker spawn strategies.
///
/// Called with the supervisor's lifecycle lock held; must not block for long.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, workload: &str) -> Result<WorkerProcess, SpawnError>;
}

/// Spawns a worker as a child process talking over stdin/stdout.
///
/// Without an explicit program the current executable is re-executed; its
/// `main` must hand over to [`run_worker_stdio`](crate::worker::run_worker_stdio)
/// when [`is_worker_process`](crate::worker::is_worker_process) is true.
#[derive(Debug, Clone, Default)]
pub struct CommandSpawner {
    program: Option<PathBuf>,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn program(&self) -> Result<PathBuf, SpawnError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| {
                SpawnError::Other(format!("failed to resolve current executable: {e}"))
            }),
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, workload: &str) -> Result<WorkerProcess, SpawnError> {
        let program = self.program()?;
        tracing::debug!(workload, program = %program.display(), "Spawning worker process");

        let mut child = Command::new(&program)
            .args(&self.args)
            .envs(self.envs.iter().cloned())
            .env(WORKER_ENV, "1")
            .env(WORKLOAD_ENV, workload)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }
}

/// Runs the worker runtime as a task in the current Tokio runtime.
#[derive(Clone)]
pub struct InProcessSpawner {
    registry: Arc<WorkloadRegistry>,
}

impl InProcessSpawner {
    pub fn new(registry: Arc<WorkloadRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, workload: &str) -> Result<WorkerProcess, SpawnError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| SpawnError::Other(e.to_string()))?;

        let (supervisor_end, worker_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_rd, worker_wr) = tokio::io::split(worker_end);
        let registry = Arc::clone(&self.registry);
        let name = workload.to_string();
        runtime.spawn(async move {
            if let Err(e) = run_worker(registry, worker_rd, worker_wr).await {
                tracing::error!(workload = %name, error = %e, "In-process worker failed");
            }
        });

        let (rd, wr) = tokio::io::split(supervisor_end);
        Ok(WorkerProcess {
            stdin: Box::new(wr),
            stdout: Box::new(rd),
            child: None,
        })
    }
}
