//! Worker runtime - runs inside each spawned worker process.
//!
//! The supervisor side (spawning, inbox, result routing) lives in
//! supervisor.rs. Here the worker:
//! 1. Reads `Init` and reports `Loading`
//! 2. Loads the named workload, reporting `Running` or `LoadFailed`
//! 3. Executes jobs strictly in arrival order until `Stop`
//!
//! Per-job failures (unknown routine, routine error or panic) become that
//! job's outcome and never end the loop.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
use crate::error::JobError;
use crate::job::{JobId, Params};
use crate::results::Outcome;
use crate::workload::{Workload, WorkloadRegistry};

/// Set to `1` in the environment of spawned worker processes.
pub const WORKER_ENV: &str = "DISPATCHLET_WORKER";

/// True when this process was launched by a supervisor as a worker.
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV).as_deref() == Ok("1")
}

/// Run the worker over this process's stdin/stdout.
///
/// Nothing else may write to stdout while this runs.
pub async fn run_worker_stdio(registry: Arc<WorkloadRegistry>) -> io::Result<()> {
    run_worker(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the worker over an arbitrary byte channel.
pub async fn run_worker<R, W>(registry: Arc<WorkloadRegistry>, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, JsonCodec::<WorkerRequest>::new());
    let mut responses = FramedWrite::new(writer, JsonCodec::<WorkerResponse>::new());

    let name = match requests.next().await {
        Some(Ok(WorkerRequest::Init { workload })) => workload,
        Some(Ok(other)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected init as first message, got {other:?}"),
            ));
        }
        Some(Err(e)) => return Err(e),
        None => {
            tracing::info!("Supervisor closed the channel before init");
            return Ok(());
        }
    };

    responses.send(WorkerResponse::Loading).await?;
    tracing::info!(workload = %name, "Loading workload");

    let workload = match load(&registry, &name).await {
        Ok(workload) => Arc::new(workload),
        Err(error) => {
            tracing::error!(workload = %name, %error, "Workload failed to load");
            responses.send(WorkerResponse::LoadFailed { error }).await?;
            return Ok(());
        }
    };

    if let Some(kib) = peak_rss_kib() {
        tracing::debug!(workload = %name, peak_rss_kib = kib, "Workload loaded");
    }
    let routines = workload
        .routine_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    responses.send(WorkerResponse::Running { routines }).await?;

    loop {
        match requests.next().await {
            Some(Ok(WorkerRequest::Job {
                id,
                routine,
                params,
            })) => {
                let outcome = execute(&workload, id, routine, params).await;
                responses.send(WorkerResponse::Outcome { id, outcome }).await?;
            }
            Some(Ok(WorkerRequest::Stop)) => {
                tracing::info!(workload = %name, "Stop requested");
                responses.send(WorkerResponse::Stopped).await?;
                break;
            }
            Some(Ok(WorkerRequest::Init { .. })) => {
                tracing::warn!(workload = %name, "Received init after startup, ignoring");
            }
            Some(Err(e)) => {
                tracing::error!(workload = %name, error = %e, "Inbox read error");
                return Err(e);
            }
            None => {
                tracing::warn!(workload = %name, "Inbox closed (supervisor gone?), exiting");
                break;
            }
        }
    }

    tracing::info!(workload = %name, "Worker exiting");
    Ok(())
}

async fn load(registry: &Arc<WorkloadRegistry>, name: &str) -> Result<Workload, String> {
    let registry = Arc::clone(registry);
    let owned = name.to_string();
    match tokio::task::spawn_blocking(move || registry.load(&owned)).await {
        Ok(Ok(workload)) => Ok(workload),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("loader panicked: {}", panic_message(e))),
    }
}

async fn execute(workload: &Arc<Workload>, id: JobId, routine: String, params: Params) -> Outcome {
    let Some(function) = workload.routine(&routine) else {
        tracing::warn!(workload = workload.name(), job_id = %id, %routine, "Routine not found");
        return Outcome::Failed {
            error: JobError::RoutineNotFound {
                workload: workload.name().to_string(),
                routine,
            },
        };
    };

    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || function(params)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(value)) => {
            tracing::debug!(job_id = %id, %routine, elapsed_ms, "Job succeeded");
            Outcome::Succeeded { value }
        }
        Ok(Err(e)) => {
            tracing::debug!(job_id = %id, %routine, elapsed_ms, error = %e, "Job failed");
            Outcome::Failed {
                error: JobError::Execution {
                    routine,
                    message: format!("{e:#}"),
                },
            }
        }
        Err(e) => {
            let message = format!("routine panicked: {}", panic_message(e));
            tracing::error!(job_id = %id, %routine, %message, "Job panicked");
            Outcome::Failed {
                error: JobError::Execution { routine, message },
            }
        }
    }
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Peak resident set size of this process in KiB.
#[cfg(unix)]
fn peak_rss_kib() -> Option<i64> {
    use nix::sys::resource::{UsageWho, getrusage};

    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let max_rss = usage.max_rss() as i64;

    // macOS reports bytes, Linux kilobytes
    #[cfg(target_os = "macos")]
    {
        Some(max_rss / 1024)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Some(max_rss)
    }
}

#[cfg(not(unix))]
fn peak_rss_kib() -> Option<i64> {
    None
}
