//! Process supervisor - owns one worker process per workload.
//!
//! Flow for a workload:
//! 1. `start` (under the lifecycle lock): begin a lifecycle, spawn the worker,
//!    register its inbox
//! 2. Writer task drains the inbox onto the worker's stdin in FIFO order
//! 3. Event loop applies worker responses to the state and result stores
//! 4. On worker exit: settle the final state, fail jobs still queued,
//!    deregister, then start a successor if work was deferred behind the exit
//!
//! At most one worker process exists per workload. Jobs submitted while a
//! worker is stopping wait in the backlog until that worker has exited.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use tokio::process::Child;
use tokio::sync::futures::Notified;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
use crate::error::{JobError, SupervisorError, WorkloadError};
use crate::job::{JobEnvelope, JobId, Params};
use crate::results::{Outcome, ResultStore};
use crate::spawner::{BoxedReader, BoxedWriter, CommandSpawner, WorkerProcess, WorkerSpawner};
use crate::state::{StateStore, WorkloadState, WorkloadStatus};

pub struct SupervisorConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Bound on `await_state`/`await_result`. `None` waits indefinitely.
    pub await_timeout: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self {
            spawner: Arc::new(CommandSpawner::default()),
            await_timeout: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = Some(timeout);
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_or_recover<'a, T>(mutex: &'a StdMutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(what, "Mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

struct Lifecycle {
    jobs: HashSet<JobId>,
    accepting: bool,
}

/// Jobs queued on one lifecycle and not yet answered.
///
/// Sealed when the stop sentinel is queued, closed when the worker exits.
/// Enqueueing is refused once sealed, so nothing lands behind the sentinel,
/// and every accepted job is either answered or failed at exit.
struct PendingJobs {
    inner: StdMutex<Option<Lifecycle>>,
}

impl PendingJobs {
    fn new() -> Self {
        Self {
            inner: StdMutex::new(Some(Lifecycle {
                jobs: HashSet::new(),
                accepting: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Lifecycle>> {
        lock_or_recover(&self.inner, "pending jobs")
    }

    /// Record `id` and push `request` onto the inbox. Hands the request back
    /// if the lifecycle is sealed or over.
    fn enqueue(
        &self,
        id: JobId,
        request: WorkerRequest,
        inbox: &mpsc::UnboundedSender<WorkerRequest>,
    ) -> Result<(), WorkerRequest> {
        let mut guard = self.lock();
        let Some(lifecycle) = guard.as_mut().filter(|l| l.accepting) else {
            return Err(request);
        };
        lifecycle.jobs.insert(id);
        if inbox.send(request).is_err() {
            // Failed when the event loop observes the exit.
            tracing::debug!(job_id = %id, "Inbox writer closed, job left pending");
        }
        Ok(())
    }

    /// Queue the stop sentinel unless already sealed.
    fn seal(&self, inbox: &mpsc::UnboundedSender<WorkerRequest>) -> bool {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(lifecycle) if lifecycle.accepting => {
                lifecycle.accepting = false;
                let _ = inbox.send(WorkerRequest::Stop);
                true
            }
            _ => false,
        }
    }

    fn complete(&self, id: &JobId) {
        if let Some(lifecycle) = self.lock().as_mut() {
            lifecycle.jobs.remove(id);
        }
    }

    fn is_accepting(&self) -> bool {
        self.lock().as_ref().is_some_and(|l| l.accepting)
    }

    fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, |l| l.jobs.len())
    }

    fn close(&self) -> Vec<JobId> {
        self.lock()
            .take()
            .map(|l| l.jobs.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Registry entry for a live worker.
#[derive(Clone)]
struct WorkloadHandle {
    generation: u64,
    inbox: mpsc::UnboundedSender<WorkerRequest>,
    pending: Arc<PendingJobs>,
    pid: Option<u32>,
}

/// Work held back until a stopping worker has exited.
#[derive(Default)]
struct Deferred {
    restart: bool,
    jobs: Vec<(JobId, WorkerRequest)>,
}

impl Deferred {
    fn is_empty(&self) -> bool {
        !self.restart && self.jobs.is_empty()
    }
}

type Backlog = HashMap<String, Deferred>;

struct Shared {
    workloads: DashMap<String, WorkloadHandle>,
    states: StateStore,
    results: ResultStore,
    /// Submitted jobs whose outcome has not been stored yet.
    in_flight: DashSet<JobId>,
    /// Routine names reported by each running worker.
    routines: DashMap<String, Vec<String>>,
    spawner: Arc<dyn WorkerSpawner>,
    /// Lifecycle lock. Held to begin or end a lifecycle and to defer work.
    backlog: StdMutex<Backlog>,
}

impl Shared {
    fn lock_backlog(&self) -> MutexGuard<'_, Backlog> {
        lock_or_recover(&self.backlog, "lifecycle")
    }

    fn retire(&self, workload: &str, generation: u64) {
        self.workloads
            .remove_if(workload, |_, h| h.generation == generation);
        self.routines.remove(workload);
    }

    /// Store an outcome, then drop the job from the in-flight set.
    fn finish(&self, id: JobId, outcome: Outcome) {
        self.results.insert(id, outcome);
        self.in_flight.remove(&id);
    }

    /// Begin a lifecycle and spawn its worker. Caller holds the lifecycle lock
    /// and has checked that no worker is registered for `workload`.
    fn launch(self: &Arc<Self>, workload: &str) -> Result<WorkloadHandle, WorkloadError> {
        let generation = self.states.begin(workload).map_err(|current| {
            tracing::error!(workload, %current, "Lifecycle still in progress without a worker");
            WorkloadError::start_failed(workload, format!("previous lifecycle is still {current}"))
        })?;

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => return Err(self.fail_start(workload, format!("no Tokio runtime: {e}"))),
        };
        let process = match self.spawner.spawn(workload) {
            Ok(process) => process,
            Err(e) => return Err(self.fail_start(workload, e.to_string())),
        };

        let pid = process.pid();
        let WorkerProcess {
            stdin,
            stdout,
            child,
        } = process;

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let _ = inbox.send(WorkerRequest::Init {
            workload: workload.to_string(),
        });
        let pending = Arc::new(PendingJobs::new());
        let handle = WorkloadHandle {
            generation,
            inbox,
            pending: Arc::clone(&pending),
            pid,
        };
        self.workloads.insert(workload.to_string(), handle.clone());

        runtime.spawn(write_inbox(workload.to_string(), inbox_rx, stdin));
        runtime.spawn(run_event_loop(
            Arc::clone(self),
            workload.to_string(),
            generation,
            stdout,
            child,
            pending,
        ));

        tracing::info!(workload, generation, pid, "Worker started");
        Ok(handle)
    }

    fn fail_start(&self, workload: &str, message: String) -> WorkloadError {
        tracing::error!(workload, %message, "Worker failed to start");
        let error = WorkloadError::start_failed(workload, message);
        let _ = self
            .states
            .advance(workload, WorkloadStatus::failed(error.clone()));
        error
    }

    /// Settle lifecycle `generation` after its worker exited and start its
    /// successor if work was deferred. Returns the jobs to fail.
    fn settle_exit(
        self: &Arc<Self>,
        workload: &str,
        generation: u64,
        pending: &PendingJobs,
    ) -> Vec<(JobId, JobError)> {
        let mut backlog = self.lock_backlog();

        let status = self.states.get(workload);
        let exit_error = match status.state {
            WorkloadState::Starting | WorkloadState::Loading => {
                let error =
                    WorkloadError::load_failed(workload, "worker exited before loading completed");
                tracing::error!(workload, %error, "Worker exited during load");
                let _ = self
                    .states
                    .advance(workload, WorkloadStatus::failed(error.clone()));
                Some(error)
            }
            WorkloadState::Running => {
                tracing::warn!(workload, generation, "Worker exited unexpectedly");
                let _ = self
                    .states
                    .advance(workload, WorkloadStatus::new(WorkloadState::Stopped));
                None
            }
            WorkloadState::StartFailed | WorkloadState::LoadFailed => status.error,
            WorkloadState::NotStarted | WorkloadState::Stopped => None,
        };
        let error = match exit_error {
            Some(error) => JobError::Workload { error },
            None => JobError::WorkerExited {
                workload: workload.to_string(),
            },
        };

        let mut failed: Vec<(JobId, JobError)> = pending
            .close()
            .into_iter()
            .map(|id| (id, error.clone()))
            .collect();
        self.retire(workload, generation);

        if let Some(deferred) = backlog.remove(workload)
            && !deferred.is_empty()
        {
            failed.extend(self.replay(workload, deferred));
        }
        failed
    }

    /// Start a fresh lifecycle for work deferred behind a stop.
    fn replay(self: &Arc<Self>, workload: &str, deferred: Deferred) -> Vec<(JobId, JobError)> {
        tracing::info!(workload, jobs = deferred.jobs.len(), "Starting successor worker");
        match self.launch(workload) {
            Ok(handle) => deferred
                .jobs
                .into_iter()
                .filter_map(|(id, request)| {
                    handle.pending.enqueue(id, request, &handle.inbox).err().map(|_| {
                        let error = JobError::WorkerExited {
                            workload: workload.to_string(),
                        };
                        (id, error)
                    })
                })
                .collect(),
            Err(error) => deferred
                .jobs
                .into_iter()
                .map(|(id, _)| {
                    let error = JobError::Workload {
                        error: error.clone(),
                    };
                    (id, error)
                })
                .collect(),
        }
    }
}

/// Starts workers on demand and routes jobs to them.
///
/// `start` and `submit` must be called from within a Tokio runtime.
/// Dropping the supervisor stops every worker.
pub struct Supervisor {
    shared: Arc<Shared>,
    await_timeout: Option<Duration>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                workloads: DashMap::new(),
                states: StateStore::new(),
                results: ResultStore::new(),
                in_flight: DashSet::new(),
                routines: DashMap::new(),
                spawner: config.spawner,
                backlog: StdMutex::new(Backlog::new()),
            }),
            await_timeout: config.await_timeout,
        }
    }

    /// Start a worker for `workload` unless one is already live.
    ///
    /// If the current worker is stopping, a fresh one is started once it exits.
    pub fn start(&self, workload: &str) -> Result<(), SupervisorError> {
        let mut backlog = self.shared.lock_backlog();
        if let Some(handle) = self.shared.workloads.get(workload) {
            if handle.pending.is_accepting() {
                tracing::warn!(workload, generation = handle.generation, "Worker already running");
            } else {
                tracing::info!(workload, generation = handle.generation, "Worker stopping, restart queued");
                backlog.entry(workload.to_string()).or_default().restart = true;
            }
            return Ok(());
        }
        self.shared.launch(workload)?;
        Ok(())
    }

    /// Queue `routine(params)` on `workload`, starting its worker if needed.
    ///
    /// Returns as soon as the job is enqueued. A job submitted while the
    /// worker is stopping runs on its successor.
    pub fn submit(
        &self,
        workload: &str,
        routine: impl Into<String>,
        params: Params,
    ) -> Result<JobId, SupervisorError> {
        let envelope = JobEnvelope::new(routine, params);
        let id = envelope.id();
        let routine = envelope.routine().to_string();
        self.shared.in_flight.insert(id);
        let request = WorkerRequest::from(envelope);

        let request = match self.shared.workloads.get(workload).map(|h| h.clone()) {
            Some(handle) => match handle.pending.enqueue(id, request, &handle.inbox) {
                Ok(()) => {
                    tracing::debug!(workload, job_id = %id, %routine, "Job submitted");
                    return Ok(id);
                }
                Err(request) => request,
            },
            None => request,
        };

        let mut backlog = self.shared.lock_backlog();
        if let Some(handle) = self.shared.workloads.get(workload).map(|h| h.clone()) {
            // Registered workers only leave the registry under this lock.
            match handle.pending.enqueue(id, request, &handle.inbox) {
                Ok(()) => tracing::debug!(workload, job_id = %id, %routine, "Job submitted"),
                Err(request) => {
                    tracing::debug!(workload, job_id = %id, %routine, "Worker stopping, job deferred");
                    backlog
                        .entry(workload.to_string())
                        .or_default()
                        .jobs
                        .push((id, request));
                }
            }
            return Ok(id);
        }

        let handle = match self.shared.launch(workload) {
            Ok(handle) => handle,
            Err(error) => {
                self.shared.in_flight.remove(&id);
                return Err(error.into());
            }
        };
        if handle.pending.enqueue(id, request, &handle.inbox).is_err() {
            let error = JobError::WorkerExited {
                workload: workload.to_string(),
            };
            tracing::warn!(workload, job_id = %id, %error, "Worker exited before the job could be queued");
            self.shared.finish(id, Outcome::Failed { error });
        } else {
            tracing::debug!(workload, job_id = %id, %routine, "Job submitted");
        }
        Ok(id)
    }

    /// Wait until `workload` reaches `target`.
    ///
    /// Fails with the captured error if the workload fails to start or load,
    /// and with [`SupervisorError::Stopped`] if it stops short of `target`.
    /// The first lifecycle observed is the one waited on; if it ends and a
    /// successor begins, its final status decides the outcome.
    pub async fn await_state(
        &self,
        workload: &str,
        target: WorkloadState,
    ) -> Result<(), SupervisorError> {
        let deadline = self.deadline();
        let notify = self.shared.states.notifier();
        let mut watched = None;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (lifecycle, current) = self.shared.states.observe(workload);
            let status = match watched {
                Some(watched) if watched != lifecycle => self
                    .shared
                    .states
                    .ended(workload, watched)
                    .unwrap_or_else(|| WorkloadStatus::new(WorkloadState::Stopped)),
                _ => {
                    if current.state != WorkloadState::NotStarted {
                        watched = Some(lifecycle);
                    }
                    current
                }
            };

            if status.state == target {
                return Ok(());
            }
            if status.state.is_failed() {
                let error = status.error.unwrap_or_else(|| {
                    WorkloadError::load_failed(workload, format!("workload {}", status.state))
                });
                tracing::error!(workload, %error, "Workload failed");
                return Err(error.into());
            }
            if status.state.is_terminal() {
                return Err(SupervisorError::Stopped(workload.to_string()));
            }

            wait(notified.as_mut(), deadline).await?;
        }
    }

    /// Wait for the outcome of job `id`, removing it from the store.
    ///
    /// Each outcome is delivered once; a second call for the same id fails
    /// with [`SupervisorError::JobNotFound`].
    pub async fn await_result(
        &self,
        workload: &str,
        id: JobId,
    ) -> Result<serde_json::Value, SupervisorError> {
        let deadline = self.deadline();
        let notify = self.shared.results.notifier();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.shared.results.take(&id) {
                return deliver(workload, id, outcome);
            }
            if !self.shared.in_flight.contains(&id) {
                // The outcome may have landed between the take and the check.
                if let Some(outcome) = self.shared.results.take(&id) {
                    return deliver(workload, id, outcome);
                }
                return Err(SupervisorError::JobNotFound(id));
            }

            wait(notified.as_mut(), deadline).await?;
        }
    }

    /// Ask the worker for `workload` to exit after the jobs queued so far.
    pub fn stop(&self, workload: &str) -> Result<(), SupervisorError> {
        let handle = self
            .shared
            .workloads
            .get(workload)
            .map(|h| h.clone())
            .ok_or_else(|| SupervisorError::NotFound(workload.to_string()))?;
        if handle.pending.seal(&handle.inbox) {
            tracing::info!(workload, generation = handle.generation, "Stopping worker");
        } else {
            tracing::debug!(workload, generation = handle.generation, "Worker already stopping");
        }
        Ok(())
    }

    /// Queue the stop sentinel on every registered worker. Does not wait.
    pub fn shutdown(&self) {
        for entry in self.shared.workloads.iter() {
            if entry.pending.seal(&entry.inbox) {
                tracing::debug!(workload = %entry.key(), "Sent stop");
            }
        }
    }

    pub fn status(&self, workload: &str) -> WorkloadStatus {
        self.shared.states.get(workload)
    }

    /// Routines exposed by the running worker for `workload`.
    pub fn routines(&self, workload: &str) -> Option<Vec<String>> {
        self.shared.routines.get(workload).map(|r| r.clone())
    }

    /// Names of workloads with a registered worker, sorted.
    pub fn live_workloads(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .workloads
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// OS process id of the worker hosting `workload`, if it is a child process.
    pub fn worker_pid(&self, workload: &str) -> Option<u32> {
        self.shared.workloads.get(workload).and_then(|h| h.pid)
    }

    /// Jobs submitted to `workload` and not yet answered, including those
    /// deferred behind a stopping worker.
    pub fn pending_jobs(&self, workload: &str) -> usize {
        let deferred = self
            .shared
            .lock_backlog()
            .get(workload)
            .map_or(0, |d| d.jobs.len());
        let queued = self
            .shared
            .workloads
            .get(workload)
            .map_or(0, |h| h.pending.len());
        deferred + queued
    }

    /// Outcomes stored and not yet retrieved.
    pub fn stored_results(&self) -> usize {
        self.shared.results.len()
    }

    fn deadline(&self) -> Option<Instant> {
        self.await_timeout.map(|t| Instant::now() + t)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let dropped: usize = self
            .shared
            .lock_backlog()
            .drain()
            .map(|(_, deferred)| deferred.jobs.len())
            .sum();
        if dropped > 0 {
            tracing::warn!(jobs = dropped, "Dropping deferred jobs");
        }
        self.shutdown();
    }
}

fn deliver(
    workload: &str,
    id: JobId,
    outcome: Outcome,
) -> Result<serde_json::Value, SupervisorError> {
    outcome.into_result().map_err(|error| {
        tracing::error!(workload, job_id = %id, %error, "Job failed");
        SupervisorError::from(error)
    })
}

async fn wait(
    notified: Pin<&mut Notified<'_>>,
    deadline: Option<Instant>,
) -> Result<(), SupervisorError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, notified)
            .await
            .map_err(|_| SupervisorError::Timeout),
        None => {
            notified.await;
            Ok(())
        }
    }
}

async fn write_inbox(
    workload: String,
    mut inbox: mpsc::UnboundedReceiver<WorkerRequest>,
    stdin: BoxedWriter,
) {
    let mut writer = FramedWrite::new(stdin, JsonCodec::<WorkerRequest>::new());
    while let Some(request) = inbox.recv().await {
        let stop = matches!(request, WorkerRequest::Stop);
        if let Err(e) = writer.send(request).await {
            tracing::warn!(%workload, error = %e, "Failed to write to worker");
            break;
        }
        if stop {
            break;
        }
    }
    tracing::trace!(%workload, "Inbox writer exiting");
}

async fn run_event_loop(
    shared: Arc<Shared>,
    workload: String,
    generation: u64,
    stdout: BoxedReader,
    child: Option<Child>,
    pending: Arc<PendingJobs>,
) {
    let mut responses = FramedRead::new(stdout, JsonCodec::<WorkerResponse>::new());
    let advance = |status: WorkloadStatus| {
        let _ = shared.states.advance(&workload, status);
    };

    loop {
        match responses.next().await {
            Some(Ok(WorkerResponse::Loading)) => {
                tracing::debug!(%workload, "Worker loading");
                advance(WorkloadStatus::new(WorkloadState::Loading));
            }
            Some(Ok(WorkerResponse::Running { routines })) => {
                tracing::info!(%workload, generation, routines = routines.len(), "Workload running");
                shared.routines.insert(workload.clone(), routines);
                advance(WorkloadStatus::new(WorkloadState::Running));
            }
            Some(Ok(WorkerResponse::LoadFailed { error })) => {
                tracing::error!(%workload, %error, "Workload failed to load");
                advance(WorkloadStatus::failed(WorkloadError::load_failed(
                    &workload, error,
                )));
            }
            Some(Ok(WorkerResponse::Outcome { id, outcome })) => {
                tracing::debug!(%workload, job_id = %id, success = outcome.is_success(), "Job finished");
                pending.complete(&id);
                shared.finish(id, outcome);
            }
            Some(Ok(WorkerResponse::Stopped)) => {
                tracing::info!(%workload, generation, "Worker stopped");
                advance(WorkloadStatus::new(WorkloadState::Stopped));
            }
            Some(Err(e)) => {
                tracing::error!(%workload, error = %e, "Worker channel error");
                break;
            }
            None => break,
        }
    }

    let failed = shared.settle_exit(&workload, generation, &pending);
    if !failed.is_empty() {
        tracing::warn!(%workload, count = failed.len(), "Failing queued jobs");
        for (id, error) in failed {
            shared.finish(id, Outcome::Failed { error });
        }
    }

    if let Some(mut child) = child {
        match child.wait().await {
            Ok(status) => tracing::debug!(%workload, %status, "Worker process exited"),
            Err(e) => tracing::warn!(%workload, error = %e, "Failed to reap worker process"),
        }
    }
    tracing::debug!(%workload, generation, "Event loop exiting");
}
