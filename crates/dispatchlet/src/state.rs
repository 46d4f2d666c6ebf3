//! Per-workload lifecycle state.
//!
//! Transitions within one lifecycle are monotonic:
//! `NotStarted → Starting → {StartFailed | Loading} → {LoadFailed | Running} → Stopped`.
//! A worker that dies before finishing its load goes `Starting → LoadFailed`.
//! A new lifecycle may only begin once the previous one is terminal.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::WorkloadError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    #[default]
    NotStarted,
    /// Spawning the worker process.
    Starting,
    /// Worker is up and resolving the workload.
    Loading,
    Running,
    StartFailed,
    LoadFailed,
    Stopped,
}

impl WorkloadState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::StartFailed | Self::LoadFailed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StartFailed | Self::LoadFailed | Self::Stopped)
    }

    pub fn can_transition_to(&self, next: WorkloadState) -> bool {
        use WorkloadState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, StartFailed | Loading | LoadFailed)
                | (Loading, LoadFailed | Running)
                | (Running, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::StartFailed => "start_failed",
            Self::LoadFailed => "load_failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus the captured error when the state is `*Failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub state: WorkloadState,
    pub error: Option<WorkloadError>,
}

impl WorkloadStatus {
    pub fn new(state: WorkloadState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(error: WorkloadError) -> Self {
        let state = match error {
            WorkloadError::StartFailed { .. } => WorkloadState::StartFailed,
            WorkloadError::LoadFailed { .. } => WorkloadState::LoadFailed,
        };
        Self {
            state,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tracked {
    status: WorkloadStatus,
    /// Incremented by every `begin`. Zero until the first lifecycle.
    lifecycle: u64,
    /// Final status of lifecycle `lifecycle - 1`.
    ended: Option<WorkloadStatus>,
}

/// Concurrent workload-state map. Every write wakes all waiters.
#[derive(Default)]
pub struct StateStore {
    states: DashMap<String, Tracked>,
    changed: Arc<Notify>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing workloads read as `NotStarted`.
    pub fn get(&self, workload: &str) -> WorkloadStatus {
        self.observe(workload).1
    }

    /// Current lifecycle number together with its status.
    pub fn observe(&self, workload: &str) -> (u64, WorkloadStatus) {
        self.states
            .get(workload)
            .map(|t| (t.lifecycle, t.status.clone()))
            .unwrap_or_default()
    }

    /// Final status of `lifecycle`, if it is the most recently ended one.
    pub fn ended(&self, workload: &str, lifecycle: u64) -> Option<WorkloadStatus> {
        self.states
            .get(workload)
            .filter(|t| t.lifecycle == lifecycle + 1)
            .and_then(|t| t.ended.clone())
    }

    /// Begin a new lifecycle in `Starting` and return its number.
    ///
    /// Fails with the current state when a lifecycle is still in progress.
    pub fn begin(&self, workload: &str) -> Result<u64, WorkloadState> {
        let lifecycle = match self.states.entry(workload.to_string()) {
            Entry::Occupied(mut e) => {
                let tracked = e.get_mut();
                let current = tracked.status.state;
                if current != WorkloadState::NotStarted && !current.is_terminal() {
                    return Err(current);
                }
                let previous = std::mem::replace(
                    &mut tracked.status,
                    WorkloadStatus::new(WorkloadState::Starting),
                );
                tracked.ended = Some(previous).filter(|s| s.state.is_terminal());
                tracked.lifecycle += 1;
                tracked.lifecycle
            }
            Entry::Vacant(e) => {
                e.insert(Tracked {
                    status: WorkloadStatus::new(WorkloadState::Starting),
                    lifecycle: 1,
                    ended: None,
                });
                1
            }
        };
        self.changed.notify_waiters();
        Ok(lifecycle)
    }

    /// Move along the lifecycle. Illegal transitions are refused and the
    /// current state is returned.
    pub fn advance(&self, workload: &str, next: WorkloadStatus) -> Result<(), WorkloadState> {
        let mut entry = self.states.entry(workload.to_string()).or_default();
        let current = entry.status.state;
        if !current.can_transition_to(next.state) {
            tracing::warn!(
                workload,
                from = %current,
                to = %next.state,
                "Refusing workload state transition"
            );
            return Err(current);
        }
        entry.status = next;
        drop(entry);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Handle for waiting on the next write. Arm it (`Notified::enable`)
    /// before reading state to avoid missing a wake-up.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transitions_follow_lifecycle() {
        use WorkloadState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Loading));
        assert!(Starting.can_transition_to(StartFailed));
        assert!(Loading.can_transition_to(Running));
        assert!(Loading.can_transition_to(LoadFailed));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Loading));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!LoadFailed.can_transition_to(Running));
        assert!(!StartFailed.can_transition_to(Loading));
        assert!(!NotStarted.can_transition_to(Running));
    }

    #[test]
    fn terminal_states() {
        assert!(WorkloadState::Stopped.is_terminal());
        assert!(WorkloadState::LoadFailed.is_failed());
        assert!(!WorkloadState::Stopped.is_failed());
        assert!(!WorkloadState::Running.is_terminal());
    }

    #[test]
    fn state_serializes_snake_case() {
        insta::assert_json_snapshot!(
            [WorkloadState::NotStarted, WorkloadState::StartFailed, WorkloadState::Running],
            @r#"
        [
          "not_started",
          "start_failed",
          "running"
        ]
        "#
        );
    }

    #[test]
    fn unknown_workload_is_not_started() {
        let store = StateStore::new();
        assert_eq!(store.get("nope").state, WorkloadState::NotStarted);
        assert!(store.get("nope").error.is_none());
        assert_eq!(store.observe("nope").0, 0);
    }

    #[test]
    fn advance_refuses_leaving_terminal_state() {
        let store = StateStore::new();
        store.begin("w").unwrap();
        store.advance("w", WorkloadStatus::new(WorkloadState::Loading)).unwrap();
        store
            .advance("w", WorkloadStatus::failed(WorkloadError::load_failed("w", "gone")))
            .unwrap();

        let err = store
            .advance("w", WorkloadStatus::new(WorkloadState::Running))
            .unwrap_err();
        assert_eq!(err, WorkloadState::LoadFailed);

        let status = store.get("w");
        assert_eq!(status.state, WorkloadState::LoadFailed);
        assert_eq!(status.error, Some(WorkloadError::load_failed("w", "gone")));
    }

    #[test]
    fn begin_requires_finished_lifecycle() {
        let store = StateStore::new();
        assert_eq!(store.begin("w").unwrap(), 1);
        assert_eq!(store.begin("w").unwrap_err(), WorkloadState::Starting);

        store.advance("w", WorkloadStatus::new(WorkloadState::Loading)).unwrap();
        store.advance("w", WorkloadStatus::new(WorkloadState::Running)).unwrap();
        assert_eq!(store.begin("w").unwrap_err(), WorkloadState::Running);
        store.advance("w", WorkloadStatus::new(WorkloadState::Stopped)).unwrap();

        assert_eq!(store.begin("w").unwrap(), 2);
        assert_eq!(store.observe("w"), (2, WorkloadStatus::new(WorkloadState::Starting)));
    }

    #[test]
    fn ended_lifecycle_keeps_final_status() {
        let store = StateStore::new();
        store.begin("w").unwrap();
        assert_eq!(store.ended("w", 0), None);

        let error = WorkloadError::start_failed("w", "no capacity");
        store.advance("w", WorkloadStatus::failed(error.clone())).unwrap();
        store.begin("w").unwrap();

        assert_eq!(store.ended("w", 1), Some(WorkloadStatus::failed(error)));
        assert_eq!(store.ended("w", 0), None);
        assert_eq!(store.ended("w", 2), None);
    }

    #[tokio::test]
    async fn writes_wake_armed_waiters() {
        let store = Arc::new(StateStore::new());
        let notify = store.notifier();
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            writer.begin("w").unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), notified)
            .await
            .expect("waiter should be woken");
        assert_eq!(store.get("w").state, WorkloadState::Starting);
    }
}
