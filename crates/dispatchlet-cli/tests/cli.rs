//! End-to-end tests against the real `dispatchlet` binary.

use std::sync::Arc;

use assert_cmd::Command;
use dispatchlet::{
    CommandSpawner, Params, Supervisor, SupervisorConfig, SupervisorError, WorkloadState,
};
use predicates::prelude::*;
use serde_json::json;

const BIN: &str = env!("CARGO_BIN_EXE_dispatchlet");

/// Get a command for the dispatchlet binary in CLI mode.
fn dispatchlet() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("dispatchlet").unwrap();
    cmd.env_remove("DISPATCHLET_WORKER")
        .env("DISPATCHLET_LOG", "error");
    cmd
}

fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn supervisor() -> Supervisor {
    let spawner = CommandSpawner::new(BIN).env("DISPATCHLET_LOG", "warn");
    Supervisor::new(SupervisorConfig::new().with_spawner(Arc::new(spawner)))
}

#[test]
fn run_prints_result() {
    dispatchlet()
        .args(["run", "-w", "arith", "-r", "double", "-p", r#"{"x": 21}"#])
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn run_prints_structured_values() {
    dispatchlet()
        .args(["run", "-w", "text", "-r", "upper", "-p", r#"{"text": "hi"}"#])
        .assert()
        .success()
        .stdout("\"HI\"\n");
}

#[test]
fn routine_failure_exits_nonzero() {
    dispatchlet()
        .args(["run", "-w", "arith", "-r", "divide", "-p", r#"{"a": 1, "b": 0}"#])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains(
            "routine divide failed: division by zero",
        ));
}

#[test]
fn unknown_workload_fails_to_load() {
    dispatchlet()
        .args(["run", "-w", "ghost", "-r", "anything"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(
            "workload ghost failed to load: workload ghost not found",
        ));
}

#[test]
fn rejects_non_object_params() {
    dispatchlet()
        .args(["run", "-w", "arith", "-r", "double", "-p", "[1]"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--params must be a JSON object"));
}

#[test]
fn run_honours_timeout() {
    dispatchlet()
        .args(["run", "-w", "sleepy", "-r", "nap", "-p", r#"{"ms": 2000}"#, "--timeout", "0.2"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("timed out"));
}

#[test]
fn lists_workloads() {
    dispatchlet()
        .arg("workloads")
        .assert()
        .success()
        .stdout("arith\nsleepy\ntext\n");
}

#[test]
fn lists_routines_from_worker_processes() {
    dispatchlet()
        .args(["workloads", "--routines"])
        .assert()
        .success()
        .stdout("arith: add, divide, double\nsleepy: nap\ntext: upper, word_count\n");
}

#[tokio::test]
async fn workloads_run_in_separate_processes() {
    let sup = supervisor();
    sup.start("arith").unwrap();
    sup.start("text").unwrap();
    sup.await_state("arith", WorkloadState::Running).await.unwrap();
    sup.await_state("text", WorkloadState::Running).await.unwrap();

    let arith_pid = sup.worker_pid("arith").expect("arith runs in a child process");
    let text_pid = sup.worker_pid("text").expect("text runs in a child process");
    assert_ne!(arith_pid, text_pid);
    assert_ne!(arith_pid, std::process::id());

    let sum = sup.submit("arith", "add", params(json!({"a": 2, "b": 3}))).unwrap();
    let words = sup
        .submit("text", "word_count", params(json!({"text": "a b c d"})))
        .unwrap();
    assert_eq!(sup.await_result("arith", sum).await.unwrap(), json!(5));
    assert_eq!(sup.await_result("text", words).await.unwrap(), json!(4));

    sup.shutdown();
    sup.await_state("arith", WorkloadState::Stopped).await.unwrap();
    sup.await_state("text", WorkloadState::Stopped).await.unwrap();
}

#[tokio::test]
async fn stopped_workload_restarts_on_submit() {
    let sup = supervisor();
    let first = sup.submit("arith", "double", params(json!({"x": 1}))).unwrap();
    assert_eq!(sup.await_result("arith", first).await.unwrap(), json!(2));

    sup.stop("arith").unwrap();
    sup.await_state("arith", WorkloadState::Stopped).await.unwrap();

    let second = sup.submit("arith", "double", params(json!({"x": 2}))).unwrap();
    assert_eq!(sup.await_result("arith", second).await.unwrap(), json!(4));
    assert_eq!(sup.status("arith").state, WorkloadState::Running);
}

#[tokio::test]
async fn load_failure_in_child_surfaces_to_caller() {
    let sup = supervisor();
    sup.start("ghost").unwrap();
    let err = sup
        .await_state("ghost", WorkloadState::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Workload(_)));
    assert_eq!(sup.status("ghost").state, WorkloadState::LoadFailed);
}
