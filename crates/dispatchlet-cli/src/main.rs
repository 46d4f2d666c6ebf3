//! dispatchlet: host binary for the built-in workloads.
//!
//! The same executable serves as CLI and as worker: the supervisor re-executes
//! it with `DISPATCHLET_WORKER=1`, in which case it runs the worker runtime
//! over stdin/stdout and never parses arguments.

mod cli;
mod workloads;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dispatchlet::{Params, Supervisor, SupervisorConfig, WorkloadRegistry, WorkloadState};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, RunArgs, WorkloadsArgs};

/// Initialize tracing. Logs always go to stderr; stdout carries frames in
/// worker mode and results in CLI mode.
///
/// `RUST_LOG` wins if set. Otherwise `DISPATCHLET_LOG` picks the level for
/// our targets. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("DISPATCHLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "dispatchlet={level},dispatchlet_cli={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let registry = match workloads::registry() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if dispatchlet::is_worker_process() {
        return match dispatchlet::run_worker_stdio(registry).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Worker runtime failed");
                ExitCode::FAILURE
            }
        };
    }

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Workloads(args) => cmd_workloads(&registry, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let params: Params =
        serde_json::from_str(&args.params).context("--params must be a JSON object")?;

    let mut config = SupervisorConfig::new();
    if let Some(secs) = args.timeout {
        let timeout = Duration::try_from_secs_f64(secs).context("invalid --timeout")?;
        config = config.with_await_timeout(timeout);
    }
    let supervisor = Supervisor::new(config);

    let result = run_job(&supervisor, &args, params).await;

    supervisor.shutdown();
    if result.is_ok()
        && let Err(e) = supervisor
            .await_state(&args.workload, WorkloadState::Stopped)
            .await
    {
        tracing::debug!(workload = %args.workload, error = %e, "Worker did not stop cleanly");
    }

    let value = result?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

async fn run_job(
    supervisor: &Supervisor,
    args: &RunArgs,
    params: Params,
) -> anyhow::Result<serde_json::Value> {
    supervisor.start(&args.workload)?;
    supervisor
        .await_state(&args.workload, WorkloadState::Running)
        .await?;
    let id = supervisor.submit(&args.workload, args.routine.as_str(), params)?;
    tracing::debug!(workload = %args.workload, job_id = %id, "Awaiting result");
    Ok(supervisor.await_result(&args.workload, id).await?)
}

/// List workload names. With `--routines`, each workload is loaded in its
/// own worker process and reports its routines.
async fn cmd_workloads(registry: &WorkloadRegistry, args: WorkloadsArgs) -> anyhow::Result<()> {
    if !args.routines {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    let supervisor = Supervisor::default();
    let listed = list_routines(&supervisor, registry).await;

    supervisor.shutdown();
    for name in supervisor.live_workloads() {
        if let Err(e) = supervisor.await_state(&name, WorkloadState::Stopped).await {
            tracing::debug!(workload = %name, error = %e, "Worker did not stop cleanly");
        }
    }

    for (name, routines) in listed? {
        println!("{name}: {}", routines.join(", "));
    }
    Ok(())
}

async fn list_routines(
    supervisor: &Supervisor,
    registry: &WorkloadRegistry,
) -> anyhow::Result<Vec<(String, Vec<String>)>> {
    let names = registry.names();
    for name in &names {
        supervisor.start(name)?;
    }
    let mut listed = Vec::with_capacity(names.len());
    for name in names {
        supervisor
            .await_state(name, WorkloadState::Running)
            .await
            .with_context(|| format!("loading workload {name}"))?;
        let routines = supervisor.routines(name).unwrap_or_default();
        listed.push((name.to_string(), routines));
    }
    Ok(listed)
}
