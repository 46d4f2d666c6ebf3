//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};

/// Run jobs against isolated worker processes.
#[derive(Parser, Debug)]
#[command(name = "dispatchlet")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one job and print its result as JSON.
    Run(RunArgs),

    /// List built-in workloads.
    Workloads(WorkloadsArgs),
}

#[derive(Parser, Debug)]
pub struct WorkloadsArgs {
    /// Start each workload in a worker process and list its routines.
    #[arg(long)]
    pub routines: bool,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Workload hosting the routine.
    #[arg(short, long)]
    pub workload: String,

    /// Routine to call.
    #[arg(short, long)]
    pub routine: String,

    /// Keyword parameters as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// Give up waiting on the workload after this many seconds.
    #[arg(long, env = "DISPATCHLET_TIMEOUT")]
    pub timeout: Option<f64>,
}
