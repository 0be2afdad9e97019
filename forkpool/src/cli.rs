use clap::{Parser, Subcommand};
use forkpool_core::{ReadyOn, Strategy};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forkpool")]
#[command(about = "Supervisor for a fleet of identical worker processes", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Spawn a fleet of workers and keep it running
    Run(RunArgs),

    /// Validate a fleet file
    Check(CheckArgs),

    /// Reference worker used for smoke tests (internal use)
    #[cfg(unix)]
    #[command(hide = true)]
    DemoWorker(DemoWorkerArgs),
}

#[derive(Parser)]
pub struct RunArgs {
    /// Fleet file (JSON); command line flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of workers (defaults to the number of CPUs)
    #[arg(short, long)]
    pub number: Option<usize>,

    /// Spawn and restart workers one at a time (series) or all at once (parallel)
    #[arg(long)]
    pub strategy: Option<Strategy>,

    /// Milliseconds a worker may take to become ready, 0 waits forever
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Readiness signal: listening or ready
    #[arg(long)]
    pub ready_on: Option<ReadyOn>,

    /// Milliseconds a ready worker must stay up before it counts as started
    #[arg(long)]
    pub confirm_delay: Option<u64>,

    /// Milliseconds a worker gets to exit after a disconnect before it is killed
    #[arg(long)]
    pub disconnect_timeout: Option<u64>,

    /// Working directory for workers
    #[arg(short = 'd', long)]
    pub cwd: Option<PathBuf>,

    /// Environment variables for workers (KEY=VALUE)
    #[arg(short, long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Program or script each worker runs, followed by its arguments
    #[arg(trailing_var_arg = true, value_name = "SCRIPT [ARGS]")]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn script(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn script_args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

#[derive(Parser)]
pub struct CheckArgs {
    /// Fleet file to validate
    pub file: PathBuf,
}

#[cfg(unix)]
#[derive(Parser)]
pub struct DemoWorkerArgs {
    /// How the worker behaves once started
    #[arg(long, value_enum, default_value = "ready")]
    pub mode: DemoMode,

    /// Pause between start-up steps, in milliseconds
    #[arg(long, default_value = "40")]
    pub step_ms: u64,

    /// Lifetime after readiness in bad-exit mode, in milliseconds
    #[arg(long, default_value = "5000")]
    pub exit_after_ms: u64,
}

#[cfg(unix)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DemoMode {
    /// Send the ready message
    Ready,
    /// Open a TCP listener and report it
    Listen,
    /// Fail during start-up
    Broken,
    /// Become ready, then exit with code 1
    BadExit,
    /// Connect but never report readiness
    Silent,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
