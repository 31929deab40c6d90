// ABOUTME: CLI entry point for the shellguard binary
// ABOUTME: Parses arguments, runs one command under a deadline, and maps the outcome to an exit status
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::json;
use shellguard::config::default_config_path;
use shellguard::{
    CancellationToken, EnvOverlay, ErrorKind, ExecutionOutcome, ExecutionRequest,
    ExecutionResult, StderrMode, StreamRedirector, Supervisor, SupervisorConfig, SupervisorError,
};
use tracing::{debug, warn};

/// Exit status when the deadline fired (same as coreutils `timeout`)
const EXIT_TIMED_OUT: u8 = 124;
/// Exit status when the supervisor itself failed
const EXIT_SUPERVISOR_ERROR: u8 = 125;
/// Exit status after Ctrl-C
const EXIT_INTERRUPTED: u8 = 130;

/// Where the child's stderr goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StderrArg {
    /// Interleave with stdout
    Merge,
    /// Pass through to this process's stderr
    Inherit,
    /// Drop it
    Discard,
}

impl From<StderrArg> for StderrMode {
    fn from(arg: StderrArg) -> Self {
        match arg {
            StderrArg::Merge => Self::Merge,
            StderrArg::Inherit => Self::Inherit,
            StderrArg::Discard => Self::Discard,
        }
    }
}

/// shellguard — run a command with a deadline and guaranteed cleanup
#[derive(Debug, Parser)]
#[command(name = "shellguard", version, about)]
struct Cli {
    /// Deadline in milliseconds (0 = unlimited); overrides the configured default
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Working directory for the command
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the command (repeatable)
    #[arg(long = "env", value_name = "NAME=VALUE")]
    env: Vec<String>,

    /// Stderr routing
    #[arg(long, value_enum, default_value_t = StderrArg::Merge)]
    stderr: StderrArg,

    /// Print a JSON report of the outcome to stderr
    #[arg(long)]
    json: bool,

    /// Configuration file (defaults to `<config dir>/shellguard/config.toml` if present);
    /// SHELLGUARD_* environment variables override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Command and its arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

/// Resolve configuration: explicit file, else the default file if present, else defaults;
/// `SHELLGUARD_*` variables override whichever was chosen
fn load_config(explicit: Option<&Path>) -> Result<SupervisorConfig, SupervisorError> {
    let base = match (explicit, default_config_path()) {
        (Some(path), _) => SupervisorConfig::load(path)?,
        (None, Some(path)) if path.is_file() => {
            debug!(path = %path.display(), "Loading default configuration file");
            SupervisorConfig::load(&path)?
        }
        _ => SupervisorConfig::default(),
    };
    base.with_env_overrides()
}

/// Turn parsed arguments into a request
fn build_request(cli: &Cli) -> Result<ExecutionRequest, SupervisorError> {
    let mut overlay = EnvOverlay::new();
    for assignment in &cli.env {
        overlay.push_assignment(assignment)?;
    }

    let mut request = ExecutionRequest::new(cli.command.iter().cloned())
        .overlay(&overlay)
        .stderr(cli.stderr.into());
    if let Some(ms) = cli.timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    }
    if let Some(dir) = &cli.cwd {
        request = request.current_dir(dir);
    }
    Ok(request)
}

/// Exit status for an invocation outcome
fn exit_status(outcome: &Result<ExecutionResult, SupervisorError>) -> u8 {
    match outcome {
        // Codes outside 0..=255 wrap the way the OS would report them.
        Ok(result) => match result.outcome {
            ExecutionOutcome::Exited { code } => (code & 0xff) as u8,
            ExecutionOutcome::TimedOut => EXIT_TIMED_OUT,
        },
        Err(e) if e.is(ErrorKind::Interrupted) => EXIT_INTERRUPTED,
        Err(_) => EXIT_SUPERVISOR_ERROR,
    }
}

/// JSON report of an invocation outcome
fn report(
    command: &[String],
    outcome: &Result<ExecutionResult, SupervisorError>,
) -> serde_json::Value {
    match outcome {
        Ok(result) => json!({
            "command": command,
            "result": result,
        }),
        Err(e) => json!({
            "command": command,
            "error": {
                "kind": e.kind,
                "message": e.message,
            },
        }),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match (load_config(cli.config.as_deref()), build_request(&cli)) {
        (Ok(config), Ok(request)) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; terminating child");
                    on_interrupt.cancel();
                }
            });

            let supervisor = Supervisor::new(config);
            let mut stdout = StreamRedirector::new(io::stdout());
            supervisor.run(&request, &mut stdout, &cancel).await
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    };

    if let Err(e) = &outcome {
        eprintln!("shellguard: {e}");
    }
    if cli.json {
        eprintln!("{}", report(&cli.command, &outcome));
    }

    ExitCode::from(exit_status(&outcome))
}
