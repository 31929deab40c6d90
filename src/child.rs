// ABOUTME: Child process handle with stdio wiring, lifecycle tracking, terminate and reap
// ABOUTME: Merges stderr into the output source on request; kill-on-drop guards against leaks
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, Command};
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use crate::environment::{apply_environment, Environment};
use crate::types::{Result, SupervisorError};

/// Readable end of the child's (possibly combined) output
pub type OutputSource = Pin<Box<dyn AsyncRead + Send>>;

/// Where the child's standard error goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrMode {
    /// Interleave stderr with stdout in the drained output
    #[default]
    Merge,
    /// Let stderr go wherever the supervisor's own stderr goes
    Inherit,
    /// Send stderr to the null device
    Discard,
}

impl fmt::Display for StderrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Inherit => write!(f, "inherit"),
            Self::Discard => write!(f, "discard"),
        }
    }
}

/// Lifecycle of one child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, nobody waiting on it yet
    Spawned,
    /// A waiter is blocked on its exit
    Running,
    /// Exited without being terminated by us
    ExitedNaturally,
    /// Exited after we delivered a kill
    Terminated,
    /// Exit status collected and every handle released
    Reaped,
}

/// Result of asking a process to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was still running and a kill was delivered
    Killed,
    /// The process had already exited; nothing was done
    AlreadyExited,
}

/// Everything needed to launch a child
#[derive(Debug)]
pub struct SpawnSpec<'a> {
    /// Resolved executable
    pub program: &'a Path,
    /// Arguments after the executable, passed verbatim
    pub args: &'a [String],
    /// Complete child environment
    pub environment: &'a Environment,
    /// Working directory
    pub working_directory: &'a Path,
    /// Stderr routing
    pub stderr: StderrMode,
    /// Whether to open a stdin pipe (otherwise stdin is null)
    pub pipe_stdin: bool,
    /// Read size used when merging stdout and stderr
    pub chunk_size: usize,
}

/// Handle to one spawned OS process
///
/// Owns the tokio `Child` with `kill_on_drop` set, so a handle that is
/// dropped without being reaped still takes its process down with it.
pub struct ChildProcess {
    inner: Child,
    pid: Option<u32>,
    state: ProcessState,
    exit_status: Option<ExitStatus>,
    killed: bool,
    stdin: Option<ChildStdin>,
    output: Option<OutputSource>,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("exit_status", &self.exit_status)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

impl ChildProcess {
    /// Launch a child according to `spec`
    ///
    /// No shell is involved: arguments reach the program exactly as given.
    ///
    /// # Errors
    ///
    /// Returns a `Spawn` error if the OS refuses to create the process.
    pub fn spawn(spec: &SpawnSpec<'_>) -> Result<Self> {
        let mut cmd = Command::new(spec.program);
        cmd.args(spec.args);
        apply_environment(&mut cmd, spec.environment, spec.working_directory);

        cmd.stdin(if spec.pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(match spec.stderr {
            StderrMode::Merge => Stdio::piped(),
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Discard => Stdio::null(),
        });
        cmd.kill_on_drop(true);

        let mut inner = cmd.spawn().map_err(|e| {
            SupervisorError::spawn(format!(
                "Failed to spawn {}: {e}",
                spec.program.display()
            ))
            .with_source(e)
        })?;

        let pid = inner.id();
        let stdin = inner.stdin.take();
        let output = merge_output(&mut inner, spec.chunk_size);

        debug!(
            pid,
            program = %spec.program.display(),
            stderr = %spec.stderr,
            "Spawned child process"
        );

        Ok(Self {
            inner,
            pid,
            state: ProcessState::Spawned,
            exit_status: None,
            killed: false,
            stdin,
            output,
        })
    }

    /// OS process id captured at spawn time
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Returns `true` if a kill was delivered while the process was running
    pub const fn was_terminated(&self) -> bool {
        self.killed
    }

    /// Take the stdin pipe (present only when requested at spawn)
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the output source
    pub fn take_output(&mut self) -> Option<OutputSource> {
        self.output.take()
    }

    pub(crate) fn mark_running(&mut self) {
        if self.state == ProcessState::Spawned {
            self.state = ProcessState::Running;
        }
    }

    /// Forcibly terminate the process if it is still running
    ///
    /// Terminating a process that already exited is a no-op.
    pub fn terminate(&mut self) -> Termination {
        if self.exit_status.is_some() {
            return Termination::AlreadyExited;
        }

        match self.inner.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                return Termination::AlreadyExited;
            }
            Ok(None) => {}
            Err(e) => warn!(pid = self.pid, error = %e, "Failed to poll child status"),
        }

        match self.inner.start_kill() {
            Ok(()) => {
                self.killed = true;
                debug!(pid = self.pid, "Delivered kill to child process");
                Termination::Killed
            }
            Err(e) => {
                debug!(pid = self.pid, error = %e, "Kill not delivered; child already gone");
                Termination::AlreadyExited
            }
        }
    }

    /// Block until the process exits
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the exit status cannot be collected.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let status = self
            .inner
            .wait()
            .await
            .map_err(|e| SupervisorError::io("failed to wait for child process", e))?;
        self.record_exit(status);
        Ok(status)
    }

    /// Make sure the process is gone and release every handle
    ///
    /// Idempotent. Failures are logged, never returned.
    pub async fn reap(&mut self) {
        if self.state == ProcessState::Reaped {
            return;
        }

        if self.exit_status.is_none() {
            self.terminate();
            if let Err(e) = self.wait().await {
                warn!(pid = self.pid, error = %e, "Failed to reap child process");
            }
        }

        self.stdin = None;
        self.output = None;
        self.state = ProcessState::Reaped;
        debug!(pid = self.pid, "Reaped child process");
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.state = if self.killed {
            ProcessState::Terminated
        } else {
            ProcessState::ExitedNaturally
        };
    }
}

/// Build the output source: stdout alone, or stdout and stderr interleaved
fn merge_output(child: &mut Child, chunk_size: usize) -> Option<OutputSource> {
    let capacity = chunk_size.max(1);
    let source: OutputSource = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => {
            let merged = ReaderStream::with_capacity(stdout, capacity)
                .merge(ReaderStream::with_capacity(stderr, capacity));
            Box::pin(StreamReader::new(merged))
        }
        (Some(stdout), None) => Box::pin(stdout),
        (None, Some(stderr)) => Box::pin(stderr),
        (None, None) => return None,
    };
    Some(source)
}
