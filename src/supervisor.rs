// ABOUTME: Process supervisor running one child at a time with a deadline and concurrent output draining
// ABOUTME: Composes the environment, wires waiter, drain and deadline together, and always tears down
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::env;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::child::{ChildProcess, SpawnSpec, StderrMode};
use crate::config::SupervisorConfig;
use crate::consumer::OutputConsumer;
use crate::deadline::{DeadlineEnforcer, DeadlineState};
use crate::drain::{drain, DrainStatus, DrainSummary, OutputReader};
use crate::environment::{
    compose_environment, inherited_environment, resolve_executable, validate_entry, EnvOverlay,
    Environment,
};
use crate::runtime::SupervisionRuntime;
use crate::types::{
    ExecutionOutcome, ExecutionResult, Result, SupervisorError, UNKNOWN_EXIT_CODE,
};
use crate::waiter::{ProcessWaiter, WaitReport};

/// One command to run under supervision
///
/// Environment entries are kept exactly as given and validated when the
/// request runs, so a malformed overlay is rejected before anything spawns.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    command: Vec<String>,
    working_directory: Option<PathBuf>,
    env_pairs: Vec<String>,
    timeout: Option<Duration>,
    stderr: StderrMode,
    stdin: Option<Vec<u8>>,
}

impl ExecutionRequest {
    /// Create a request; the first element is the executable
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Run the child in `dir` instead of the supervisor's working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Add one overlay variable
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_pairs.push(name.into());
        self.env_pairs.push(value.into());
        self
    }

    /// Add overlay variables from a flat list alternating name and value
    pub fn env_pairs<I, S>(mut self, flat: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_pairs.extend(flat.into_iter().map(Into::into));
        self
    }

    /// Add every variable of an already validated overlay
    pub fn overlay(mut self, overlay: &EnvOverlay) -> Self {
        for (name, value) in overlay.iter() {
            self.env_pairs.push(name.to_owned());
            self.env_pairs.push(value.to_owned());
        }
        self
    }

    /// Deadline measured from spawn (zero means unlimited)
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `true` merges stderr into the output; `false` leaves it on the supervisor's stderr
    pub const fn merge_stderr(mut self, merge: bool) -> Self {
        self.stderr = if merge {
            StderrMode::Merge
        } else {
            StderrMode::Inherit
        };
        self
    }

    /// Choose where stderr goes
    pub const fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Bytes written to the child's stdin, which is closed afterwards
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Command line as given
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Requested deadline, if any
    pub const fn requested_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Requested stderr routing
    pub const fn stderr_mode(&self) -> StderrMode {
        self.stderr
    }
}

/// Runs supervised child processes, one invocation at a time
///
/// Invocations on the same instance are serialized; separate instances
/// share nothing and run fully in parallel. Each supervisor starts a
/// dedicated supervision thread on its first run, so a consumer that blocks
/// delays its own invocation but never the deadline or the kill.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    exported: RwLock<Environment>,
    enforcer: DeadlineEnforcer,
    runtime: OnceCell<SupervisionRuntime>,
    run_lock: Mutex<()>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl Supervisor {
    /// Create a supervisor with the given configuration
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            exported: RwLock::new(Environment::new()),
            enforcer: DeadlineEnforcer::new(),
            runtime: OnceCell::new(),
            run_lock: Mutex::new(()),
        }
    }

    /// Active configuration
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Export a variable to every subsequent invocation
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error if the name or value is malformed.
    pub fn export(&self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        validate_entry(&name, &value)?;
        debug!(name = %name, "Exported variable");
        self.exported
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
        Ok(())
    }

    /// Remove an exported variable, returning its previous value
    pub fn unexport(&self, name: &str) -> Option<String> {
        self.exported
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Exported value of `name`, falling back to the supervisor's own environment
    pub fn get_env(&self, name: &str) -> Option<String> {
        let exported = self
            .exported
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        exported.or_else(|| env::var(name).ok())
    }

    /// Snapshot of the exported variables
    pub fn exported(&self) -> Environment {
        self.exported
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `true` while an invocation is in flight
    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Run `request`, waiting for any in-flight invocation to finish first
    ///
    /// Output goes to `consumer`, which is reset once before the first chunk.
    /// Cancelling `cancel` stops the drain, kills the child and yields an
    /// `Interrupted` error once the child has been reaped. A deadline that
    /// fires is reported as [`ExecutionOutcome::TimedOut`], not as an error.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed request (nothing is spawned)
    /// - `Spawn` if the child cannot be launched
    /// - `Drain` if the consumer fails (after the child has been reaped)
    /// - `Interrupted` if `cancel` fired (after the child has been reaped)
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        consumer: &mut dyn OutputConsumer,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let _guard = self.run_lock.lock().await;
        self.run_exclusive(request, consumer, cancel).await
    }

    /// Like [`run`](Self::run) but fails with `Busy` instead of waiting
    ///
    /// # Errors
    ///
    /// Returns a `Busy` error if another invocation is in flight, otherwise
    /// the same errors as [`run`](Self::run).
    pub async fn try_run(
        &self,
        request: &ExecutionRequest,
        consumer: &mut dyn OutputConsumer,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Err(SupervisorError::busy(
                "another invocation is in flight on this supervisor",
            ));
        };
        self.run_exclusive(request, consumer, cancel).await
    }

    async fn run_exclusive(
        &self,
        request: &ExecutionRequest,
        consumer: &mut dyn OutputConsumer,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let launch = self.prepare(request)?;

        if cancel.is_cancelled() {
            return Err(SupervisorError::interrupted(
                "cancelled before the child was spawned",
            ));
        }

        let runtime = self
            .runtime
            .get_or_try_init(SupervisionRuntime::start)
            .await?
            .handle();

        // Pipes and exit notification belong to the supervision runtime.
        let child = {
            let _context = runtime.enter();
            ChildProcess::spawn(&SpawnSpec {
                program: &launch.executable,
                args: launch.args,
                environment: &launch.environment,
                working_directory: &launch.working_directory,
                stderr: request.stderr,
                pipe_stdin: request.stdin.is_some(),
                chunk_size: self.config.chunk_size,
            })?
        };

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        debug!(
            pid = child.pid(),
            program = %launch.executable.display(),
            ?timeout,
            "Started supervised process"
        );

        self.supervise(
            runtime,
            child,
            timeout,
            request.stdin.as_deref(),
            consumer,
            cancel,
        )
        .await
    }

    /// Validate the request and work out what to launch, where, and with which environment
    fn prepare<'r>(&self, request: &'r ExecutionRequest) -> Result<Launch<'r>> {
        let overlay = EnvOverlay::from_pairs(&request.env_pairs)?;
        let Some((program, args)) = request.command.split_first() else {
            return Err(SupervisorError::validation("command must not be empty"));
        };

        let working_directory = match &request.working_directory {
            Some(dir) => dir.clone(),
            None => env::current_dir()
                .map_err(|e| SupervisorError::io("cannot determine working directory", e))?,
        };
        if !working_directory.is_dir() {
            return Err(SupervisorError::spawn(format!(
                "working directory {} does not exist",
                working_directory.display()
            )));
        }

        let environment = compose_environment(
            inherited_environment(&self.config.inherit),
            &self.exported(),
            &overlay,
        );
        let executable = resolve_executable(program, &environment, &working_directory)?;

        Ok(Launch {
            executable,
            args,
            environment,
            working_directory,
        })
    }

    /// Drive one spawned child to completion and tear everything down
    ///
    /// The waiter, the deadline timer and the output reader run on
    /// `runtime`; only the consumer calls happen on the calling task.
    async fn supervise(
        &self,
        runtime: &Handle,
        mut child: ChildProcess,
        timeout: Duration,
        stdin_bytes: Option<&[u8]>,
        consumer: &mut dyn OutputConsumer,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let pid = child.pid();
        let drain_stop = cancel.child_token();
        let mut reader = child.take_output().map(|source| {
            OutputReader::spawn(runtime, source, self.config.chunk_size, &drain_stop)
        });
        let stdin = child.take_stdin();

        let (waiter, terminator) = ProcessWaiter::spawn(runtime, child, cancel.child_token());
        let deadline = (!timeout.is_zero())
            .then(|| self.enforcer.arm(runtime, Arc::new(terminator), timeout));

        let drain_done = CancellationToken::new();
        let grace = self.config.drain_grace;

        let drain_side = async {
            let drained = match reader.as_mut() {
                Some(reader) => drain(reader, consumer, &drain_stop).await,
                None => {
                    consumer.reset();
                    Ok(DrainSummary::empty())
                }
            };
            drain_done.cancel();
            // Without end-of-stream nothing guarantees the child will exit.
            if !matches!(&drained, Ok(s) if s.status == DrainStatus::Completed) {
                waiter.cancel();
            }
            drained
        };

        // Descendants that inherited the pipe can keep it open after the child exits.
        let grace_side = async {
            waiter.exited().await;
            tokio::select! {
                () = drain_done.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    warn!(pid, ?grace, "Output still open after child exit; stopping drain");
                    drain_stop.cancel();
                }
            }
        };

        let stdin_side = async {
            let (Some(mut pipe), Some(bytes)) = (stdin, stdin_bytes) else {
                return;
            };
            tokio::select! {
                written = async {
                    pipe.write_all(bytes).await?;
                    pipe.shutdown().await
                } => {
                    if let Err(e) = written {
                        debug!(pid, error = %e, "Child stopped reading stdin");
                    }
                }
                () = waiter.exited() => {}
            }
        };

        let (drained, (), ()) = tokio::join!(drain_side, grace_side, stdin_side);

        // Teardown. The waiter has reaped the child by the time its join resolves.
        let waited = waiter.join().await;
        let deadline_state = match deadline {
            Some(token) => token.settle().await,
            None => DeadlineState::Cancelled,
        };
        if let Some(reader) = reader {
            reader.finish().await;
        }
        let duration = started.elapsed();

        conclude(drained, waited, deadline_state == DeadlineState::Fired, duration)
    }
}

/// Derive the single outcome of an invocation once teardown is complete
///
/// Consumer failures win, then a deadline kill, then a kill caused by
/// caller cancellation. A cancel that lands after the child already exited
/// on its own leaves the natural exit code in place.
fn conclude(
    drained: Result<DrainSummary>,
    waited: Result<WaitReport>,
    deadline_fired: bool,
    duration: Duration,
) -> Result<ExecutionResult> {
    let summary = drained?;
    let report = waited?;

    let outcome = if deadline_fired && killed_by_signal(report.status) {
        ExecutionOutcome::TimedOut
    } else if report.cancelled {
        warn!(pid = report.pid, ?duration, "Supervised process interrupted");
        return Err(SupervisorError::interrupted(format!(
            "invocation cancelled after {duration:?}; child terminated"
        )));
    } else {
        ExecutionOutcome::Exited {
            code: report.status.code().unwrap_or(UNKNOWN_EXIT_CODE),
        }
    };

    debug!(
        pid = report.pid,
        ?outcome,
        ?duration,
        terminated = report.terminated,
        bytes = summary.bytes,
        chunks = summary.chunks,
        "Supervised process finished"
    );

    Ok(ExecutionResult {
        outcome,
        pid: report.pid,
        duration,
        bytes_drained: summary.bytes,
    })
}

/// Resolved launch parameters for one request
struct Launch<'r> {
    executable: PathBuf,
    args: &'r [String],
    environment: Environment,
    working_directory: PathBuf,
}

/// Whether the exit status reflects a kill rather than a natural exit
///
/// A process whose natural exit was recorded before the kill took effect
/// keeps its exit code.
#[cfg(unix)]
fn killed_by_signal(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: ExitStatus) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::StringAccumulator;
    use crate::types::ErrorKind;

    #[test]
    fn test_request_builder_collects_flat_pairs() {
        let request = ExecutionRequest::new(["env"])
            .env("A", "1")
            .env_pairs(["B", "2"])
            .timeout(Duration::from_millis(50))
            .merge_stderr(false);

        assert_eq!(request.command(), ["env"]);
        assert_eq!(request.env_pairs, ["A", "1", "B", "2"]);
        assert_eq!(request.requested_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(request.stderr_mode(), StderrMode::Inherit);
    }

    #[test]
    fn test_request_defaults_to_merged_stderr() {
        assert_eq!(ExecutionRequest::new(["true"]).stderr_mode(), StderrMode::Merge);
    }

    #[test]
    fn test_export_then_unexport() {
        let supervisor = Supervisor::default();
        supervisor.export("SHELLGUARD_TEST_EXPORT", "yes").unwrap();
        assert_eq!(
            supervisor.get_env("SHELLGUARD_TEST_EXPORT").as_deref(),
            Some("yes")
        );
        assert_eq!(
            supervisor.unexport("SHELLGUARD_TEST_EXPORT").as_deref(),
            Some("yes")
        );
        assert!(supervisor.exported().is_empty());
    }

    #[test]
    fn test_export_rejects_malformed_name() {
        let supervisor = Supervisor::default();
        let err = supervisor.export("A=B", "x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_get_env_falls_back_to_process_environment() {
        let supervisor = Supervisor::default();
        assert_eq!(supervisor.get_env("PATH"), env::var("PATH").ok());
    }

    #[tokio::test]
    async fn test_odd_overlay_rejected_before_spawn() {
        let supervisor = Supervisor::default();
        let request = ExecutionRequest::new(["definitely-not-a-real-binary-xyz"]).env_pairs(["A"]);
        let mut consumer = StringAccumulator::new();

        let err = supervisor
            .run(&request, &mut consumer, &CancellationToken::new())
            .await
            .unwrap_err();

        // Validation wins over the missing executable: nothing was resolved or spawned.
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_empty_command_is_validation_error() {
        let supervisor = Supervisor::default();
        let request = ExecutionRequest::new(Vec::<String>::new());
        let err = supervisor
            .run(&request, &mut StringAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_missing_working_directory_is_spawn_error() {
        let supervisor = Supervisor::default();
        let request = ExecutionRequest::new(["true"]).current_dir("/nonexistent/shellguard/dir");
        let err = supervisor
            .run(&request, &mut StringAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Spawn);
    }

    #[tokio::test]
    async fn test_try_run_reports_busy_while_locked() {
        let supervisor = Supervisor::default();
        let _held = supervisor.run_lock.lock().await;
        assert!(supervisor.is_busy());

        let err = supervisor
            .try_run(
                &ExecutionRequest::new(["true"]),
                &mut StringAccumulator::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[cfg(unix)]
    fn report(raw_status: i32, terminated: bool, cancelled: bool) -> WaitReport {
        use std::os::unix::process::ExitStatusExt;
        WaitReport {
            pid: Some(42),
            status: ExitStatus::from_raw(raw_status),
            terminated,
            cancelled,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_conclude_keeps_natural_exit_when_cancel_killed_nothing() {
        // Exit code 3 in wait(2) encoding.
        let result = conclude(
            Ok(DrainSummary::empty()),
            Ok(report(3 << 8, false, false)),
            false,
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Exited { code: 3 });
    }

    #[cfg(unix)]
    #[test]
    fn test_conclude_reports_interrupted_after_cancel_kill() {
        // SIGKILL in wait(2) encoding.
        let err = conclude(
            Ok(DrainSummary::empty()),
            Ok(report(9, true, true)),
            false,
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interrupted);
    }

    #[cfg(unix)]
    #[test]
    fn test_conclude_prefers_deadline_over_cancel() {
        let result = conclude(
            Ok(DrainSummary::empty()),
            Ok(report(9, true, true)),
            true,
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_token_stops_before_spawn() {
        let supervisor = Supervisor::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = supervisor
            .run(
                &ExecutionRequest::new(["sh", "-c", "true"]),
                &mut StringAccumulator::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interrupted);
    }
}
