// ABOUTME: Process waiter task that blocks on child exit independently of output draining
// ABOUTME: Serves termination requests, honors cancellation by killing and reaping, and always reaps
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io;
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::child::{ChildProcess, Termination};
use crate::deadline::Terminate;
use crate::types::{Result, SupervisorError};

/// Pending termination requests a waiter will queue
const TERMINATE_QUEUE: usize = 4;

/// What the waiter observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    /// OS process id
    pub pid: Option<u32>,
    /// Exit status collected from the OS
    pub status: ExitStatus,
    /// A kill was delivered while the process was running
    pub terminated: bool,
    /// The waiter was cancelled before the process exited on its own
    pub cancelled: bool,
}

#[derive(Debug)]
struct TerminateRequest {
    reply: oneshot::Sender<Termination>,
}

/// Cloneable capability to terminate the process a waiter owns
///
/// Requests are served by the waiter itself, so the process handle
/// has a single owner. Once the waiter is done every request reports
/// [`Termination::AlreadyExited`].
#[derive(Debug, Clone)]
pub struct ProcessTerminator {
    requests: mpsc::Sender<TerminateRequest>,
}

#[async_trait]
impl Terminate for ProcessTerminator {
    async fn terminate(&self) -> Termination {
        let (reply, response) = oneshot::channel();
        if self.requests.send(TerminateRequest { reply }).await.is_err() {
            return Termination::AlreadyExited;
        }
        response.await.unwrap_or(Termination::AlreadyExited)
    }
}

/// Spawns the waiter task for one child
#[derive(Debug)]
pub struct ProcessWaiter;

impl ProcessWaiter {
    /// Hand `child` to a new waiter task on `runtime`
    ///
    /// `child` must have been spawned in the context of `runtime`. Cancelling
    /// `cancel` makes the waiter kill the child, reap it and report
    /// `cancelled`.
    pub fn spawn(
        runtime: &Handle,
        child: ChildProcess,
        cancel: CancellationToken,
    ) -> (WaiterHandle, ProcessTerminator) {
        let (tx, rx) = mpsc::channel(TERMINATE_QUEUE);
        let exited = CancellationToken::new();
        let terminator = ProcessTerminator { requests: tx };

        let join = runtime.spawn(wait_for_exit(child, rx, cancel.clone(), exited.clone()));

        (
            WaiterHandle {
                join: Some(join),
                cancel,
                exited,
            },
            terminator,
        )
    }
}

async fn wait_for_exit(
    mut child: ChildProcess,
    mut requests: mpsc::Receiver<TerminateRequest>,
    cancel: CancellationToken,
    exited: CancellationToken,
) -> Result<WaitReport> {
    let _exit_signal = exited.drop_guard();
    child.mark_running();

    let mut cancelled = false;
    let outcome = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = requests.recv() => {
                let termination = child.terminate();
                // The requester may have gone away; the kill stands either way.
                let _ = request.reply.send(termination);
            }
            () = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                if child.terminate() == Termination::Killed {
                    debug!(pid = child.pid(), "Waiter cancelled; killed child process");
                }
            }
        }
    };

    // Requests that raced with the exit are answered, not left pending.
    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Termination::AlreadyExited);
    }

    child.reap().await;

    let status = outcome?;
    Ok(WaitReport {
        pid: child.pid(),
        status,
        terminated: child.was_terminated(),
        cancelled: cancelled && child.was_terminated(),
    })
}

/// Handle to a running waiter
///
/// Dropping the handle without joining cancels the waiter, which then
/// kills and reaps the child on its own.
#[derive(Debug)]
pub struct WaiterHandle {
    join: Option<JoinHandle<Result<WaitReport>>>,
    cancel: CancellationToken,
    exited: CancellationToken,
}

impl WaiterHandle {
    /// Ask the waiter to give up: the child is killed and reaped
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the child has exited (for any reason)
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    /// Wait for the waiter to finish and collect its report
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the exit status could not be collected or
    /// the waiter task died.
    pub async fn join(mut self) -> Result<WaitReport> {
        let Some(join) = self.join.take() else {
            return Err(SupervisorError::io(
                "process waiter already joined",
                io::Error::other("joined twice"),
            ));
        };

        match join.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Process waiter task failed");
                Err(SupervisorError::io(
                    "process waiter task failed",
                    io::Error::other(e.to_string()),
                ))
            }
        }
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.cancel.cancel();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::child::{SpawnSpec, StderrMode};
    use crate::environment::Environment;

    fn spawn_sh(script: &str) -> ChildProcess {
        let mut env = Environment::new();
        env.insert("PATH".to_owned(), "/bin:/usr/bin".to_owned());
        let args = vec!["-c".to_owned(), script.to_owned()];
        let program = PathBuf::from("/bin/sh");
        let cwd = PathBuf::from("/");
        ChildProcess::spawn(&SpawnSpec {
            program: &program,
            args: &args,
            environment: &env,
            working_directory: &cwd,
            stderr: StderrMode::Discard,
            pipe_stdin: false,
            chunk_size: 64,
        })
        .unwrap()
    }

    fn start(child: ChildProcess, cancel: CancellationToken) -> (WaiterHandle, ProcessTerminator) {
        ProcessWaiter::spawn(&Handle::current(), child, cancel)
    }

    #[tokio::test]
    async fn test_reports_natural_exit_code() {
        let (waiter, _terminator) = start(spawn_sh("exit 4"), CancellationToken::new());
        let report = waiter.join().await.unwrap();
        assert_eq!(report.status.code(), Some(4));
        assert!(!report.terminated);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_terminator_kills_running_child() {
        let (waiter, terminator) = start(spawn_sh("sleep 30"), CancellationToken::new());
        assert_eq!(terminator.terminate().await, Termination::Killed);

        let report = tokio::time::timeout(Duration::from_secs(5), waiter.join())
            .await
            .unwrap()
            .unwrap();
        assert!(report.terminated);
        assert_eq!(report.status.code(), None);
    }

    #[tokio::test]
    async fn test_terminator_after_exit_is_noop() {
        let (waiter, terminator) = start(spawn_sh("true"), CancellationToken::new());
        waiter.exited().await;
        let report = waiter.join().await.unwrap();
        assert_eq!(terminator.terminate().await, Termination::AlreadyExited);
        assert!(!report.terminated);
    }

    #[tokio::test]
    async fn test_cancel_kills_and_reaps() {
        let cancel = CancellationToken::new();
        let (waiter, _terminator) = start(spawn_sh("sleep 30"), cancel.clone());
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(5), waiter.join())
            .await
            .unwrap()
            .unwrap();
        assert!(report.cancelled);
        assert!(report.terminated);
    }

    #[tokio::test]
    async fn test_drop_without_join_kills_child() {
        let child = spawn_sh("sleep 30");
        let pid = child.pid().unwrap();
        let (waiter, terminator) = start(child, CancellationToken::new());
        drop(waiter);

        // Once the waiter is gone the terminator has nobody to talk to.
        tokio::time::timeout(Duration::from_secs(5), async {
            while terminator.terminate().await != Termination::AlreadyExited {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        #[cfg(target_os = "linux")]
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        let _ = pid;
    }
}
