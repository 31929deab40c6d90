// ABOUTME: Dedicated supervision runtime on its own OS thread for waiters, deadline timers, and output readers
// ABOUTME: Keeps process bookkeeping moving while the calling task is busy inside a blocking consumer
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io;
use std::thread;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::debug;

use crate::types::{Result, SupervisorError};

const THREAD_NAME: &str = "shellguard-supervision";

/// Single-threaded tokio runtime driven by a dedicated OS thread
///
/// Children spawned under [`enter`](Handle::enter) on this runtime's handle
/// register their pipes and exit notification here, so waiting, killing
/// and deadline timers never depend on the caller's scheduler. Dropping the
/// value stops the thread; tasks still pending are dropped with it, and a
/// dropped child is killed.
#[derive(Debug)]
pub struct SupervisionRuntime {
    handle: Handle,
    _shutdown: oneshot::Sender<()>,
}

impl SupervisionRuntime {
    /// Start the supervision thread and wait until its runtime is up
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the thread or the runtime cannot be created.
    pub async fn start() -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel::<io::Result<Handle>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }
                // Resolves on an explicit send or when the owner drops the sender.
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Supervision runtime stopped");
            })
            .map_err(|e| SupervisorError::io("failed to start supervision thread", e))?;

        let handle = ready_rx
            .await
            .map_err(|_| {
                SupervisorError::io(
                    "supervision thread exited during startup",
                    io::Error::other("startup aborted"),
                )
            })?
            .map_err(|e| SupervisorError::io("failed to build supervision runtime", e))?;

        debug!(thread = THREAD_NAME, "Supervision runtime started");
        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }

    /// Handle for spawning onto, or entering, the supervision runtime
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_progress_while_caller_thread_blocks() {
        let runtime = SupervisionRuntime::start().await.unwrap();
        let (tx, rx) = oneshot::channel();
        runtime.handle().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(thread::current().name().map(str::to_owned));
        });

        // Blocks the only thread of this test's runtime.
        thread::sleep(Duration::from_millis(200));

        let name = tokio::time::timeout(Duration::from_millis(10), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name.as_deref(), Some(THREAD_NAME));
    }

    #[tokio::test]
    async fn test_drop_stops_pending_tasks() {
        let runtime = SupervisionRuntime::start().await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        runtime.handle().spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(());
        });

        drop(runtime);
        // The pending task is dropped along with its sender.
        assert!(tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .is_err());
    }
}
