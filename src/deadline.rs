// ABOUTME: Deadline enforcer issuing one-shot cancellable timers that terminate a target process
// ABOUTME: Each arm() yields a fresh DeadlineToken whose state moves Armed → Fired or Cancelled exactly once
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::child::Termination;

/// Capability to forcibly end one process
///
/// Implementations must be idempotent: asking an exited process to
/// terminate reports [`Termination::AlreadyExited`] and does nothing else.
#[async_trait]
pub trait Terminate: Send + Sync {
    /// Terminate the target if it is still running
    async fn terminate(&self) -> Termination;
}

/// Observable state of a deadline token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineState {
    /// Timer running; nothing has happened yet
    Armed,
    /// The deadline elapsed while the target was running and it was terminated
    Fired,
    /// Cancelled before firing, or elapsed after the target had already exited
    Cancelled,
}

const ARMED: u8 = 0;
// Timer elapsed and a termination is in flight; cancellation can no longer win.
const FIRING: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

/// Factory for deadline tokens
///
/// Tokens are never reused: every invocation arms a new one.
#[derive(Debug, Default)]
pub struct DeadlineEnforcer {
    next_id: AtomicU64,
}

impl DeadlineEnforcer {
    /// Create an enforcer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer on `runtime` that terminates `target` once `duration` elapses
    ///
    /// The timer only depends on `runtime` being driven, not on whoever
    /// holds the token.
    pub fn arm(
        &self,
        runtime: &Handle,
        target: Arc<dyn Terminate>,
        duration: Duration,
    ) -> DeadlineToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(ARMED));
        let cancel = CancellationToken::new();

        let task = runtime.spawn(run_timer(
            id,
            target,
            duration,
            Arc::clone(&state),
            cancel.clone(),
        ));

        debug!(deadline = id, ?duration, "Armed deadline");

        DeadlineToken {
            id,
            state,
            cancel,
            task: Some(task),
        }
    }
}

async fn run_timer(
    id: u64,
    target: Arc<dyn Terminate>,
    duration: Duration,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(duration) => {
            if state
                .compare_exchange(ARMED, FIRING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            match target.terminate().await {
                Termination::Killed => {
                    state.store(FIRED, Ordering::Release);
                    warn!(deadline = id, ?duration, "Deadline elapsed; terminated process");
                }
                Termination::AlreadyExited => {
                    state.store(CANCELLED, Ordering::Release);
                    debug!(deadline = id, "Deadline elapsed after process exit; no effect");
                }
            }
        }
    }
}

/// One armed deadline
///
/// Dropping the token cancels it.
#[derive(Debug)]
pub struct DeadlineToken {
    id: u64,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeadlineToken {
    /// Identifier unique within the enforcer that armed it
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state (a termination still in flight reads as `Armed`)
    pub fn state(&self) -> DeadlineState {
        match self.state.load(Ordering::Acquire) {
            FIRED => DeadlineState::Fired,
            CANCELLED => DeadlineState::Cancelled,
            _ => DeadlineState::Armed,
        }
    }

    /// Returns `true` once the deadline has terminated its target
    pub fn fired(&self) -> bool {
        self.state() == DeadlineState::Fired
    }

    /// Cancel the deadline
    ///
    /// Safe to call any number of times; after firing it is a no-op.
    pub fn cancel(&self) {
        if self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(deadline = self.id, "Cancelled deadline");
        }
        self.cancel.cancel();
    }

    /// Cancel the deadline and wait until its timer has finished
    ///
    /// If a termination was already in flight, this waits for it, so the
    /// returned state is final.
    pub async fn settle(mut self) -> DeadlineState {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(deadline = self.id, error = %e, "Deadline timer task failed");
            }
        }
        self.state()
    }
}

impl Drop for DeadlineToken {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Target that counts termination requests
    struct FakeTarget {
        running: bool,
        calls: AtomicUsize,
    }

    impl FakeTarget {
        fn new(running: bool) -> Arc<Self> {
            Arc::new(Self {
                running,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Terminate for FakeTarget {
        async fn terminate(&self) -> Termination {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.running {
                Termination::Killed
            } else {
                Termination::AlreadyExited
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let enforcer = DeadlineEnforcer::new();
        let target = FakeTarget::new(true);
        let token = enforcer.arm(&Handle::current(), target.clone(), Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(199)).await;
        assert_eq!(token.state(), DeadlineState::Armed);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(token.fired());
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_firing_prevents_termination() {
        let enforcer = DeadlineEnforcer::new();
        let target = FakeTarget::new(true);
        let token = enforcer.arm(&Handle::current(), target.clone(), Duration::from_millis(200));

        token.cancel();
        token.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(token.settle().await, DeadlineState::Cancelled);
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_firing_is_noop() {
        let enforcer = DeadlineEnforcer::new();
        let target = FakeTarget::new(true);
        let token = enforcer.arm(&Handle::current(), target.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        assert_eq!(token.settle().await, DeadlineState::Fired);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_after_exit_is_not_fired() {
        let enforcer = DeadlineEnforcer::new();
        let target = FakeTarget::new(false);
        let token = enforcer.arm(&Handle::current(), target.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(token.settle().await, DeadlineState::Cancelled);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_timer() {
        let enforcer = DeadlineEnforcer::new();
        let target = FakeTarget::new(true);
        drop(enforcer.arm(&Handle::current(), target.clone(), Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_arm_gets_fresh_token() {
        let enforcer = DeadlineEnforcer::new();
        let target = FakeTarget::new(true);
        let first = enforcer.arm(&Handle::current(), target.clone(), Duration::from_millis(10));
        let second = enforcer.arm(&Handle::current(), target.clone(), Duration::from_secs(10));

        assert_ne!(first.id(), second.id());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first.fired());
        assert_eq!(second.state(), DeadlineState::Armed);
    }
}
