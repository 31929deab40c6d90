// ABOUTME: Core types for the timed process supervisor: error taxonomy and execution results
// ABOUTME: Provides SupervisorError with kinds, the tagged ExecutionOutcome, and ExecutionResult
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Core Types
//!
//! Every invocation of the supervisor ends in exactly one of three ways:
//! the child exited on its own, the deadline fired and the child was
//! terminated, or an error was raised (after teardown completed). The
//! first two are values ([`ExecutionOutcome`]); only the third is an `Err`.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit code reported when the OS gives no code (the child died from a signal)
pub const UNKNOWN_EXIT_CODE: i32 = -1;

// ============================================================================
// Error Type
// ============================================================================

/// Categories of errors produced by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The child could not be created (not found, permission denied, bad cwd)
    Spawn,
    /// The request was malformed; nothing was spawned
    Validation,
    /// The output consumer raised an error while draining
    Drain,
    /// The caller cancelled the invocation while it was running
    Interrupted,
    /// Another invocation is in flight on the same supervisor (`try_run` only)
    Busy,
    /// I/O failure while talking to the child
    Io,
    /// Configuration could not be read or parsed
    Config,
    /// A timed-out result was converted into an error by the caller
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawn => "spawn",
            Self::Validation => "validation",
            Self::Drain => "drain",
            Self::Interrupted => "interrupted",
            Self::Busy => "busy",
            Self::Io => "io",
            Self::Config => "config",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Boxed error raised by caller-supplied callbacks (output consumers)
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared, cloneable error source
type ErrorSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Error type for supervisor operations
#[derive(Debug, Clone)]
pub struct SupervisorError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    source: Option<ErrorSource>,
}

impl SupervisorError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Create a spawn error
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Spawn, message)
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a drain error wrapping the consumer's failure
    pub fn drain(source: BoxError) -> Self {
        let mut err = Self::new(ErrorKind::Drain, format!("output consumer failed: {source}"));
        err.source = Some(Arc::from(source));
        err
    }

    /// Create an interruption error
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interrupted, message)
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    /// Create an I/O error
    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{context}: {err}")).with_source(err)
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Create a timeout error
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Returns `true` if this error has the given kind
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for SupervisorError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, SupervisorError>;

// ============================================================================
// Execution Results
// ============================================================================

/// How the child process came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The child exited on its own; the code is what the OS reported
    /// ([`UNKNOWN_EXIT_CODE`] when it died from a signal nobody here sent)
    Exited {
        /// Process exit code
        code: i32,
    },
    /// The deadline fired while the child was still running and it was terminated
    TimedOut,
}

/// Result of one supervised invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Natural exit or timeout
    pub outcome: ExecutionOutcome,
    /// OS process id of the (now reaped) child
    pub pid: Option<u32>,
    /// Wall-clock time from spawn to teardown
    pub duration: Duration,
    /// Total bytes forwarded to the output consumer
    pub bytes_drained: u64,
}

impl ExecutionResult {
    /// Returns `true` when the deadline terminated the child
    pub const fn timed_out(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::TimedOut)
    }

    /// Exit code, valid only for a natural exit
    pub const fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExecutionOutcome::Exited { code } => Some(code),
            ExecutionOutcome::TimedOut => None,
        }
    }

    /// Returns `true` for a natural exit with code 0
    pub const fn success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Exited { code: 0 })
    }

    /// Exit code, treating a timeout as an error
    pub fn require_exit_code(&self) -> Result<i32> {
        self.exit_code().ok_or_else(|| {
            SupervisorError::timed_out(format!(
                "process was terminated after its deadline ({:?} elapsed)",
                self.duration
            ))
        })
    }
}
