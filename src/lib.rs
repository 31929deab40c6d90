// ABOUTME: Timed process supervisor library running one child at a time under a deadline
// ABOUTME: Re-exports the supervisor, request/result types, consumers, and configuration
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Shellguard — Timed Process Supervisor
//!
//! Starts a child process, attaches an optional deadline, streams its
//! output to a pluggable [`OutputConsumer`] while a waiter on a dedicated
//! supervision thread blocks on exit, and returns exactly one outcome: a
//! natural exit code, a timeout, or an error raised after the child has
//! been reaped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use shellguard::{CancellationToken, ExecutionRequest, StringAccumulator, Supervisor};
//!
//! # async fn example() -> Result<(), shellguard::SupervisorError> {
//! let supervisor = Supervisor::default();
//! let request = ExecutionRequest::new(["echo", "hi"]).timeout(Duration::from_secs(5));
//! let mut output = StringAccumulator::new();
//!
//! let result = supervisor
//!     .run(&request, &mut output, &CancellationToken::new())
//!     .await?;
//! assert_eq!(result.exit_code(), Some(0));
//! assert_eq!(output.result(), "hi\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`] — Errors, `ExecutionOutcome`, `ExecutionResult`
//! - [`config`] — Supervisor configuration, env parsing, optional TOML loading
//! - [`environment`] — Overlay validation, inheritance, precedence, executable lookup
//! - [`consumer`] — `OutputConsumer` trait and stock consumers
//! - [`drain`] — Chunked, cancellable output draining
//! - [`child`] — Child process handle and lifecycle
//! - [`waiter`] — Exit waiter task and terminate capability
//! - [`deadline`] — One-shot deadline tokens
//! - [`runtime`] — Dedicated supervision thread
//! - [`supervisor`] — The orchestrator

/// Core types: errors and execution results
pub mod types;

/// Child process handle with stdio wiring and lifecycle tracking
pub mod child;
/// Supervisor configuration
pub mod config;
/// Output consumer capability and stock consumers
pub mod consumer;
/// Deadline enforcer and tokens
pub mod deadline;
/// Output drain loop
pub mod drain;
/// Environment composition and executable resolution
pub mod environment;
/// Supervision runtime on its own OS thread
pub mod runtime;
/// Process supervisor orchestrating one invocation at a time
pub mod supervisor;
/// Process waiter task
pub mod waiter;

pub use child::{ProcessState, StderrMode, Termination};
pub use config::SupervisorConfig;
pub use consumer::{DiscardOutput, OutputConsumer, StreamRedirector, StringAccumulator};
pub use deadline::{DeadlineEnforcer, DeadlineState, DeadlineToken, Terminate};
pub use environment::{EnvInheritance, EnvOverlay, Environment};
pub use supervisor::{ExecutionRequest, Supervisor};
pub use types::{ErrorKind, ExecutionOutcome, ExecutionResult, Result, SupervisorError};

pub use tokio_util::sync::CancellationToken;
