// ABOUTME: Output drain that reads a child's output in bounded chunks and forwards them to a consumer
// ABOUTME: Resets the consumer once per invocation and stops promptly when its token is cancelled
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{trace, warn};

use crate::consumer::OutputConsumer;
use crate::types::{Result, SupervisorError};

/// Chunks the reader may run ahead of the consumer
const CHUNK_QUEUE: usize = 4;

/// Why the drain loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// The source reached end-of-stream
    Completed,
    /// The stop token was cancelled before end-of-stream
    Stopped,
}

/// What one drain pass delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// How the loop ended
    pub status: DrainStatus,
    /// Bytes handed to the consumer
    pub bytes: u64,
    /// Number of `process_buffer` calls
    pub chunks: u64,
}

impl DrainSummary {
    /// Summary of a drain that had nothing to read
    pub const fn empty() -> Self {
        Self {
            status: DrainStatus::Completed,
            bytes: 0,
            chunks: 0,
        }
    }
}

/// Reader task pulling a child's output into a bounded queue
///
/// The task runs on whichever runtime it was spawned onto, so the pipe
/// keeps being read, and a full queue keeps applying backpressure, however
/// long the consumer takes on the receiving side.
#[derive(Debug)]
pub struct OutputReader {
    chunks: mpsc::Receiver<io::Result<Vec<u8>>>,
    task: JoinHandle<()>,
    halt: DropGuard,
}

impl OutputReader {
    /// Start reading `source` in chunks of at most `chunk_size` bytes
    ///
    /// The reader ends at end-of-stream, on the first read error, when
    /// `stop` is cancelled, or when the reader handle is dropped.
    pub fn spawn<R>(
        runtime: &Handle,
        source: R,
        chunk_size: usize,
        stop: &CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let halt = stop.child_token();
        let task = runtime.spawn(read_chunks(source, chunk_size.max(1), tx, halt.clone()));
        Self {
            chunks: rx,
            task,
            halt: halt.drop_guard(),
        }
    }

    /// Stop reading and wait until the source has been released
    pub async fn finish(self) {
        let Self { chunks, task, halt } = self;
        drop(chunks);
        drop(halt);
        if let Err(e) = task.await {
            warn!(error = %e, "Output reader task failed");
        }
    }
}

async fn read_chunks<R>(
    mut source: R,
    chunk_size: usize,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    halt: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let read = tokio::select! {
            biased;
            () = halt.cancelled() => break,
            read = source.read(&mut buf) => read,
        };

        let (chunk, last) = match read {
            Ok(0) => break,
            Ok(n) => (Ok(buf[..n].to_vec()), false),
            Err(e) => (Err(e), true),
        };

        let sent = tokio::select! {
            biased;
            () = halt.cancelled() => break,
            sent = tx.send(chunk) => sent,
        };
        if sent.is_err() || last {
            break;
        }
    }
}

/// Drain `reader` into `consumer` until end-of-stream or cancellation
///
/// Calls `consumer.reset()` once, then forwards each chunk in order. The
/// stop token is checked between chunks; a pending read is abandoned
/// without losing data already forwarded. The drain never touches the
/// process itself.
///
/// # Errors
///
/// Returns a `Drain` error if the consumer fails and an `Io` error if the
/// source cannot be read.
pub async fn drain(
    reader: &mut OutputReader,
    consumer: &mut dyn OutputConsumer,
    stop: &CancellationToken,
) -> Result<DrainSummary> {
    consumer.reset();

    let mut summary = DrainSummary::empty();

    loop {
        if stop.is_cancelled() {
            summary.status = DrainStatus::Stopped;
            break;
        }

        let next = tokio::select! {
            biased;
            () = stop.cancelled() => {
                summary.status = DrainStatus::Stopped;
                break;
            }
            next = reader.chunks.recv() => next,
        };

        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|e| SupervisorError::io("failed to read child output", e))?;

        consumer
            .process_buffer(&chunk)
            .map_err(SupervisorError::drain)?;
        summary.bytes += chunk.len() as u64;
        summary.chunks += 1;
        trace!(chunk = chunk.len(), total = summary.bytes, "Forwarded output chunk");
    }

    Ok(summary)
}
