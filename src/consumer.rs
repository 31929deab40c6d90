// ABOUTME: Output consumer capability fed by the drain, plus stock consumers
// ABOUTME: StringAccumulator collects text, StreamRedirector forwards bytes, DiscardOutput drops them
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io::Write;

use crate::types::BoxError;

/// Receiver of a child's output
///
/// For every invocation the drain calls [`reset`](Self::reset) exactly once,
/// then [`process_buffer`](Self::process_buffer) zero or more times in
/// output order. Chunk boundaries carry no meaning: a logical line may be
/// split across calls. Returning an error aborts the invocation.
pub trait OutputConsumer: Send {
    /// Discard anything left over from a previous invocation
    fn reset(&mut self);

    /// Handle the next chunk of output
    fn process_buffer(&mut self, buffer: &[u8]) -> Result<(), BoxError>;
}

/// Collects output into a `String` (invalid UTF-8 is replaced)
///
/// Bytes are kept until `result` is called so that multi-byte characters
/// split across chunks decode correctly.
#[derive(Debug, Default, Clone)]
pub struct StringAccumulator {
    bytes: Vec<u8>,
}

impl StringAccumulator {
    /// Create an empty accumulator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Output collected so far
    pub fn result(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Raw bytes collected so far
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl OutputConsumer for StringAccumulator {
    fn reset(&mut self) {
        self.bytes.clear();
    }

    fn process_buffer(&mut self, buffer: &[u8]) -> Result<(), BoxError> {
        self.bytes.extend_from_slice(buffer);
        Ok(())
    }
}

/// Forwards output into a writer, flushing after every chunk
#[derive(Debug)]
pub struct StreamRedirector<W> {
    writer: W,
}

impl<W: Write + Send> StreamRedirector<W> {
    /// Wrap a writer
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Borrow the writer
    pub const fn get_ref(&self) -> &W {
        &self.writer
    }
}

impl<W: Write + Send> OutputConsumer for StreamRedirector<W> {
    // The writer is a sink; there is nothing to clear.
    fn reset(&mut self) {}

    fn process_buffer(&mut self, buffer: &[u8]) -> Result<(), BoxError> {
        self.writer.write_all(buffer)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Drops all output (the equivalent of `/dev/null`)
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardOutput;

impl OutputConsumer for DiscardOutput {
    fn reset(&mut self) {}

    fn process_buffer(&mut self, _buffer: &[u8]) -> Result<(), BoxError> {
        Ok(())
    }
}
