//! Line reassembly over an unframed byte stream.
//!
//! Reads from an RFCOMM link arrive in arbitrary chunks: one read can
//! carry several lines, half a line, or nothing at all. `StreamBuffer`
//! accumulates those chunks and hands back complete lines only, keeping
//! the unterminated tail verbatim for the next read.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};

/// Line delimiter on the wire.
const NEWLINE: u8 = b'\n';

/// Growable byte accumulator with a scan cursor.
///
/// Invariant: every byte appended is returned exactly once, in order,
/// as part of some drained line (minus the `\n` delimiters), or is still
/// pending in the buffer.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: BytesMut,
    /// Bytes at the front of `buf` already known to contain no newline.
    scanned: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer with room for `capacity` bytes before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            scanned: 0,
        }
    }

    /// Adds newly read bytes. Empty reads are a no-op.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns every complete line found so far.
    ///
    /// Lines are returned without their `\n`. Any trailing partial line
    /// stays buffered.
    pub fn drain_lines(&mut self) -> Vec<Bytes> {
        let mut lines = Vec::new();

        loop {
            let unscanned = self.buf.get(self.scanned..).unwrap_or_default();
            let Some(offset) = unscanned.iter().position(|b| *b == NEWLINE) else {
                break;
            };

            let end = self.scanned + offset;
            let mut line = self.buf.split_to(end + 1);
            line.truncate(end);
            lines.push(line.freeze());
            self.scanned = 0;
        }

        self.scanned = self.buf.len();
        lines
    }

    /// Bytes of the unterminated tail.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops any buffered partial line.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Decodes a line as UTF-8, substituting invalid sequences.
    pub fn decode_text(line: &[u8]) -> Cow<'_, str> {
        String::from_utf8_lossy(line)
    }
}
