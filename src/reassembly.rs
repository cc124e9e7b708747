//! Reassembly of fragmented telemetry notifications.
//!
//! Every data notification starts with a one-byte transport sequence marker
//! followed by a slice of the activity stream:
//!
//! ```text
//! Chunk 1: [seq] payload part 1
//! Chunk 2: [seq] payload part 2
//! Chunk N: [seq] payload part N
//! ```
//!
//! Chunks are kept exactly as received and only concatenated once the
//! session finalizes.

use bytes::{Bytes, BytesMut};

use crate::types::{FrameKind, RawChunk};

/// Concatenate the payloads of all data frames in arrival order
///
/// The first byte of each data frame is dropped; control frames contribute
/// nothing.
#[must_use]
pub fn reassemble(chunks: &[RawChunk]) -> Bytes {
    let total = payload_len(chunks);
    let mut buffer = BytesMut::with_capacity(total);
    for chunk in chunks.iter().filter(|c| c.kind == FrameKind::Data) {
        if let Some(payload) = chunk.bytes.get(1..) {
            buffer.extend_from_slice(payload);
        }
    }
    buffer.freeze()
}

fn payload_len(chunks: &[RawChunk]) -> usize {
    chunks
        .iter()
        .filter(|c| c.kind == FrameKind::Data)
        .map(|c| c.bytes.len().saturating_sub(1))
        .sum()
}

/// Ordered chunk store owned by one fetch session
#[derive(Debug, Default)]
pub struct FrameReassembler {
    chunks: Vec<RawChunk>,
    bytes_received: usize,
}

impl FrameReassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one chunk
    pub fn push(&mut self, chunk: RawChunk) {
        if chunk.kind == FrameKind::Data {
            self.bytes_received += chunk.bytes.len();
        }
        self.chunks.push(chunk);
    }

    /// Raw data bytes received, framing included
    #[must_use]
    pub const fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Number of stored chunks
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drop everything and start over
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.bytes_received = 0;
    }

    /// Build the reassembled buffer
    #[must_use]
    pub fn finish(&self) -> Bytes {
        reassemble(&self.chunks)
    }
}
