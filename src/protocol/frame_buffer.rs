//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 5 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//! - `Corrupt`: A magic-byte violation poisoned the stream
//!
//! A frame is indivisible: its payload is never surfaced until every
//! declared byte has arrived. A corrupt buffer stays corrupt; a
//! length-prefixed stream cannot be safely re-entered mid-flow, so each
//! new connection gets a fresh buffer.
//!
//! # Example
//!
//! ```
//! use statewire::protocol::{encode_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let frame = encode_frame(b"hi").unwrap();
//!
//! // Data arrives in arbitrary chunks from the socket
//! let payloads = buffer.push(&frame).unwrap();
//! assert_eq!(payloads[0].as_ref(), b"hi");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::{Result, StatewireError};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete header (need 5 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for the payload bytes.
    WaitingForPayload { expected: u32 },
    /// Poisoned by a protocol violation. Terminal.
    Corrupt,
}

/// Buffer for accumulating incoming bytes and extracting complete payloads.
///
/// Exactly one frame is in progress at a time. All data is stored in a
/// single `BytesMut` buffer to minimize allocations; payloads are split
/// out without copying.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with a custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete payloads.
    ///
    /// This is the main API for processing incoming data from the socket.
    /// If data is fragmented, partial data is buffered internally for the
    /// next push; payloads are returned in arrival order.
    ///
    /// # Errors
    ///
    /// Fails if the first byte of a frame is not the magic byte, if a
    /// declared payload exceeds the cap, or on any push after such a
    /// violation. All of these poison the buffer.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        if matches!(self.state, State::Corrupt) {
            return Err(StatewireError::StreamCorrupt);
        }

        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();

        // Extract as many complete frames as possible
        loop {
            match self.try_extract_one() {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => break,
                Err(e) => {
                    self.state = State::Corrupt;
                    return Err(e);
                }
            }
        }

        Ok(payloads)
    }

    /// Try to extract a single payload from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForHeader => {
                let header = match FrameHeader::decode(&self.buffer)? {
                    Some(header) => header,
                    None => return Ok(None),
                };

                header.validate(self.max_payload_size)?;

                // Consume header bytes
                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.payload_length == 0 {
                    // Empty payload, frame is complete
                    return Ok(Some(Bytes::new()));
                }

                // Transition to waiting for payload
                self.state = State::WaitingForPayload {
                    expected: header.payload_length,
                };

                // Try to get the payload immediately
                self.try_extract_one()
            }

            State::WaitingForPayload { expected } => {
                let expected = expected as usize;

                if self.buffer.len() < expected {
                    return Ok(None);
                }

                // Extract payload (zero-copy freeze)
                let payload = self.buffer.split_to(expected).freeze();

                // Reset state for the next frame
                self.state = State::WaitingForHeader;

                Ok(Some(payload))
            }

            State::Corrupt => Err(StatewireError::StreamCorrupt),
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if the buffer has been poisoned by a protocol violation.
    pub fn is_corrupt(&self) -> bool {
        matches!(self.state, State::Corrupt)
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::Corrupt => "Corrupt",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
