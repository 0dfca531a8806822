//! Wire format encoding and decoding.
//!
//! Implements the 5-byte frame header:
//! ```text
//! ┌────────────┬────────────────┬────────────────┐
//! │ Magic      │ Payload length │ Payload        │
//! │ 1 byte     │ 4 bytes        │ length bytes   │
//! │ 0xCE       │ uint32 BE      │                │
//! └────────────┴────────────────┴────────────────┘
//! ```
//!
//! The length field is Big Endian and always equals the exact byte count
//! of the payload that follows.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StatewireError};

/// Magic byte opening every frame.
pub const MAGIC_BYTE: u8 = 0xCE;

/// Header size in bytes (magic + length, fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 67_108_864;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Encode header to bytes (magic byte + Big Endian length).
    ///
    /// # Example
    ///
    /// ```
    /// use statewire::protocol::FrameHeader;
    ///
    /// let header = FrameHeader::new(11);
    /// assert_eq!(header.encode(), [0xCE, 0x00, 0x00, 0x00, 0x0B]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = MAGIC_BYTE;
        buf[1..5].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from the front of a buffer.
    ///
    /// Returns `Ok(None)` if the buffer holds fewer than `HEADER_SIZE`
    /// bytes. Fails with [`StatewireError::BadMagicByte`] if the first
    /// byte is not the magic byte; a stream in that condition cannot be
    /// resynchronized.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        if buf[0] != MAGIC_BYTE {
            return Err(StatewireError::BadMagicByte { found: buf[0] });
        }
        Ok(Some(Self {
            payload_length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        }))
    }

    /// Validate the declared payload length against a cap.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(StatewireError::FrameTooLarge {
                declared: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(())
    }
}

/// Encode one payload into a self-delimiting frame.
///
/// Fails with [`StatewireError::PayloadTooLarge`] before producing any
/// bytes if the payload does not fit the 4-byte length field.
///
/// # Example
///
/// ```
/// use statewire::protocol::encode_frame;
///
/// let frame = encode_frame(b"hello world").unwrap();
/// assert_eq!(frame[0], 0xCE);
/// assert_eq!(&frame[1..5], &[0x00, 0x00, 0x00, 0x0B]);
/// assert_eq!(&frame[5..], b"hello world");
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let length = u32::try_from(payload.len())
        .map_err(|_| StatewireError::PayloadTooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_u32(length);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}
