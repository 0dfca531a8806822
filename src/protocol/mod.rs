//! Protocol module - frame layout and streaming decode.
//!
//! This module implements the binary framing for the wire:
//! - 5-byte header (magic byte + Big Endian payload length)
//! - Frame encoding for outbound payloads
//! - Frame buffer for reassembling payloads from partial reads

mod frame_buffer;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    encode_frame, FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC_BYTE,
};
