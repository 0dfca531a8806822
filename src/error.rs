//! Error types for statewire.

use thiserror::Error;

/// Main error type for all statewire operations.
#[derive(Debug, Error)]
pub enum StatewireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// First byte of a frame was not the magic byte.
    #[error("Bad magic byte: expected 0xCE, found 0x{found:02X}")]
    BadMagicByte {
        /// The byte found where the magic byte was expected.
        found: u8,
    },

    /// Inbound frame declared a payload above the configured cap.
    #[error("Frame payload of {declared} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Payload length declared in the frame header.
        declared: u32,
        /// Configured maximum payload size.
        max: u32,
    },

    /// Outbound payload does not fit the 4-byte length field.
    #[error("Payload of {0} bytes does not fit the frame length field")]
    PayloadTooLarge(usize),

    /// Decode buffer was poisoned by an earlier corruption error.
    #[error("Stream is corrupt; no further frames can be decoded")]
    StreamCorrupt,

    /// Send attempted while the session is not ready.
    #[error("Session is not ready")]
    NotReady,

    /// Start attempted while the session is already connecting or ready.
    #[error("Session already started")]
    AlreadyStarted,

    /// Session (or one of its tasks) has shut down.
    #[error("Session closed")]
    SessionClosed,

    /// Session entered the failed state.
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// Connect did not complete within the configured timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// A single write did not complete within the configured timeout.
    #[error("Write timed out")]
    WriteTimeout,

    /// Discovery stopped producing endpoints before one was found.
    #[error("Discovery ended without finding a peer")]
    DiscoveryEnded,
}

/// Result type alias using StatewireError.
pub type Result<T> = std::result::Result<T, StatewireError>;
