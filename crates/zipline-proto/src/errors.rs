//! Error types for frame encoding and decoding.

use thiserror::Error;

/// Convenience alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding frames.
///
/// Decoding never panics on hostile input; every malformed buffer maps to one
/// of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer ended before a complete packet could be read.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to make progress
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Length prefix is negative or longer than the allowed group count.
    #[error("malformed length prefix")]
    MalformedLength,

    /// Top-level node tag does not name a known frame.
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// A string field is not valid UTF-8.
    #[error("field `{field}` is not valid UTF-8")]
    InvalidUtf8 {
        /// Field that failed to decode
        field: &'static str,
    },

    /// A field decoded to a value outside its domain.
    #[error("invalid value for field `{field}`")]
    InvalidFieldValue {
        /// Field that failed to decode
        field: &'static str,
    },

    /// Encoded frame exceeds [`crate::MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded size in bytes
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Bytes remain after the top-level frame node.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// A primitive packet appeared where a node was required, or vice versa.
    #[error("unexpected packet {tag:#04x}, expected {expected}")]
    UnexpectedPacket {
        /// What the decoder was looking for
        expected: &'static str,
        /// Tag byte actually found
        tag: u8,
    },

    /// Metadata bytes are not a valid CBOR string map.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}
