//! Error types for the wire protocol.
//!
//! Decoding failures are reported through [`ProtocolError`]; they are
//! recoverable at the connection level (the offending connection is closed)
//! and never unwind across task boundaries.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Errors raised while framing, decoding or decompressing packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value needed more bytes than the buffer holds.
    #[error("truncated data: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the value being decoded.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A frame announced a size smaller than the fixed packet header.
    #[error("frame of {size} bytes is shorter than the packet header")]
    FrameTooShort {
        /// The announced frame size.
        size: u64,
    },

    /// A frame announced a size beyond the configured limit.
    #[error("frame of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge {
        /// The announced frame size.
        size: u64,
        /// The codec limit.
        limit: usize,
    },

    /// The packet type field does not name a known packet family.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),

    /// The command does not match the packet being decoded.
    #[error("unexpected command {command} for packet type {packet_type}")]
    UnexpectedCommand {
        /// The packet type from the header.
        packet_type: u32,
        /// The command from the header.
        command: u32,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A value outside the range of its enumeration.
    #[error("invalid {field} value {value}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// The offending raw value.
        value: u64,
    },

    /// No compressor is registered under this name.
    #[error("unknown compressor {0:#x}")]
    UnknownCompressor(u32),

    /// A compressor failed to restore its input.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

impl ProtocolError {
    /// Stable short code, used as a metrics label.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Truncated { .. } => "truncated",
            Self::FrameTooShort { .. } => "frame_too_short",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::UnknownPacketType(_) => "unknown_packet_type",
            Self::UnexpectedCommand { .. } => "unexpected_command",
            Self::InvalidUtf8(_) => "invalid_utf8",
            Self::InvalidValue { .. } => "invalid_value",
            Self::UnknownCompressor(_) => "unknown_compressor",
            Self::Decompress(_) => "decompress",
        }
    }

    /// Whether the error leaves the byte stream in an unknown state.
    ///
    /// Framing errors desynchronize the stream and require closing the
    /// connection; body errors only spoil one packet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::FrameTooShort { .. } | Self::FrameTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = ProtocolError::Truncated {
            needed: 8,
            available: 3,
        };
        assert_eq!(err.error_code(), "truncated");
        assert_eq!(
            err.to_string(),
            "truncated data: needed 8 bytes, 3 available"
        );
        assert_eq!(ProtocolError::UnknownCompressor(3).error_code(), "unknown_compressor");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::FrameTooShort { size: 4 }.is_fatal());
        assert!(
            ProtocolError::FrameTooLarge {
                size: 1 << 40,
                limit: 1 << 20
            }
            .is_fatal()
        );
        assert!(!ProtocolError::UnknownPacketType(99).is_fatal());
    }
}
