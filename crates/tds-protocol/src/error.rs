//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
///
/// Every variant except [`ProtocolError::UnsupportedFeature`] means the byte
/// stream can no longer be trusted: callers must treat the connection as
/// desynchronized and close it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The buffer ended before a complete structure was read.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// A length-prefixed structure declared more bytes than are available.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes the structure declared.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Unknown packet type byte in a packet header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown bits set in a packet header status byte.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Unknown token id in a response stream.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Unknown data type tag in type info.
    #[error("unknown data type: 0x{0:02X}")]
    UnknownType(u8),

    /// A known structure carried an internally inconsistent length.
    #[error("invalid length for {context}: {length}")]
    InvalidLength {
        /// Structure being decoded.
        context: &'static str,
        /// Offending length.
        length: usize,
    },

    /// A field carried a value outside its domain.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
    },

    /// A token that depends on column metadata arrived without any.
    #[error("{0} token received before COLMETADATA")]
    MissingMetadata(&'static str),

    /// Bytes that should be UTF-16LE (or another text encoding) were not.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// Unknown PRELOGIN option tag.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// A value cannot be expressed by this protocol version.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl ProtocolError {
    /// Whether this error leaves the byte stream in an unknown position.
    #[must_use]
    pub fn is_desync(&self) -> bool {
        !matches!(self, Self::UnsupportedFeature(_))
    }
}
