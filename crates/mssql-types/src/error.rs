//! Type conversion error types.

use thiserror::Error;

/// Errors that can occur while converting values to or from the wire.
///
/// None of these poison a connection: encoding errors are raised before any
/// byte is written, decoding errors after the value's full length was read.
#[derive(Debug, Error)]
pub enum TypeError {
    /// Value is null when non-null was expected.
    #[error("unexpected null value")]
    UnexpectedNull,

    /// Type mismatch during conversion.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        actual: String,
    },

    /// Value is out of range for target type.
    #[error("value out of range for {target_type}")]
    OutOfRange {
        /// Target type name.
        target_type: &'static str,
    },

    /// Invalid encoding in string data.
    #[error("invalid string encoding: {0}")]
    InvalidEncoding(String),

    /// Invalid binary data.
    #[error("invalid binary data: {0}")]
    InvalidBinary(String),

    /// Invalid date/time value.
    #[error("invalid date/time: {0}")]
    InvalidDateTime(String),

    /// Invalid decimal value.
    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),

    /// A string could not be parsed as a money amount.
    #[error("invalid money value: {0:?}")]
    InvalidMoney(String),

    /// Vector buffer shorter than its 8-byte header.
    #[error("vector data too short for header: {0} bytes")]
    VectorTruncated(usize),

    /// Vector header magic byte is wrong.
    #[error("invalid vector magic byte: got 0x{0:02X}, expected 0xA9")]
    InvalidVectorMagic(u8),

    /// Vector header version byte is wrong.
    #[error("unsupported vector version: got 0x{0:02X}, expected 0x01")]
    InvalidVectorVersion(u8),

    /// Vector element type byte is unknown.
    #[error("unsupported vector element type: 0x{0:02X}")]
    InvalidVectorElementType(u8),

    /// Vector payload shorter than the header declares.
    #[error("vector data size mismatch: got {actual} bytes, expected {expected}")]
    VectorSizeMismatch {
        /// Bytes required by the header.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },

    /// Vector has more elements than the wire format allows.
    #[error("vector dimensions {dimensions} exceeds maximum {max} for {element_type}")]
    TooManyDimensions {
        /// Requested dimension count.
        dimensions: usize,
        /// Limit for the element type.
        max: usize,
        /// Element type name.
        element_type: &'static str,
    },

    /// Infinite value cannot be represented in JSON.
    #[error("vector element {index} is not finite and cannot be sent as JSON")]
    NonFiniteJson {
        /// Index of the offending element.
        index: usize,
    },

    /// JSON text could not be parsed.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Invalid UUID value.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// Unsupported type conversion.
    #[error("unsupported conversion from {from} to {to}")]
    UnsupportedConversion {
        /// Source type.
        from: String,
        /// Target type.
        to: &'static str,
    },

    /// Value is longer than the column it is written to.
    #[error("value of {length} bytes exceeds column maximum of {max} bytes")]
    ValueTooLong {
        /// Encoded length.
        length: usize,
        /// Column maximum length.
        max: usize,
    },

    /// Buffer too small for value.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
}

/// Fail with [`TypeError::BufferTooSmall`] unless `data` holds exactly `n` bytes.
pub(crate) fn expect_len(data: &[u8], n: usize) -> Result<(), TypeError> {
    if data.len() == n {
        Ok(())
    } else {
        Err(TypeError::BufferTooSmall {
            needed: n,
            available: data.len(),
        })
    }
}
