//! Type codec error types.

use thiserror::Error;

/// Errors that can occur while decoding or encoding typed values.
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

    /// Invalid binary data for the declared type.
    #[error("invalid binary data: {0}")]
    InvalidBinary(String),

    /// Invalid date/time value.
    #[error("invalid date/time: {0}")]
    InvalidDateTime(String),

    /// The wire type code is not one this codec understands.
    #[error("unsupported wire type 0x{0:02X}")]
    UnsupportedType(u8),

    /// The value cannot be sent with the negotiated protocol version.
    #[error("unsupported conversion from {from} to {to}")]
    UnsupportedConversion {
        /// Source type.
        from: String,
        /// Target type.
        to: &'static str,
    },

    /// Buffer does not hold the declared number of bytes.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// A declared value length exceeds the configured decode limit.
    #[error("value of {declared} bytes exceeds the {limit} byte limit")]
    ValueTooLarge {
        /// Length declared on the wire.
        declared: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl TypeError {
    /// Returns true if more input would let the decode succeed.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::BufferTooSmall { .. })
    }
}
