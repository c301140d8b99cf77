//! Protocol-level error types.

use tds_types::TypeError;
use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
///
/// Apart from [`ProtocolError::Incomplete`], every variant means the
/// client and server disagree about the stream. The session cannot recover
/// from such an error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet type byte not in the allow-list.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Packet status byte with unknown bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Declared packet length outside the valid range.
    #[error("invalid packet length {length} (allowed {min}..={max})")]
    InvalidPacketLength {
        /// Declared length.
        length: usize,
        /// Smallest valid length.
        min: usize,
        /// Largest valid length.
        max: usize,
    },

    /// Not enough bytes for a complete packet header.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes expected.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// More input is needed to finish decoding the current structure.
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete {
        /// Bytes still missing, as far as known.
        needed: usize,
    },

    /// Token tag the reader does not handle.
    #[error("unsupported token 0x{0:02X}")]
    UnsupportedToken(u8),

    /// A structure whose content contradicts its declared layout.
    #[error("malformed {context}: {reason}")]
    Malformed {
        /// What was being decoded.
        context: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// String that cannot be represented in the wire encoding.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// A field too long for its length prefix.
    #[error("{field} too long: {len} (max {max})")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Largest allowed length.
        max: usize,
    },

    /// Operation not available in the negotiated protocol version.
    #[error("{0} is not supported by this TDS version")]
    UnsupportedByVersion(&'static str),

    /// Placeholder count differs from the number of bound values.
    #[error("SQL text has {placeholders} parameter markers but {values} values were bound")]
    ParameterCount {
        /// Markers found in the SQL text.
        placeholders: usize,
        /// Values supplied.
        values: usize,
    },

    /// Type codec failure.
    #[error(transparent)]
    Type(TypeError),
}

impl ProtocolError {
    /// Returns true if more input would let the decode succeed.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    pub(crate) fn malformed(context: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            context,
            reason: reason.into(),
        }
    }
}

impl From<TypeError> for ProtocolError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::BufferTooSmall {
                needed, available, ..
            } => Self::Incomplete {
                needed: needed.saturating_sub(available),
            },
            other => Self::Type(other),
        }
    }
}
