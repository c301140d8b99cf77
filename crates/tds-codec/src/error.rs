//! Transport error types.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the packet transport.
///
/// Every variant is fatal to the session: once one is returned the byte
/// stream can no longer be trusted to be aligned on a packet boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Socket or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet header that fails validation.
    #[error("invalid packet header: {0}")]
    InvalidHeader(ProtocolError),

    /// A packet longer than the transport accepts.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Declared or encoded size.
        size: usize,
        /// Largest allowed size.
        max: usize,
    },

    /// The peer closed the stream, possibly in the middle of a packet.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Wire format error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CodecError {
    /// Returns true if the peer hung up.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
