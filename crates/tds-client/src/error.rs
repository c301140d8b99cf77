//! Client error types.

use tds_codec::CodecError;
use tds_protocol::ProtocolError;
use tds_tls::TlsError;
use tds_types::TypeError;
use thiserror::Error;

use crate::diagnostics::DiagnosticChain;

/// Errors that can occur during client operations.
///
/// Every variant maps to a SQLSTATE through [`Error::sqlstate`]. Whether the
/// connection survives the error is reported by [`Error::is_fatal`].
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or connection string.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error on the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet transport failure.
    #[error("transport error: {0}")]
    Codec(CodecError),

    /// The server sent something the reader cannot make sense of.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A parameter value could not be encoded.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting or logging in took too long.
    #[error("connection timed out")]
    ConnectTimeout,

    /// The server did not start answering within the command timeout.
    #[error("command timed out")]
    Timeout,

    /// Login was rejected or not acknowledged.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// The operation is not valid in the session's current state.
    #[error("function sequence error: {0}")]
    Sequence(&'static str),

    /// Bound parameters do not match the request.
    #[error("parameter mismatch: {0}")]
    Parameters(String),

    /// A value exceeded the configured size limit while decoding.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Errors reported by the server, in arrival order.
    #[error("{0}")]
    Server(DiagnosticChain),
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ConnectionClosed => Self::ConnectionClosed,
            CodecError::Io(io) => Self::Io(io),
            CodecError::Protocol(p) => Self::Protocol(p),
            other => Self::Codec(other),
        }
    }
}

impl Error {
    /// SQLSTATE for this error.
    ///
    /// Transport, protocol and TLS faults are class `08`; server errors use
    /// the state of the first error record.
    #[must_use]
    pub fn sqlstate(&self) -> &str {
        match self {
            Self::Config(_) => "HY000",
            Self::Io(_) | Self::Codec(_) | Self::Protocol(_) | Self::Tls(_) => "08S01",
            Self::Type(_) => "22018",
            Self::ConnectionClosed => "08003",
            Self::ConnectTimeout => "08001",
            Self::Timeout => "HYT00",
            Self::LoginFailed(_) => "28000",
            Self::Sequence(_) => "HY010",
            Self::Parameters(_) => "07002",
            Self::ResourceExhausted(_) => "HY001",
            Self::Server(chain) => chain.sqlstate(),
        }
    }

    /// Check if the connection must be treated as unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Codec(_)
            | Self::Protocol(_)
            | Self::Tls(_)
            | Self::ConnectionClosed
            | Self::ConnectTimeout
            | Self::LoginFailed(_)
            | Self::ResourceExhausted(_) => true,
            Self::Server(chain) => chain.is_fatal(),
            Self::Config(_)
            | Self::Type(_)
            | Self::Timeout
            | Self::Sequence(_)
            | Self::Parameters(_) => false,
        }
    }

    /// Check if this error reports a cancelled request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Server(chain) if chain.is_cancelled())
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server(chain) if chain.errors().any(|d| d.number == number))
    }

    /// Get the severity of the first server error, if any.
    ///
    /// Classes 0-9 are informational, 11-16 user errors, 17-19 resource
    /// errors and 20-25 terminate the connection.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server(chain) => chain.first_error().map(|d| d.class),
            _ => None,
        }
    }

    /// The diagnostic records carried by a server error.
    #[must_use]
    pub fn diagnostics(&self) -> Option<&DiagnosticChain> {
        match self {
            Self::Server(chain) => Some(chain),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
