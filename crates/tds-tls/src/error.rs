//! TLS-related error types.

use thiserror::Error;

/// Errors that can occur while setting up or running TLS.
#[derive(Debug, Error)]
pub enum TlsError {
    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Server name unusable for SNI and verification.
    #[error("invalid server name for TLS: {0}")]
    InvalidServerName(String),

    /// Invalid certificate or certificate file.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// IO error during TLS operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rustls error.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// Client requires encryption but the server cannot provide it.
    #[error("server does not support encryption")]
    EncryptionNotSupported,
}
