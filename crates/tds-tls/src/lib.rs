//! # tds-tls
//!
//! TLS for TDS connections.
//!
//! Encryption is negotiated in the clear-text pre-login exchange. If either
//! side asks for it, the TLS handshake then runs inside pre-login packets:
//!
//! ```text
//! TCP Connect → PreLogin (clear) → TLS handshake (framed) → Login (encrypted)
//! ```
//!
//! With login-only encryption the session drops back to the raw stream
//! right after the login packet; otherwise every later byte is encrypted.
//!
//! ## Security
//!
//! Server certificates are validated against the Mozilla root store unless
//! a CA file or explicit roots are configured. `trust_server_certificate`
//! disables validation and logs a warning.
//!
//! ```rust,ignore
//! use tds_tls::{TlsConfig, TlsConnector};
//!
//! let connector = TlsConnector::new(TlsConfig::new().with_ca_file("ca.pem"))?;
//! let tls = connector.connect_prelogin(tcp, "db.example.com").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod prelogin_wrapper;

pub use config::{TlsConfig, TlsVersion};
pub use connector::TlsConnector;
pub use error::TlsError;
pub use prelogin_wrapper::{RecordType, TlsPreloginWrapper};

pub use tokio_rustls::client::TlsStream;
