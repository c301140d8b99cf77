//! # tds-client
//!
//! Async TDS client for SQL Server and Sybase ASE.
//!
//! A [`Client`] owns one connection and runs one request at a time. Each
//! response is consumed as a stream of [`Event`]s, or collected whole into a
//! [`Response`]. Server messages are kept in a [`DiagnosticChain`] and raised
//! as a single chained [`Error::Server`] once the response has been read.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_client::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tds_client::Error> {
//!     let config = Config::from_connection_string(
//!         "Server=localhost;Database=test;User Id=sa;Password=secret;",
//!     )?;
//!     let mut client = Client::connect(config).await?;
//!
//!     let response = client.query("SELECT 1").await?;
//!     println!("{:?}", response.scalar());
//!
//!     let batch = client
//!         .execute_batch(&["UPDATE t SET a = 1", "DELETE FROM u"])
//!         .await?;
//!     println!("{:?}", batch.counts);
//!
//!     client.close().await
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod reader;
pub mod response;
pub mod session;
pub mod transport;

pub use cancel::CancelHandle;
pub use client::Client;
pub use config::{Config, ServerType, SslMode, TimeoutConfig};
pub use diagnostics::{Diagnostic, DiagnosticChain, DiagnosticKind};
pub use error::{Error, Result};
pub use reader::TokenReader;
pub use response::{BatchResult, EXECUTE_FAILED, NO_COUNT, Response, ResultSet};
pub use session::{Completion, DoneKind, Event, OutputParam, Phase, SessionState};
pub use transport::Transport;

pub use tds_protocol::{Encryption, RpcRequest, TdsVersion};
pub use tds_types::{ParamDescriptor, SqlValue};
