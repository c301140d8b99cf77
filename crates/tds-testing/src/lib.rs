//! # tds-testing
//!
//! Test infrastructure for TDS client development.
//!
//! - A scripted mock TDS server for tests that need no database
//! - A token writer for building server responses byte-exactly
//! - Canned conversations for batches, procedure calls and fatal errors
//! - SQL Server and Sybase containers via testcontainers
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockColumn, MockResponse, MockTdsServer};
//! use tds_types::SqlValue;
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockTdsServer::builder()
//!         .with_response(
//!             "SELECT id, name FROM users",
//!             MockResponse::rows(
//!                 vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!                 vec![vec![SqlValue::Int(1), SqlValue::from("Alice")]],
//!             ),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect your client to server.addr()
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod container;
pub mod fixtures;
pub mod mock_server;

pub use container::{ServerKind, TdsServerContainer};
pub use fixtures::Statement;
pub use mock_server::{
    MockColumn, MockResponse, MockServerBuilder, MockServerConfig, MockServerError, MockTdsServer,
    ReceivedRequest, TokenWriter,
};
