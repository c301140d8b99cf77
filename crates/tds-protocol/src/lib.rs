//! # tds-protocol
//!
//! Wire formats of the Tabular Data Stream protocol spoken by Microsoft SQL
//! Server and Sybase, for protocol versions 4.2, 5.0, 7.0 and 7.1.
//!
//! This crate is IO-agnostic. It contains no networking logic and makes no
//! assumptions about the async runtime; `tds-codec` and `tds-client` build
//! the transport and session on top of it.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(PacketType::Query, PacketStatus::END_OF_MESSAGE, 100);
//! assert_eq!(header.payload_length(), 92);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod login;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod sql_batch;
pub mod token;
pub mod version;

pub use error::ProtocolError;
pub use login::Login;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use prelogin::{
    Encryption, EncryptionLevel, PreLogin, PreLoginResponse, negotiate_encryption, validate_options,
};
pub use rpc::{ProcId, RpcOptionFlags, RpcRequest};
pub use sql_batch::{SqlBatch, encode_sql_batch, substitute_params};
pub use token::{
    ColMetaData, ColumnData, ColumnFlags, ColumnInfo, Done, DoneStatus, EnvChange, LoginAck,
    ReturnValue, ServerMessage, TableName, Token, TokenContext, TokenType, decode_token,
};
pub use version::TdsVersion;
