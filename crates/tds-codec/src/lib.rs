//! # tds-codec
//!
//! Async packet transport for the TDS protocol.
//!
//! This crate turns a byte stream into TDS packets and back: framing across
//! TCP segment boundaries, splitting requests into packets of the negotiated
//! size, and reassembling multi-packet messages.
//!
//! ## Architecture
//!
//! ```text
//! Byte stream → TdsCodec (packet framing) → Connection → session reader
//! ```
//!
//! ### Cancellation
//!
//! [`Connection`] splits the transport into read and write halves. A
//! [`CancelHandle`] shares the write half behind a mutex, so a cancel packet
//! can be written from another task while the owner is blocked in a read,
//! without ever interleaving with a request that is being written.
//!
//! ```rust,ignore
//! use tds_codec::Connection;
//!
//! let conn = Connection::new(tcp_stream, 4096);
//! let cancel = conn.cancel_handle();
//!
//! tokio::spawn(async move {
//!     cancel.cancel().await?;
//! });
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod framed;
pub mod message;
pub mod packet_codec;

pub use connection::{CancelHandle, Connection};
pub use error::CodecError;
pub use framed::{PacketReader, PacketStream, PacketWriter};
pub use message::{Message, MessageAssembler, split_message};
pub use packet_codec::{Packet, TdsCodec};
