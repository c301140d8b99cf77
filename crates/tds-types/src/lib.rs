//! # tds-types
//!
//! Type codec for the TDS wire protocol.
//!
//! This crate maps TDS wire type descriptors (fixed, one-byte-length,
//! two-byte-length and text-pointer types, with collation, precision and
//! scale) to and from [`SqlValue`].
//!
//! ## Type Mappings
//!
//! | Wire type | `SqlValue` |
//! |-----------|------------|
//! | `BIT`, `BITN` | `Bool` |
//! | `INT1`..`INT8`, `INTN` | `TinyInt` .. `BigInt` |
//! | `FLT4`, `FLT8`, `FLTN` | `Float`, `Double` |
//! | `DECIMAL`, `NUMERIC`, `MONEY` | `Decimal` |
//! | `CHAR`, `VARCHAR`, `TEXT` | `String` (code page from collation or charset) |
//! | `NCHAR`, `NVARCHAR`, `NTEXT` | `String` (UTF-16) |
//! | `BINARY`, `VARBINARY`, `IMAGE` | `Binary` |
//! | `DATETIME`, `DATETIME4` | `DateTime` |
//! | `UNIQUEIDENTIFIER` | `Uuid` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod collation;
pub mod column;
pub mod decode;
pub mod encode;
pub mod error;
mod literal;
pub mod param;
pub mod type_id;
pub mod value;

pub use collation::{Collation, encoding_for_charset};
pub use column::{CodecOptions, ColumnType, DEFAULT_MAX_VALUE_SIZE, decode_column_type};
pub use decode::{decode_utf16, decode_value};
pub use encode::{encode_type, encode_value, resolve_param_type};
pub use error::TypeError;
pub use param::{ParamDescriptor, ParamDirection};
pub use type_id::{LengthFamily, TypeId};
pub use value::SqlValue;
