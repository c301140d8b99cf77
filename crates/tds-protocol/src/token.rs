//! TDS token stream definitions.
//!
//! Tokens are the fundamental units of TDS response data. The server sends
//! a stream of tokens that describe metadata, rows, errors, and other information.
//!
//! ## Token Structure
//!
//! Each token begins with a 1-byte token type identifier, followed by
//! token-specific data. Some tokens have fixed lengths, while others
//! have length prefixes. Length-prefixed tokens are always consumed to their
//! declared end, even when trailing bytes are not understood.
//!
//! Decoding is a pure function of the bytes and a [`TokenContext`]; folding
//! tokens into session state is left to the caller.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tds_protocol::token::{decode_token, Token, TokenContext};
//!
//! let mut cursor: &[u8] = &payload;
//! let token = decode_token(&mut cursor, &ctx)?;
//! if let Token::Done(done) = token {
//!     println!("Rows affected: {}", done.row_count);
//! }
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use tds_types::{
    CodecOptions, Collation, ColumnType, SqlValue, TypeError, collation::COLLATION_LEN,
    decode_column_type, decode_value,
};

use crate::codec::{need, read_b_varchar, read_us_varchar};
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Token type identifier.
///
/// Only tags listed here are decoded. Compute-result tags (0x88, 0xA7, 0xA8,
/// 0xD3) and anything else are rejected. Tags 0xA0 through 0xEE other than
/// the TDS 7 ones belong to TDS 4.2 and 5.0 replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Offsets (OFFSET).
    Offsets = 0x78,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Procedure id (PROCID).
    ProcId = 0x7C,
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Table name (TABNAME).
    TabName = 0xA4,
    /// Column info (COLINFO).
    ColInfo = 0xA5,
    /// Order (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Control (CONTROL).
    Control = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Column names (COLNAME, TDS 4.2).
    ColName = 0xA0,
    /// Column formats (COLFMT, TDS 4.2).
    ColFmt = 0xA1,
    /// Protocol capabilities (CAPABILITY, TDS 5.0).
    Capability = 0xE2,
    /// Extended error (EED, TDS 5.0).
    Eed = 0xE5,
    /// Result metadata (ROWFMT, TDS 5.0).
    RowFmt = 0xEE,
    /// Wide result metadata (ROWFMT2, TDS 5.0).
    RowFmt2 = 0x61,
    /// Output parameter formats (PARAMFMT, TDS 5.0).
    ParamFmt = 0xEC,
    /// Wide output parameter formats (PARAMFMT2, TDS 5.0).
    ParamFmt2 = 0x20,
    /// Output parameter values (PARAMS, TDS 5.0).
    Params = 0xD7,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x78 => Some(Self::Offsets),
            0x79 => Some(Self::ReturnStatus),
            0x7C => Some(Self::ProcId),
            0x81 => Some(Self::ColMetaData),
            0xA4 => Some(Self::TabName),
            0xA5 => Some(Self::ColInfo),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAC => Some(Self::ReturnValue),
            0xAD => Some(Self::LoginAck),
            0xAE => Some(Self::Control),
            0xD1 => Some(Self::Row),
            0xE3 => Some(Self::EnvChange),
            0xA0 => Some(Self::ColName),
            0xA1 => Some(Self::ColFmt),
            0xE2 => Some(Self::Capability),
            0xE5 => Some(Self::Eed),
            0xEE => Some(Self::RowFmt),
            0x61 => Some(Self::RowFmt2),
            0xEC => Some(Self::ParamFmt),
            0x20 => Some(Self::ParamFmt2),
            0xD7 => Some(Self::Params),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }

    /// Tokens that may sit between result metadata and the first row and
    /// carry nothing a caller of the row stream needs.
    #[must_use]
    pub const fn is_metadata_trailer(self) -> bool {
        matches!(self, Self::TabName | Self::ColInfo | Self::Control)
    }
}

/// Parsed TDS token.
#[derive(Debug, Clone)]
pub enum Token {
    /// Column metadata describing result set structure.
    ColMetaData(ColMetaData),
    /// Metadata suppressed by the server (cursor fetch); previous columns remain.
    NoMetaData,
    /// One value per column of the current result.
    Row(Vec<SqlValue>),
    /// Completion of a SQL statement.
    Done(Done),
    /// Completion of a stored procedure.
    DoneProc(Done),
    /// Completion within a stored procedure.
    DoneInProc(Done),
    /// Return status from stored procedure.
    ReturnStatus(i32),
    /// Output parameter or function return value.
    ReturnValue(ReturnValue),
    /// Error message from server.
    Error(ServerMessage),
    /// Informational message from server.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Base tables of a browse-mode result.
    TabName(Vec<TableName>),
    /// Per-column base table and name of a browse-mode result.
    ColInfo(Vec<ColumnInfo>),
    /// Column ordering information.
    Order(Vec<u16>),
    /// Control record, content ignored.
    Control,
    /// Offsets record, content ignored.
    Offsets,
    /// Procedure id.
    ProcId(u64),
    /// Capability record, content ignored.
    Capability,
    /// Column names, completed by the [`Token::ColFmt`] that follows.
    ColName(Vec<String>),
    /// Column formats for the names of the preceding [`Token::ColName`].
    /// Names are left empty.
    ColFmt(Vec<ColumnData>),
    /// Formats of the output parameters a [`Token::Params`] carries.
    ParamFmt(Vec<ColumnData>),
    /// Output parameter values, one per entry of the last [`Token::ParamFmt`].
    Params(Vec<ReturnValue>),
}

/// State a token decoder depends on.
#[derive(Debug, Clone, Copy)]
pub struct TokenContext<'a> {
    /// Negotiated protocol version.
    pub version: TdsVersion,
    /// Type codec switches.
    pub opts: &'a CodecOptions,
    /// Columns of the current result, for row decoding.
    pub columns: &'a [ColumnData],
    /// Output parameter formats, for TDS 5.0 parameter values.
    pub params: &'a [ColumnData],
}

bitflags! {
    /// Column flags from result metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ColumnFlags: u16 {
        /// Column accepts NULL.
        const NULLABLE = 0x0001;
        /// Comparisons are case sensitive.
        const CASE_SENSITIVE = 0x0002;
        /// Column can be written.
        const WRITEABLE = 0x0008;
        /// Identity column.
        const IDENTITY = 0x0010;
    }
}

/// Column metadata token.
#[derive(Debug, Clone, Default)]
pub struct ColMetaData {
    /// Column definitions.
    pub columns: Vec<ColumnData>,
}

/// One column descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnData {
    /// Display name.
    pub name: String,
    /// User type id.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Wire type, with any collation already resolved to a charset.
    pub column_type: ColumnType,
    /// Base table, filled from browse-mode tokens.
    pub table: Option<TableName>,
    /// Base column name, filled from browse-mode tokens.
    pub base_name: Option<String>,
}

impl ColumnData {
    /// Check if the column accepts NULL.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }
}

bitflags! {
    /// Done token status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// Inside a transaction.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges a cancel.
        const ATTN = 0x0020;
        /// End of response, never sent by a server.
        const END = 0x0080;
    }
}

/// Done, DoneProc and DoneInProc payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Operation code of the completed statement.
    pub cur_cmd: u16,
    /// Row count, valid when [`DoneStatus::COUNT`] is set.
    pub row_count: i32,
}

impl Done {
    /// Size of the token in bytes (excluding token type byte).
    pub const SIZE: usize = 8;

    /// Operation code some servers report for DDL, whose count is not an
    /// update count.
    pub const DDL_OPERATION: u16 = 0xC1;

    /// The completion synthesized once a response has ended.
    #[must_use]
    pub const fn end_of_response() -> Self {
        Self {
            status: DoneStatus::END,
            cur_cmd: 0,
            row_count: 0,
        }
    }

    /// Decode the token body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        need(src, Self::SIZE)?;
        Ok(Self {
            status: DoneStatus::from_bits_retain(src.get_u16_le()),
            cur_cmd: src.get_u16_le(),
            row_count: src.get_i32_le(),
        })
    }

    /// Encode the token, tag included.
    pub fn encode(&self, token_type: TokenType, dst: &mut impl BufMut) {
        dst.put_u8(token_type as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_i32_le(self.row_count);
    }

    /// Check if more results follow this DONE token.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Check if an error occurred.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.contains(DoneStatus::ERROR)
    }

    /// Check if the row count is valid.
    #[must_use]
    pub const fn has_count(&self) -> bool {
        self.status.contains(DoneStatus::COUNT)
    }

    /// Check if this acknowledges a cancel.
    #[must_use]
    pub const fn is_attention(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }
}

/// Error or informational message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u16,
}

impl ServerMessage {
    fn decode(body: &mut Bytes, opts: &CodecOptions) -> Result<Self, ProtocolError> {
        need(body, 6)?;
        let number = body.get_i32_le();
        let state = body.get_u8();
        let class = body.get_u8();
        let message = read_us_varchar(body, opts)?;
        let server = read_b_varchar(body, opts)?;
        let procedure = read_b_varchar(body, opts)?;
        need(body, 2)?;
        let line = body.get_u16_le();
        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Check if this is a fatal error (severity >= 20).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

/// Login acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// SQL interface type.
    pub interface: u8,
    /// Negotiated protocol version.
    pub tds_version: TdsVersion,
    /// Server product name.
    pub program: String,
    /// Product major version.
    pub major: u8,
    /// Product minor version.
    pub minor: u8,
    /// Product build number.
    pub build: u16,
}

impl LoginAck {
    fn decode(body: &mut Bytes, opts: &CodecOptions) -> Result<Self, ProtocolError> {
        need(body, 5)?;
        let interface = body.get_u8();
        let tds_version = TdsVersion::from_login_ack(body.get_u32());
        let program = read_b_varchar(body, opts)?;
        need(body, 4)?;
        Ok(Self {
            interface,
            tds_version,
            program: program.trim_end_matches('\0').to_string(),
            major: body.get_u8(),
            minor: body.get_u8(),
            build: body.get_u16(),
        })
    }
}

/// Environment change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    /// Current database changed.
    Database {
        /// New database.
        new: String,
        /// Previous database.
        old: String,
    },
    /// Session language changed.
    Language {
        /// New language.
        new: String,
        /// Previous language.
        old: String,
    },
    /// Session charset changed.
    Charset {
        /// New charset name.
        new: String,
        /// Previous charset name.
        old: String,
    },
    /// Packet size changed.
    PacketSize {
        /// New packet size.
        new: usize,
        /// Previous packet size, if the server sent a parseable one.
        old: Option<usize>,
    },
    /// Unicode locale id changed.
    LocaleId {
        /// New locale id.
        new: String,
        /// Previous locale id.
        old: String,
    },
    /// Default collation changed.
    Collation(Collation),
    /// Sub-type not acted on; its bytes were skipped.
    Ignored(u8),
}

impl EnvChange {
    fn decode(body: &mut Bytes, opts: &CodecOptions) -> Result<Self, ProtocolError> {
        need(body, 1)?;
        let env_type = body.get_u8();
        let pair = |body: &mut Bytes| -> Result<(String, String), ProtocolError> {
            Ok((read_b_varchar(body, opts)?, read_b_varchar(body, opts)?))
        };

        let change = match env_type {
            1 => {
                let (new, old) = pair(body)?;
                Self::Database { new, old }
            }
            2 => {
                let (new, old) = pair(body)?;
                Self::Language { new, old }
            }
            3 => {
                let (new, old) = pair(body)?;
                Self::Charset { new, old }
            }
            4 => {
                let (new, old) = pair(body)?;
                let size = new.trim().parse::<usize>().map_err(|_| {
                    ProtocolError::malformed("packet size change", format!("'{new}'"))
                })?;
                Self::PacketSize {
                    new: size,
                    old: old.trim().parse().ok(),
                }
            }
            5 => {
                let (new, old) = pair(body)?;
                Self::LocaleId { new, old }
            }
            7 => {
                need(body, 1)?;
                let len = body.get_u8() as usize;
                need(body, len)?;
                if len == COLLATION_LEN {
                    let mut bytes = [0u8; COLLATION_LEN];
                    body.copy_to_slice(&mut bytes);
                    Self::Collation(Collation::from_bytes(bytes))
                } else {
                    Self::Ignored(env_type)
                }
            }
            other => Self::Ignored(other),
        };
        Ok(change)
    }
}

/// Output parameter or function return value.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    /// Parameter ordinal (TDS 7.x), record length (TDS 4.2/5.0) or position
    /// within a PARAMS token.
    pub ordinal: u16,
    /// Parameter name as sent by the server.
    pub name: String,
    /// Status byte.
    pub status: u8,
    /// User type id.
    pub user_type: u32,
    /// Wire type.
    pub column_type: ColumnType,
    /// Decoded value.
    pub value: SqlValue,
}

impl ReturnValue {
    /// Status marking a user-defined function return value.
    pub const STATUS_UDF: u8 = 0x02;

    fn decode<B: Buf>(src: &mut B, ctx: &TokenContext<'_>) -> Result<Self, ProtocolError> {
        need(src, 2)?;
        let ordinal = src.get_u16_le();
        let name = read_b_varchar(src, ctx.opts)?;
        need(src, 1)?;
        let status = src.get_u8();
        let user_type = if ctx.version.is_tds7() {
            need(src, 4)?;
            let user_type = u32::from(src.get_u16_le());
            src.advance(2); // flags
            user_type
        } else {
            need(src, 4)?;
            src.get_u32_le()
        };
        let column_type = decode_column_type(src, ctx.opts)?;
        let value = decode_value(src, &column_type, ctx.opts)?;
        Ok(Self {
            ordinal,
            name,
            status,
            user_type,
            column_type,
            value,
        })
    }

    /// Check if this is a user-defined function return value.
    #[must_use]
    pub const fn is_udf_return(&self) -> bool {
        self.status & Self::STATUS_UDF != 0
    }
}

/// Base table of a browse-mode result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableName {
    /// Catalog (database).
    pub catalog: Option<String>,
    /// Schema (owner).
    pub schema: Option<String>,
    /// Table.
    pub table: String,
}

impl TableName {
    /// Build from name parts, outermost first.
    #[must_use]
    pub fn from_parts(mut parts: Vec<String>) -> Self {
        let table = parts.pop().unwrap_or_default();
        let schema = parts.pop();
        let catalog = parts.pop();
        Self {
            catalog,
            schema,
            table,
        }
    }

    /// Split a dotted name. Names are not quoted, so a dot always separates.
    #[must_use]
    pub fn from_dotted(name: &str) -> Self {
        Self::from_parts(name.split('.').map(str::to_string).collect())
    }
}

/// Browse-mode column information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column number, starting at 1.
    pub column: u8,
    /// Table number in the preceding TABNAME token, 0 for expressions.
    pub table: u8,
    /// Status bits.
    pub status: u8,
    /// Base column name when it differs from the display name.
    pub base_name: Option<String>,
}

impl ColumnInfo {
    /// Status bit announcing a base column name.
    pub const STATUS_DIFFERENT_NAME: u8 = 0x20;
}

/// Peek at the tag of the next token without consuming it.
#[must_use]
pub fn peek_tag(src: &[u8]) -> Option<u8> {
    src.first().copied()
}

/// Decode one token.
///
/// On [`ProtocolError::Incomplete`] the source is left partly consumed; the
/// caller retries from its saved position once more bytes are buffered.
pub fn decode_token<B: Buf>(src: &mut B, ctx: &TokenContext<'_>) -> Result<Token, ProtocolError> {
    need(src, 1)?;
    let tag = src.get_u8();
    let token_type = TokenType::from_u8(tag).ok_or(ProtocolError::UnsupportedToken(tag))?;

    let token = match token_type {
        TokenType::Done => Token::Done(Done::decode(src)?),
        TokenType::DoneProc => Token::DoneProc(Done::decode(src)?),
        TokenType::DoneInProc => Token::DoneInProc(Done::decode(src)?),
        TokenType::ReturnStatus => {
            need(src, 4)?;
            Token::ReturnStatus(src.get_i32_le())
        }
        TokenType::ProcId => {
            need(src, 8)?;
            Token::ProcId(src.get_u64_le())
        }
        TokenType::Offsets => {
            need(src, 4)?;
            src.advance(4);
            Token::Offsets
        }
        TokenType::ColMetaData => decode_col_metadata(src, ctx)?,
        TokenType::Row => Token::Row(decode_row(src, ctx)?),
        TokenType::ReturnValue => Token::ReturnValue(ReturnValue::decode(src, ctx)?),
        TokenType::Error => {
            let mut body = record(src)?;
            Token::Error(within("error", ServerMessage::decode(&mut body, ctx.opts))?)
        }
        TokenType::Info => {
            let mut body = record(src)?;
            Token::Info(within("info", ServerMessage::decode(&mut body, ctx.opts))?)
        }
        TokenType::LoginAck => {
            let mut body = record(src)?;
            Token::LoginAck(within("login ack", LoginAck::decode(&mut body, ctx.opts))?)
        }
        TokenType::EnvChange => {
            let mut body = record(src)?;
            Token::EnvChange(within("env change", EnvChange::decode(&mut body, ctx.opts))?)
        }
        TokenType::TabName => {
            let mut body = record(src)?;
            Token::TabName(within("table name", decode_table_names(&mut body, ctx))?)
        }
        TokenType::ColInfo => {
            let mut body = record(src)?;
            Token::ColInfo(within("column info", decode_column_info(&mut body, ctx.opts))?)
        }
        TokenType::Order => {
            let mut body = record(src)?;
            let width = if ctx.version.is_tds7() { 2 } else { 1 };
            let mut columns = Vec::with_capacity(body.len() / width);
            while body.remaining() >= width {
                columns.push(if width == 2 {
                    body.get_u16_le()
                } else {
                    u16::from(body.get_u8())
                });
            }
            Token::Order(columns)
        }
        TokenType::Control => {
            record(src)?;
            Token::Control
        }
        TokenType::Capability => {
            record(src)?;
            Token::Capability
        }
        TokenType::ColName => {
            let mut body = record(src)?;
            let mut names = Vec::new();
            while body.has_remaining() {
                names.push(within("column name", read_b_varchar(&mut body, ctx.opts))?);
            }
            Token::ColName(names)
        }
        TokenType::ColFmt => {
            let mut body = record(src)?;
            Token::ColFmt(within("column format", decode_col_formats(&mut body, ctx.opts))?)
        }
        TokenType::RowFmt => {
            let mut body = record(src)?;
            let columns = within("row format", decode_formats(&mut body, ctx.opts, false))?;
            Token::ColMetaData(ColMetaData { columns })
        }
        TokenType::RowFmt2 => {
            let mut body = wide_record(src)?;
            let columns = within("row format", decode_formats(&mut body, ctx.opts, true))?;
            Token::ColMetaData(ColMetaData { columns })
        }
        TokenType::ParamFmt => {
            let mut body = record(src)?;
            Token::ParamFmt(within("param format", decode_formats(&mut body, ctx.opts, false))?)
        }
        TokenType::ParamFmt2 => {
            let mut body = wide_record(src)?;
            Token::ParamFmt(within("param format", decode_formats(&mut body, ctx.opts, true))?)
        }
        TokenType::Params => Token::Params(decode_params(src, ctx)?),
        TokenType::Eed => {
            let mut body = record(src)?;
            let message = within("extended error", decode_eed(&mut body, ctx.opts))?;
            if message.class > 10 {
                Token::Error(message)
            } else {
                Token::Info(message)
            }
        }
    };

    Ok(token)
}

/// Read a u16-length record into its own buffer.
fn record<B: Buf>(src: &mut B) -> Result<Bytes, ProtocolError> {
    need(src, 2)?;
    let len = src.get_u16_le() as usize;
    need(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Read a u32-length record into its own buffer.
fn wide_record<B: Buf>(src: &mut B) -> Result<Bytes, ProtocolError> {
    need(src, 4)?;
    let len = src.get_u32_le() as usize;
    need(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Running out of bytes inside a complete record means the record lied
/// about its length.
fn within<T>(
    context: &'static str,
    result: Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
    result.map_err(|err| {
        if err.is_incomplete() {
            ProtocolError::malformed(context, "fields overrun the declared length")
        } else {
            err
        }
    })
}

fn decode_col_metadata<B: Buf>(
    src: &mut B,
    ctx: &TokenContext<'_>,
) -> Result<Token, ProtocolError> {
    need(src, 2)?;
    // Any negative count means the metadata was suppressed.
    let Ok(count) = u16::try_from(src.get_i16_le()) else {
        return Ok(Token::NoMetaData);
    };

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        need(src, 4)?;
        let user_type = u32::from(src.get_u16_le());
        let flags = ColumnFlags::from_bits_truncate(src.get_u16_le());
        let column_type = decode_column_type(src, ctx.opts)?;
        let name = read_b_varchar(src, ctx.opts)?;
        columns.push(ColumnData {
            name,
            user_type,
            flags,
            column_type,
            table: None,
            base_name: None,
        });
    }

    Ok(Token::ColMetaData(ColMetaData { columns }))
}

/// COLFMT: user type, TDS 7 style flags and a type, repeated to the end of
/// the record.
fn decode_col_formats(
    body: &mut Bytes,
    opts: &CodecOptions,
) -> Result<Vec<ColumnData>, ProtocolError> {
    let mut columns = Vec::new();
    while body.has_remaining() {
        need(body, 4)?;
        let user_type = u32::from(body.get_u16_le());
        let flags = ColumnFlags::from_bits_truncate(body.get_u16_le());
        let column_type = decode_column_type(body, opts)?;
        columns.push(ColumnData {
            name: String::new(),
            user_type,
            flags,
            column_type,
            table: None,
            base_name: None,
        });
    }
    Ok(columns)
}

/// Map TDS 5.0 format status bits onto column flags.
fn format_flags(status: u32) -> ColumnFlags {
    let mut flags = ColumnFlags::empty();
    if status & 0x20 != 0 {
        flags |= ColumnFlags::NULLABLE;
    }
    if status & 0x10 != 0 {
        flags |= ColumnFlags::WRITEABLE;
    }
    if status & 0x40 != 0 {
        flags |= ColumnFlags::IDENTITY;
    }
    flags
}

/// ROWFMT, ROWFMT2, PARAMFMT and PARAMFMT2 bodies.
///
/// The wide forms carry label, catalog, schema, table and column names and
/// a four-byte status; the narrow forms carry one name and a status byte.
fn decode_formats(
    body: &mut Bytes,
    opts: &CodecOptions,
    wide: bool,
) -> Result<Vec<ColumnData>, ProtocolError> {
    need(body, 2)?;
    let count = body.get_u16_le() as usize;
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let label = read_b_varchar(body, opts)?;
        let (table, base_name, status) = if wide {
            let catalog = read_b_varchar(body, opts)?;
            let schema = read_b_varchar(body, opts)?;
            let table = read_b_varchar(body, opts)?;
            let column = read_b_varchar(body, opts)?;
            need(body, 4)?;
            let table = (!table.is_empty()).then(|| TableName {
                catalog: (!catalog.is_empty()).then_some(catalog),
                schema: (!schema.is_empty()).then_some(schema),
                table,
            });
            (table, (!column.is_empty()).then_some(column), body.get_u32_le())
        } else {
            need(body, 1)?;
            (None, None, u32::from(body.get_u8()))
        };
        need(body, 4)?;
        let user_type = body.get_u32_le();
        let column_type = decode_column_type(body, opts)?;
        // locale
        need(body, 1)?;
        let locale = body.get_u8() as usize;
        need(body, locale)?;
        body.advance(locale);

        let name = match (&base_name, label.is_empty()) {
            (Some(column), true) => column.clone(),
            _ => label,
        };
        columns.push(ColumnData {
            name,
            user_type,
            flags: format_flags(status),
            column_type,
            table,
            base_name,
        });
    }
    Ok(columns)
}

fn decode_params<B: Buf>(
    src: &mut B,
    ctx: &TokenContext<'_>,
) -> Result<Vec<ReturnValue>, ProtocolError> {
    if ctx.params.is_empty() {
        return Err(ProtocolError::malformed("params", "no parameter formats"));
    }
    ctx.params
        .iter()
        .enumerate()
        .map(|(i, param)| -> Result<ReturnValue, ProtocolError> {
            let value = decode_value(src, &param.column_type, ctx.opts)?;
            Ok(ReturnValue {
                ordinal: u16::try_from(i).unwrap_or(u16::MAX),
                name: param.name.clone(),
                status: 0,
                user_type: param.user_type,
                column_type: param.column_type.clone(),
                value,
            })
        })
        .collect()
}

/// EED: an error or message with SQLSTATE and transaction state, which are
/// dropped.
fn decode_eed(body: &mut Bytes, opts: &CodecOptions) -> Result<ServerMessage, ProtocolError> {
    need(body, 7)?;
    let number = body.get_i32_le();
    let state = body.get_u8();
    let class = body.get_u8();
    let sql_state = body.get_u8() as usize;
    need(body, sql_state + 3)?;
    body.advance(sql_state);
    body.advance(3); // status, transaction state
    let message = read_us_varchar(body, opts)?;
    let server = read_b_varchar(body, opts)?;
    let procedure = read_b_varchar(body, opts)?;
    need(body, 2)?;
    let line = body.get_u16_le();
    Ok(ServerMessage {
        number,
        state,
        class,
        message,
        server,
        procedure,
        line,
    })
}

fn decode_row<B: Buf>(src: &mut B, ctx: &TokenContext<'_>) -> Result<Vec<SqlValue>, ProtocolError> {
    if ctx.columns.is_empty() {
        return Err(ProtocolError::malformed("row", "no result metadata"));
    }
    ctx.columns
        .iter()
        .map(|col| decode_value(src, &col.column_type, ctx.opts).map_err(ProtocolError::from))
        .collect()
}

fn decode_table_names(
    body: &mut Bytes,
    ctx: &TokenContext<'_>,
) -> Result<Vec<TableName>, ProtocolError> {
    let mut tables = Vec::new();
    while body.has_remaining() {
        let table = if ctx.version.multipart_table_names() {
            let parts = body.get_u8();
            let mut names = Vec::with_capacity(parts as usize);
            for _ in 0..parts {
                names.push(read_us_varchar(body, ctx.opts)?);
            }
            TableName::from_parts(names)
        } else if ctx.version.is_tds7() {
            TableName::from_dotted(&read_us_varchar(body, ctx.opts)?)
        } else {
            TableName::from_dotted(&read_b_varchar(body, ctx.opts)?)
        };
        tables.push(table);
    }
    Ok(tables)
}

fn decode_column_info(
    body: &mut Bytes,
    opts: &CodecOptions,
) -> Result<Vec<ColumnInfo>, ProtocolError> {
    let mut infos = Vec::new();
    while body.has_remaining() {
        need(body, 3)?;
        let column = body.get_u8();
        let table = body.get_u8();
        let status = body.get_u8();
        let base_name = if status & ColumnInfo::STATUS_DIFFERENT_NAME != 0 {
            Some(read_b_varchar(body, opts)?)
        } else {
            None
        };
        infos.push(ColumnInfo {
            column,
            table,
            status,
            base_name,
        });
    }
    Ok(infos)
}

/// Whether a decode failure is a value over the configured size limit.
#[must_use]
pub fn is_resource_exhaustion(err: &ProtocolError) -> bool {
    matches!(err, ProtocolError::Type(TypeError::ValueTooLarge { .. }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tds_types::TypeId;

    fn decode(bytes: &[u8], version: TdsVersion, columns: &[ColumnData]) -> Result<Token, ProtocolError> {
        decode_with(bytes, version, columns, &[])
    }

    fn decode_with(
        bytes: &[u8],
        version: TdsVersion,
        columns: &[ColumnData],
        params: &[ColumnData],
    ) -> Result<Token, ProtocolError> {
        let opts = version.codec_options();
        let ctx = TokenContext {
            version,
            opts: &opts,
            columns,
            params,
        };
        let mut cursor = bytes;
        let token = decode_token(&mut cursor, &ctx)?;
        assert!(cursor.is_empty(), "token left {} bytes", cursor.len());
        Ok(token)
    }

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    /// Tag, u16 length, body.
    fn framed(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut data = vec![tag];
        data.extend_from_slice(&(body.len() as u16).to_le_bytes());
        data.extend_from_slice(body);
        data
    }

    fn b_name(out: &mut Vec<u8>, name: &str) {
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
    }

    #[test]
    fn test_done_roundtrip() {
        let done = Done {
            status: DoneStatus::COUNT | DoneStatus::MORE,
            cur_cmd: 0xC1,
            row_count: 42,
        };
        let mut buf = BytesMut::new();
        done.encode(TokenType::DoneInProc, &mut buf);
        assert_eq!(buf.len(), 1 + Done::SIZE);

        match decode(&buf, TdsVersion::V7_1, &[]).unwrap() {
            Token::DoneInProc(decoded) => assert_eq!(decoded, done),
            other => panic!("expected DoneInProc, got {other:?}"),
        }
    }

    #[test]
    fn test_done_status_bits() {
        let data = [0xFD, 0x31, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00];
        let Token::Done(done) = decode(&data, TdsVersion::V7_0, &[]).unwrap() else {
            panic!("expected Done");
        };
        assert!(done.has_more());
        assert!(done.has_count());
        assert!(done.is_attention());
        assert!(!done.has_error());
        assert_eq!(done.row_count, 5);
    }

    #[test]
    fn test_unsupported_tags() {
        for tag in [0x88, 0xA7, 0xA8, 0xD3, 0x42] {
            let err = decode(&[tag, 0, 0], TdsVersion::V7_1, &[]).unwrap_err();
            assert!(matches!(err, ProtocolError::UnsupportedToken(t) if t == tag));
        }
    }

    #[test]
    fn test_error_token_skips_trailing_bytes() {
        let mut body = Vec::new();
        body.extend_from_slice(&208i32.to_le_bytes());
        body.push(1); // state
        body.push(16); // class
        let msg = utf16("Invalid object name 't'.");
        body.extend_from_slice(&(msg.len() as u16 / 2).to_le_bytes());
        body.extend_from_slice(&msg);
        body.push(3);
        body.extend_from_slice(&utf16("srv"));
        body.push(0);
        body.extend_from_slice(&7u16.to_le_bytes());
        body.extend_from_slice(&[0xDE, 0xAD]); // extended diagnostics

        let mut data = vec![0xAA];
        data.extend_from_slice(&(body.len() as u16).to_le_bytes());
        data.extend_from_slice(&body);

        let Token::Error(err) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected Error");
        };
        assert_eq!(err.number, 208);
        assert_eq!(err.class, 16);
        assert_eq!(err.message, "Invalid object name 't'.");
        assert_eq!(err.server, "srv");
        assert_eq!(err.procedure, "");
        assert_eq!(err.line, 7);
    }

    #[test]
    fn test_error_token_shorter_than_fields_is_malformed() {
        let data = [0xAA, 0x03, 0x00, 0x01, 0x00, 0x00];
        let err = decode(&data, TdsVersion::V7_1, &[]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { context: "error", .. }));
    }

    #[test]
    fn test_env_change_packet_size() {
        let mut body = vec![4];
        body.push(4);
        body.extend_from_slice(&utf16("8192"));
        body.push(4);
        body.extend_from_slice(&utf16("4096"));
        let mut data = vec![0xE3];
        data.extend_from_slice(&(body.len() as u16).to_le_bytes());
        data.extend_from_slice(&body);

        let Token::EnvChange(change) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected EnvChange");
        };
        assert_eq!(
            change,
            EnvChange::PacketSize {
                new: 8192,
                old: Some(4096)
            }
        );
    }

    #[test]
    fn test_env_change_collation_length_checked() {
        let data = [0xE3, 0x08, 0x00, 0x07, 0x05, 0x09, 0x04, 0xD0, 0x00, 0x34, 0x00];
        let Token::EnvChange(change) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected EnvChange");
        };
        assert!(matches!(change, EnvChange::Collation(c) if c.lcid() == 0x0409));

        let data = [0xE3, 0x05, 0x00, 0x07, 0x02, 0x09, 0x04, 0x00];
        let Token::EnvChange(change) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected EnvChange");
        };
        assert_eq!(change, EnvChange::Ignored(7));
    }

    #[test]
    fn test_env_change_unknown_type_skipped() {
        let data = [0xE3, 0x04, 0x00, 0x0D, 0xAA, 0xBB, 0xCC];
        let Token::EnvChange(change) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected EnvChange");
        };
        assert_eq!(change, EnvChange::Ignored(0x0D));
    }

    #[test]
    fn test_col_metadata_then_row() {
        let mut data = vec![0x81, 0x02, 0x00];
        // INTN(4), nullable
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x26, 0x04]);
        data.push(2);
        data.extend_from_slice(&utf16("id"));
        // NVARCHAR(20) with collation
        data.extend_from_slice(&[0x00, 0x00, 0x09, 0x00, 0xE7, 0x28, 0x00]);
        data.extend_from_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        data.push(4);
        data.extend_from_slice(&utf16("name"));

        let Token::ColMetaData(meta) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected ColMetaData");
        };
        assert_eq!(meta.columns.len(), 2);
        assert_eq!(meta.columns[0].name, "id");
        assert!(meta.columns[0].is_nullable());
        assert_eq!(meta.columns[1].column_type.type_id, TypeId::NVarChar);
        assert!(meta.columns[1].flags.contains(ColumnFlags::WRITEABLE));

        let mut row = vec![0xD1, 0x04, 0x07, 0x00, 0x00, 0x00, 0x04, 0x00];
        row.extend_from_slice(&utf16("ab"));
        let Token::Row(values) = decode(&row, TdsVersion::V7_1, &meta.columns).unwrap() else {
            panic!("expected Row");
        };
        assert_eq!(values, vec![SqlValue::Int(7), SqlValue::String("ab".into())]);
    }

    #[test]
    fn test_suppressed_metadata() {
        for count in [[0xFF, 0xFF], [0xFE, 0xFF], [0x00, 0x80]] {
            let token = decode(&[0x81, count[0], count[1]], TdsVersion::V7_1, &[]).unwrap();
            assert!(matches!(token, Token::NoMetaData));
        }
    }

    #[test]
    fn test_truncated_row_is_incomplete() {
        let columns = vec![ColumnData {
            name: "x".into(),
            user_type: 0,
            flags: ColumnFlags::empty(),
            column_type: ColumnType::new(TypeId::Int4),
            table: None,
            base_name: None,
        }];
        let opts = CodecOptions::tds7(true);
        let ctx = TokenContext {
            version: TdsVersion::V7_1,
            opts: &opts,
            columns: &columns,
            params: &[],
        };
        let mut cursor: &[u8] = &[0xD1, 0x01, 0x00];
        assert!(decode_token(&mut cursor, &ctx).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_return_value_token() {
        let mut data = vec![0xAC, 0x01, 0x00];
        data.push(4);
        data.extend_from_slice(&utf16("@out"));
        data.push(0x01); // status
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]); // usertype, flags
        data.extend_from_slice(&[0x26, 0x04, 0x04, 0x2A, 0x00, 0x00, 0x00]);

        let Token::ReturnValue(rv) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected ReturnValue");
        };
        assert_eq!(rv.name, "@out");
        assert_eq!(rv.value, SqlValue::Int(42));
        assert!(!rv.is_udf_return());
    }

    #[test]
    fn test_login_ack() {
        let mut body = vec![0x01, 0x71, 0x00, 0x00, 0x01];
        body.push(10);
        body.extend_from_slice(&utf16("Microsoft\0"));
        body.extend_from_slice(&[8, 0, 0x02, 0x14]);
        let mut data = vec![0xAD];
        data.extend_from_slice(&(body.len() as u16).to_le_bytes());
        data.extend_from_slice(&body);

        let Token::LoginAck(ack) = decode(&data, TdsVersion::V7_1_REV1, &[]).unwrap() else {
            panic!("expected LoginAck");
        };
        assert_eq!(ack.tds_version, TdsVersion::V7_1_REV1);
        assert_eq!(ack.program, "Microsoft");
        assert_eq!((ack.major, ack.minor, ack.build), (8, 0, 0x0214));
    }

    #[test]
    fn test_table_names_by_version() {
        // 8.1: part count, then parts
        let mut body = vec![2];
        body.extend_from_slice(&3u16.to_le_bytes());
        body.extend_from_slice(&utf16("dbo"));
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&utf16("t"));
        let mut data = vec![0xA4];
        data.extend_from_slice(&(body.len() as u16).to_le_bytes());
        data.extend_from_slice(&body);
        let Token::TabName(names) = decode(&data, TdsVersion::V7_1_REV1, &[]).unwrap() else {
            panic!("expected TabName");
        };
        assert_eq!(names[0].schema.as_deref(), Some("dbo"));
        assert_eq!(names[0].table, "t");

        // 8.0: dotted name
        let mut body = Vec::new();
        body.extend_from_slice(&9u16.to_le_bytes());
        body.extend_from_slice(&utf16("pubs.dbo."));
        let mut data = vec![0xA4];
        data.extend_from_slice(&(body.len() as u16).to_le_bytes());
        data.extend_from_slice(&body);
        let Token::TabName(names) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected TabName");
        };
        assert_eq!(names[0].catalog.as_deref(), Some("pubs"));
        assert_eq!(names[0].table, "");
    }

    #[test]
    fn test_column_info() {
        let mut data = vec![0xA5, 0x00, 0x00];
        let mut body = vec![1, 1, 0x00, 2, 1, 0x20, 3];
        body.extend_from_slice(&utf16("abc"));
        data[1] = body.len() as u8;
        data.extend_from_slice(&body);

        let Token::ColInfo(infos) = decode(&data, TdsVersion::V7_1, &[]).unwrap() else {
            panic!("expected ColInfo");
        };
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].base_name, None);
        assert_eq!(infos[1].base_name.as_deref(), Some("abc"));
    }

    #[test]
    fn test_fixed_tokens() {
        assert!(matches!(
            decode(&[0x79, 0xFE, 0xFF, 0xFF, 0xFF], TdsVersion::V7_0, &[]).unwrap(),
            Token::ReturnStatus(-2)
        ));
        assert!(matches!(
            decode(&[0x78, 1, 0, 2, 0], TdsVersion::V7_0, &[]).unwrap(),
            Token::Offsets
        ));
        assert!(matches!(
            decode(&[0xAE, 2, 0, 9, 9], TdsVersion::V7_0, &[]).unwrap(),
            Token::Control
        ));
    }

    #[test]
    fn test_metadata_trailers() {
        assert!(TokenType::TabName.is_metadata_trailer());
        assert!(TokenType::Control.is_metadata_trailer());
        assert!(!TokenType::Row.is_metadata_trailer());
        assert_eq!(peek_tag(&[0xA4, 0x00]), Some(0xA4));
        assert_eq!(peek_tag(&[]), None);
    }

    #[test]
    fn test_capability_skipped() {
        let data = framed(0xE2, &[0x01, 0x0E, 0x6D, 0x7F, 0xFF, 0xFF]);
        assert!(matches!(
            decode(&data, TdsVersion::V5_0, &[]).unwrap(),
            Token::Capability
        ));
    }

    #[test]
    fn test_row_format_then_row() {
        let mut body = 1u16.to_le_bytes().to_vec();
        b_name(&mut body, "id");
        body.push(0x20); // nullable
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&[0x26, 0x04]);
        body.push(0); // locale
        let data = framed(0xEE, &body);

        let Token::ColMetaData(meta) = decode(&data, TdsVersion::V5_0, &[]).unwrap() else {
            panic!("expected ColMetaData");
        };
        assert_eq!(meta.columns.len(), 1);
        assert_eq!(meta.columns[0].name, "id");
        assert_eq!(meta.columns[0].user_type, 7);
        assert!(meta.columns[0].is_nullable());

        let row = [0xD1, 0x04, 0x2A, 0x00, 0x00, 0x00];
        let Token::Row(values) = decode(&row, TdsVersion::V5_0, &meta.columns).unwrap() else {
            panic!("expected Row");
        };
        assert_eq!(values, vec![SqlValue::Int(42)]);
    }

    #[test]
    fn test_wide_row_format_names() {
        let mut body = 1u16.to_le_bytes().to_vec();
        for name in ["", "sales", "dbo", "orders", "total"] {
            b_name(&mut body, name);
        }
        body.extend_from_slice(&0x10u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0x38);
        body.push(3);
        body.extend_from_slice(b"enu");
        let mut data = vec![0x61];
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&body);

        let Token::ColMetaData(meta) = decode(&data, TdsVersion::V5_0, &[]).unwrap() else {
            panic!("expected ColMetaData");
        };
        let col = &meta.columns[0];
        assert_eq!(col.name, "total");
        assert_eq!(col.base_name.as_deref(), Some("total"));
        assert_eq!(col.column_type.type_id, TypeId::Int4);
        assert!(col.flags.contains(ColumnFlags::WRITEABLE));
        assert!(!col.is_nullable());
        let table = col.table.as_ref().unwrap();
        assert_eq!(table.catalog.as_deref(), Some("sales"));
        assert_eq!(table.schema.as_deref(), Some("dbo"));
        assert_eq!(table.table, "orders");
    }

    fn eed(class: u8, text: &str) -> Vec<u8> {
        let mut body = 2812i32.to_le_bytes().to_vec();
        body.push(1);
        body.push(class);
        b_name(&mut body, "ZZZZZ");
        body.push(0); // status
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(text.len() as u16).to_le_bytes());
        body.extend_from_slice(text.as_bytes());
        b_name(&mut body, "ase");
        b_name(&mut body, "sp_x");
        body.extend_from_slice(&3u16.to_le_bytes());
        framed(0xE5, &body)
    }

    #[test]
    fn test_extended_error_severity() {
        let Token::Error(err) = decode(&eed(16, "not found"), TdsVersion::V5_0, &[]).unwrap()
        else {
            panic!("expected Error");
        };
        assert_eq!(err.number, 2812);
        assert_eq!(err.message, "not found");
        assert_eq!(err.server, "ase");
        assert_eq!(err.procedure, "sp_x");
        assert_eq!(err.line, 3);

        let Token::Info(info) = decode(&eed(0, "changed"), TdsVersion::V5_0, &[]).unwrap() else {
            panic!("expected Info");
        };
        assert_eq!(info.message, "changed");
    }

    #[test]
    fn test_column_names_and_formats() {
        let mut body = Vec::new();
        b_name(&mut body, "a");
        b_name(&mut body, "b");
        let Token::ColName(names) = decode(&framed(0xA0, &body), TdsVersion::V4_2, &[]).unwrap()
        else {
            panic!("expected ColName");
        };
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        let body = [
            0x00, 0x00, 0x01, 0x00, 0x26, 0x04, // INTN(4), nullable
            0x00, 0x00, 0x00, 0x00, 0x27, 0x0A, // VARCHAR(10)
        ];
        let Token::ColFmt(formats) = decode(&framed(0xA1, &body), TdsVersion::V4_2, &[]).unwrap()
        else {
            panic!("expected ColFmt");
        };
        assert_eq!(formats.len(), 2);
        assert!(formats[0].is_nullable());
        assert_eq!(formats[1].column_type.type_id, TypeId::VarChar);
        assert_eq!(formats[1].column_type.max_length, 10);
    }

    #[test]
    fn test_param_formats_then_params() {
        let mut body = 1u16.to_le_bytes().to_vec();
        b_name(&mut body, "@o");
        body.push(0x20);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&[0x26, 0x04]);
        body.push(0);
        let Token::ParamFmt(formats) =
            decode(&framed(0xEC, &body), TdsVersion::V5_0, &[]).unwrap()
        else {
            panic!("expected ParamFmt");
        };

        let data = [0xD7, 0x04, 0x05, 0x00, 0x00, 0x00];
        let Token::Params(values) = decode_with(&data, TdsVersion::V5_0, &[], &formats).unwrap()
        else {
            panic!("expected Params");
        };
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].name, "@o");
        assert_eq!(values[0].value, SqlValue::Int(5));

        let err = decode(&data, TdsVersion::V5_0, &[]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { context: "params", .. }));
    }
}
