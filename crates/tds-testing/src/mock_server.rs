//! Mock TDS server for unit testing.
//!
//! Speaks enough of the protocol for a client to connect, log in and run
//! requests without a real database:
//!
//! - answers pre-login (TDS 8.0+) without offering encryption
//! - acknowledges any login, or rejects it with a configured error
//! - replies to SQL batches and RPCs from a table of scripted responses
//! - acknowledges cancels, including for requests it never answers
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("SELECT 1", MockResponse::scalar(1i32))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Connect your client to addr...
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tds_codec::{CodecError, Message, PacketStream, TdsCodec};
use tds_protocol::codec::{write_b_varchar, write_us_varchar};
use tds_protocol::prelogin::validate_options;
use tds_protocol::{
    DEFAULT_PACKET_SIZE, Done, DoneStatus, EncryptionLevel, PacketType, ProtocolError,
    TdsVersion, TokenType,
};
use tds_types::{
    CodecOptions, ColumnType, ParamDescriptor, SqlValue, TypeError, TypeId, decode_utf16,
    encode_type, encode_value, resolve_param_type,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};

/// Current command code the mock reports for SELECT completions.
const CMD_SELECT: u16 = 0xC1;
/// Current command code the mock reports for DML completions.
const CMD_UPDATE: u16 = 0xC5;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport error.
    #[error("transport error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed request or scripted response.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for MockServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<TypeError> for MockServerError {
    fn from(err: TypeError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Scripted reply to one request.
#[derive(Clone)]
pub enum MockResponse {
    /// One column, one row.
    Scalar(SqlValue),

    /// A result set.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<SqlValue>>,
    },

    /// An error message followed by a failed completion.
    Error {
        /// Error number.
        number: i32,
        /// Error message.
        message: String,
        /// Severity class.
        class: u8,
    },

    /// A completion carrying an update count.
    RowsAffected(i32),

    /// Pre-encoded token stream, usually built with [`TokenWriter`].
    Tokens(Bytes),

    /// Send nothing until the client cancels, then acknowledge the cancel.
    Stall,

    /// Drop the connection without answering.
    Disconnect,

    /// Compute the response from the request text.
    Custom(Arc<dyn Fn(&str) -> MockResponse + Send + Sync>),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Error {
                number,
                message,
                class,
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("message", message)
                .field("class", class)
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::Tokens(data) => f.debug_tuple("Tokens").field(&data.len()).finish(),
            Self::Stall => f.write_str("Stall"),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Create a scalar response.
    pub fn scalar(value: impl Into<SqlValue>) -> Self {
        Self::Scalar(value.into())
    }

    /// Create an empty completion.
    pub fn empty() -> Self {
        Self::Tokens(Bytes::new())
    }

    /// Create an update-count response.
    pub fn affected(count: i32) -> Self {
        Self::RowsAffected(count)
    }

    /// Create an error response with severity 16.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            class: 16,
        }
    }

    /// Create a result-set response.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Create a response from a pre-encoded token stream.
    pub fn tokens(tokens: impl Into<Bytes>) -> Self {
        Self::Tokens(tokens.into())
    }
}

/// Mock column definition.
#[derive(Debug, Clone)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Wire type.
    pub column_type: ColumnType,
    /// Whether the column is nullable.
    pub nullable: bool,
}

impl MockColumn {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    /// Create an INT column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::new(TypeId::IntN).with_length(4))
    }

    /// Create a BIGINT column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::new(TypeId::IntN).with_length(8))
    }

    /// Create an NVARCHAR column.
    pub fn nvarchar(name: impl Into<String>, max_chars: u32) -> Self {
        Self::new(name, ColumnType::new(TypeId::NVarChar).with_length(max_chars * 2))
    }

    /// Create a single-byte VARCHAR column, the form TDS 4.2 and 5.0 use.
    pub fn varchar(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, ColumnType::new(TypeId::VarChar).with_length(max_len))
    }

    /// Set nullable flag.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Builds a server token stream the way the protocol version lays it out.
///
/// Encoding errors are deferred to [`TokenWriter::finish`] so tokens can be
/// chained.
#[derive(Debug)]
pub struct TokenWriter {
    version: TdsVersion,
    buf: BytesMut,
    opts: CodecOptions,
    columns: Vec<ColumnType>,
    error: Option<MockServerError>,
}

impl TokenWriter {
    /// Create a writer for a session at the given version.
    pub fn new(version: TdsVersion) -> Self {
        Self {
            version,
            buf: BytesMut::new(),
            opts: version.codec_options(),
            columns: Vec::new(),
            error: None,
        }
    }

    fn record(mut self, token: TokenType, body: Result<BytesMut>) -> Self {
        match body {
            Ok(body) if body.len() <= usize::from(u16::MAX) => {
                self.buf.put_u8(token as u8);
                self.buf.put_u16_le(body.len() as u16);
                self.buf.extend_from_slice(&body);
            }
            Ok(_) => self.fail(MockServerError::Protocol("token record too long".into())),
            Err(e) => self.fail(e),
        }
        self
    }

    fn fail(&mut self, err: MockServerError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Column metadata; later rows are encoded against these columns.
    ///
    /// TDS 5.0 sessions get a ROWFMT token and TDS 4.2 sessions a COLNAME
    /// and COLFMT pair.
    pub fn col_metadata(mut self, columns: &[MockColumn]) -> Self {
        if self.version == TdsVersion::V4_2 {
            return self.col_name_format(columns);
        }
        if self.version == TdsVersion::V5_0 {
            return self.row_format(columns);
        }
        self.buf.put_u8(TokenType::ColMetaData as u8);
        self.buf.put_u16_le(columns.len() as u16);
        for col in columns {
            self.buf.put_u16_le(0);
            self.buf.put_u16_le(u16::from(col.nullable));
            encode_type(&col.column_type, &self.opts, &mut self.buf);
            if let Err(e) = write_b_varchar(&mut self.buf, &col.name, &self.opts) {
                self.fail(e.into());
            }
        }
        self.columns = columns.iter().map(|c| c.column_type.clone()).collect();
        self
    }

    fn col_name_format(mut self, columns: &[MockColumn]) -> Self {
        self.columns = columns.iter().map(|c| c.column_type.clone()).collect();
        let opts = self.opts;
        let names = (|| {
            let mut body = BytesMut::new();
            for col in columns {
                write_b_varchar(&mut body, &col.name, &opts)?;
            }
            Ok(body)
        })();
        let mut formats = BytesMut::new();
        for col in columns {
            formats.put_u16_le(0);
            formats.put_u16_le(u16::from(col.nullable));
            encode_type(&col.column_type, &opts, &mut formats);
        }
        self.record(TokenType::ColName, names)
            .record(TokenType::ColFmt, Ok(formats))
    }

    fn row_format(mut self, columns: &[MockColumn]) -> Self {
        self.columns = columns.iter().map(|c| c.column_type.clone()).collect();
        let opts = self.opts;
        let body = (|| {
            let mut body = BytesMut::new();
            body.put_u16_le(columns.len() as u16);
            for col in columns {
                write_b_varchar(&mut body, &col.name, &opts)?;
                body.put_u8(if col.nullable { 0x20 } else { 0x00 });
                body.put_u32_le(0);
                encode_type(&col.column_type, &opts, &mut body);
                body.put_u8(0); // locale
            }
            Ok(body)
        })();
        self.record(TokenType::RowFmt, body)
    }

    /// One row of values for the current columns.
    pub fn row(mut self, values: &[SqlValue]) -> Self {
        if values.len() != self.columns.len() {
            self.fail(MockServerError::Protocol(format!(
                "row has {} values for {} columns",
                values.len(),
                self.columns.len()
            )));
            return self;
        }
        self.buf.put_u8(TokenType::Row as u8);
        for (value, col) in values.iter().zip(&self.columns) {
            if let Err(e) = encode_value(value, col, &self.opts, &mut self.buf) {
                if self.error.is_none() {
                    self.error = Some(e.into());
                }
            }
        }
        self
    }

    fn done_token(mut self, token: TokenType, status: DoneStatus, cur_cmd: u16, count: i32) -> Self {
        Done {
            status,
            cur_cmd,
            row_count: count,
        }
        .encode(token, &mut self.buf);
        self
    }

    /// Statement completion.
    pub fn done(self, status: DoneStatus, cur_cmd: u16, count: i32) -> Self {
        self.done_token(TokenType::Done, status, cur_cmd, count)
    }

    /// Procedure completion.
    pub fn done_proc(self, status: DoneStatus, count: i32) -> Self {
        self.done_token(TokenType::DoneProc, status, 0, count)
    }

    /// Completion of a statement inside a procedure.
    pub fn done_in_proc(self, status: DoneStatus, cur_cmd: u16, count: i32) -> Self {
        self.done_token(TokenType::DoneInProc, status, cur_cmd, count)
    }

    /// Update-count completion of a DML statement.
    pub fn update_count(self, count: i32, more: bool) -> Self {
        let mut status = DoneStatus::COUNT;
        status.set(DoneStatus::MORE, more);
        self.done(status, CMD_UPDATE, count)
    }

    /// TDS 5.0 sessions get an EED token whichever kind is asked for; the
    /// client tells errors from messages by severity.
    fn message(self, token: TokenType, number: i32, class: u8, message: &str) -> Self {
        let opts = self.opts;
        let extended = self.version == TdsVersion::V5_0;
        let body = (|| {
            let mut body = BytesMut::new();
            body.put_i32_le(number);
            body.put_u8(1);
            body.put_u8(class);
            if extended {
                write_b_varchar(&mut body, "ZZZZZ", &opts)?;
                body.put_u8(0); // status
                body.put_u16_le(0); // transaction state
            }
            write_us_varchar(&mut body, message, &opts)?;
            write_b_varchar(&mut body, "MockServer", &opts)?;
            write_b_varchar(&mut body, "", &opts)?;
            body.put_u16_le(1);
            Ok(body)
        })();
        self.record(if extended { TokenType::Eed } else { token }, body)
    }

    /// Capability record of a TDS 5.0 login reply.
    pub fn capability(self) -> Self {
        let body = BytesMut::from(&[0x01, 0x04, 0x0D, 0xEF, 0xFF, 0xFF, 0x02, 0x04, 0x00, 0x00, 0x00, 0x00][..]);
        self.record(TokenType::Capability, Ok(body))
    }

    /// TDS 5.0 output parameters: a PARAMFMT token and the PARAMS values.
    pub fn params(mut self, values: &[(&str, SqlValue)]) -> Self {
        let mut columns = Vec::with_capacity(values.len());
        for (name, value) in values {
            match resolve_param_type(&ParamDescriptor::in_out(*name, value.clone()), &self.opts) {
                Ok(col) => columns.push(col),
                Err(e) => {
                    self.fail(e.into());
                    return self;
                }
            }
        }

        let opts = self.opts;
        let formats = (|| {
            let mut body = BytesMut::new();
            body.put_u16_le(values.len() as u16);
            for ((name, _), col) in values.iter().zip(&columns) {
                write_b_varchar(&mut body, name, &opts)?;
                body.put_u8(0x20);
                body.put_u32_le(0);
                encode_type(col, &opts, &mut body);
                body.put_u8(0); // locale
            }
            Ok(body)
        })();
        self = self.record(TokenType::ParamFmt, formats);

        self.buf.put_u8(TokenType::Params as u8);
        for ((_, value), col) in values.iter().zip(&columns) {
            if let Err(e) = encode_value(value, col, &opts, &mut self.buf) {
                self.fail(e.into());
            }
        }
        self
    }

    /// Error message.
    pub fn error(self, number: i32, class: u8, message: &str) -> Self {
        self.message(TokenType::Error, number, class, message)
    }

    /// Informational message.
    pub fn info(self, number: i32, class: u8, message: &str) -> Self {
        self.message(TokenType::Info, number, class, message)
    }

    /// Procedure return status.
    pub fn return_status(mut self, status: i32) -> Self {
        self.buf.put_u8(TokenType::ReturnStatus as u8);
        self.buf.put_i32_le(status);
        self
    }

    /// Output parameter or function return value.
    ///
    /// The wire type is inferred from the value unless one is given.
    pub fn return_value(
        mut self,
        name: &str,
        status: u8,
        value: &SqlValue,
        wire_type: Option<TypeId>,
    ) -> Self {
        let mut param = ParamDescriptor::in_out(name, value.clone());
        param.wire_type = wire_type;
        let col = match resolve_param_type(&param, &self.opts) {
            Ok(col) => col,
            Err(e) => {
                self.fail(e.into());
                return self;
            }
        };

        self.buf.put_u8(TokenType::ReturnValue as u8);
        self.buf.put_u16_le(0);
        if let Err(e) = write_b_varchar(&mut self.buf, name, &self.opts) {
            self.fail(e.into());
        }
        self.buf.put_u8(status);
        if self.opts.unicode {
            self.buf.put_u16_le(0);
            self.buf.put_u16_le(u16::from(true));
        } else {
            self.buf.put_u32_le(0);
        }
        encode_type(&col, &self.opts, &mut self.buf);
        if let Err(e) = encode_value(value, &col, &self.opts, &mut self.buf) {
            self.fail(e.into());
        }
        self
    }

    /// Environment change with string values.
    pub fn env_change(self, kind: u8, new: &str, old: &str) -> Self {
        let opts = self.opts;
        let body = (|| {
            let mut body = BytesMut::new();
            body.put_u8(kind);
            write_b_varchar(&mut body, new, &opts)?;
            write_b_varchar(&mut body, old, &opts)?;
            Ok(body)
        })();
        self.record(TokenType::EnvChange, body)
    }

    /// Packet size change.
    pub fn packet_size(self, new: usize, old: usize) -> Self {
        self.env_change(4, &new.to_string(), &old.to_string())
    }

    /// Login acknowledgement.
    pub fn login_ack(self, program: &str, version: TdsVersion) -> Self {
        let opts = self.opts;
        let interface = if version.is_tds7() { 1 } else { 5 };
        let body = (|| {
            let mut body = BytesMut::new();
            body.put_u8(interface);
            body.put_u32(version.raw());
            write_b_varchar(&mut body, program, &opts)?;
            body.put_u8(8);
            body.put_u8(0);
            body.put_u16(2039);
            Ok(body)
        })();
        self.record(TokenType::LoginAck, body)
    }

    /// Bytes appended as they are.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// The encoded token stream.
    pub fn finish(self) -> Result<Bytes> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf.freeze()),
        }
    }
}

/// A request the server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    /// Packet type of the request.
    pub packet_type: PacketType,
    /// SQL text for batches, procedure name for RPCs, empty otherwise.
    pub text: String,
}

/// Configuration for the mock TDS server.
pub struct MockServerConfig {
    /// Responses to SQL batches, keyed by upper-cased text.
    responses: HashMap<String, MockResponse>,
    /// Responses to RPCs, keyed by lower-cased procedure name.
    rpc_responses: HashMap<String, MockResponse>,
    /// Response for unmatched requests.
    default_response: MockResponse,
    /// Server name to report in LoginAck.
    server_name: String,
    /// TDS version to acknowledge.
    tds_version: TdsVersion,
    /// Default database name.
    database: String,
    /// Encryption mode offered in the pre-login answer.
    encryption: EncryptionLevel,
    /// Packet size announced after login.
    packet_size: Option<usize>,
    /// Error returned instead of a login acknowledgement.
    login_error: Option<(i32, String)>,
    /// Size of reply packets.
    reply_packet_size: usize,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            rpc_responses: HashMap::new(),
            default_response: MockResponse::empty(),
            server_name: "Microsoft SQL Server".to_string(),
            tds_version: TdsVersion::V7_1,
            database: "master".to_string(),
            encryption: EncryptionLevel::NotSupported,
            packet_size: None,
            login_error: None,
            reply_packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl MockServerConfig {
    fn find(&self, request: &ReceivedRequest) -> MockResponse {
        let found = match request.packet_type {
            PacketType::Query => self.responses.get(&normalize(&request.text)),
            PacketType::Rpc => self.rpc_responses.get(&request.text.to_lowercase()),
            _ => None,
        };
        let response = found.unwrap_or(&self.default_response).clone();
        match response {
            MockResponse::Custom(handler) => handler(&request.text),
            other => other,
        }
    }
}

fn normalize(sql: &str) -> String {
    sql.trim().to_uppercase()
}

/// Builder for `MockTdsServer`.
#[derive(Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for a SQL batch. Matching ignores case and surrounding
    /// whitespace.
    pub fn with_response(mut self, sql: impl AsRef<str>, response: MockResponse) -> Self {
        self.config
            .responses
            .insert(normalize(sql.as_ref()), response);
        self
    }

    /// Add a response for calls to a procedure.
    pub fn with_rpc_response(mut self, procedure: impl AsRef<str>, response: MockResponse) -> Self {
        self.config
            .rpc_responses
            .insert(procedure.as_ref().to_lowercase(), response);
        self
    }

    /// Set the response for unmatched requests.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Set the server name reported in LoginAck.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Set the default database.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Set the protocol version the server acknowledges and encodes with.
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.config.tds_version = version;
        self
    }

    /// Set the encryption mode offered in the pre-login answer.
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// Announce a packet size after login.
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = Some(size);
        self
    }

    /// Reject every login with this error.
    pub fn with_login_error(mut self, number: i32, message: impl Into<String>) -> Self {
        self.config.login_error = Some((number, message.into()));
        self
    }

    /// Split replies into packets of this size.
    pub fn with_reply_packet_size(mut self, size: usize) -> Self {
        self.config.reply_packet_size = size;
        self
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }
}

/// A mock TDS server for testing.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    connection_count: Arc<Mutex<usize>>,
}

impl MockTdsServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(config);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connection_count = Arc::new(Mutex::new(0usize));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            requests: requests.clone(),
            connection_count: connection_count.clone(),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _peer_addr)) => {
                                let config = config.clone();
                                let requests = requests.clone();
                                let count = connection_count.clone();
                                tokio::spawn(async move {
                                    *count.lock().await += 1;
                                    if let Err(e) = handle_connection(stream, config, requests).await {
                                        tracing::debug!(error = %e, "mock connection ended");
                                    }
                                    let mut c = count.lock().await;
                                    *c = c.saturating_sub(1);
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "accept failed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Requests received so far, across all connections.
    pub async fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().await.clone()
    }

    /// Get the current connection count.
    pub async fn connection_count(&self) -> usize {
        *self.connection_count.lock().await
    }

    /// Stop the server.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle a single client connection.
async fn handle_connection(
    tcp: TcpStream,
    config: Arc<MockServerConfig>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
) -> Result<()> {
    let codec = TdsCodec::new().with_packet_size(config.reply_packet_size);
    let mut stream = PacketStream::with_codec(tcp, codec);

    let mut message = stream.read_message().await?;
    if message.packet_type == PacketType::PreLogin {
        validate_options(&message.payload)?;
        stream
            .send_message(PacketType::Reply, &prelogin_response(config.encryption))
            .await?;
        message = stream.read_message().await?;
    }
    if !matches!(
        message.packet_type,
        PacketType::Login | PacketType::LegacyLogin
    ) {
        return Err(MockServerError::Protocol(format!(
            "expected login, got {:?}",
            message.packet_type
        )));
    }

    let reply = login_response(&config)?;
    stream.send_message(PacketType::Reply, &reply).await?;
    if config.login_error.is_some() {
        return Ok(());
    }

    let opts = config.tds_version.codec_options();
    loop {
        let message = match stream.read_message().await {
            Ok(m) => m,
            Err(e) if e.is_closed() => break,
            Err(e) => return Err(e.into()),
        };

        if message.packet_type == PacketType::Cancel {
            send_attention_ack(&mut stream, &config).await?;
            continue;
        }

        let request = decode_request(&message, &opts);
        tracing::debug!(packet_type = ?request.packet_type, text = %request.text, "mock request");
        requests.lock().await.push(request.clone());

        match config.find(&request) {
            MockResponse::Disconnect => break,
            MockResponse::Stall => {
                let next = stream.read_message().await?;
                if next.packet_type != PacketType::Cancel {
                    return Err(MockServerError::Protocol(format!(
                        "expected cancel, got {:?}",
                        next.packet_type
                    )));
                }
                send_attention_ack(&mut stream, &config).await?;
            }
            response => {
                let tokens = encode_response(response, &config)?;
                stream.send_message(PacketType::Reply, &tokens).await?;
            }
        }
    }

    Ok(())
}

/// Pre-login answer: server version and encryption mode.
fn prelogin_response(encryption: EncryptionLevel) -> Bytes {
    let mut response = BytesMut::new();

    // VERSION at offset 11, 6 bytes
    response.put_u8(0x00);
    response.put_u16(11);
    response.put_u16(6);

    // ENCRYPTION at offset 17, 1 byte
    response.put_u8(0x01);
    response.put_u16(17);
    response.put_u16(1);

    response.put_u8(0xFF);

    response.put_u8(8);
    response.put_u8(0);
    response.put_u16(2039);
    response.put_u16(0);

    response.put_u8(encryption as u8);
    response.freeze()
}

fn login_response(config: &MockServerConfig) -> Result<Bytes> {
    let version = config.tds_version;
    let mut writer = TokenWriter::new(version);

    if let Some((number, message)) = &config.login_error {
        return writer
            .error(*number, 14, message)
            .done(DoneStatus::ERROR, 0, 0)
            .finish();
    }

    writer = writer.env_change(1, &config.database, "");
    if let Some(size) = config.packet_size {
        writer = writer.packet_size(size, version.default_packet_size());
    }
    writer = writer
        .info(5701, 0, &format!("Changed database context to '{}'.", config.database))
        .login_ack(&config.server_name, version);
    if version == TdsVersion::V5_0 {
        writer = writer.capability();
    }
    writer.done(DoneStatus::empty(), 0, 0).finish()
}

fn encode_response(response: MockResponse, config: &MockServerConfig) -> Result<Bytes> {
    let writer = TokenWriter::new(config.tds_version);
    match response {
        MockResponse::Scalar(value) => {
            let param = ParamDescriptor::input("", value.clone());
            let column_type = resolve_param_type(&param, &writer.opts)?;
            writer
                .col_metadata(&[MockColumn::new("", column_type)])
                .row(&[value])
                .done(DoneStatus::COUNT, CMD_SELECT, 1)
                .finish()
        }
        MockResponse::Rows { columns, rows } => {
            let count = rows.len() as i32;
            let mut writer = writer.col_metadata(&columns);
            for row in &rows {
                writer = writer.row(row);
            }
            writer.done(DoneStatus::COUNT, CMD_SELECT, count).finish()
        }
        MockResponse::Error {
            number,
            message,
            class,
        } => writer
            .error(number, class, &message)
            .done(DoneStatus::ERROR, 0, 0)
            .finish(),
        MockResponse::RowsAffected(count) => writer.update_count(count, false).finish(),
        MockResponse::Tokens(tokens) if tokens.is_empty() => {
            writer.done(DoneStatus::empty(), 0, 0).finish()
        }
        MockResponse::Tokens(tokens) => Ok(tokens),
        MockResponse::Stall | MockResponse::Disconnect | MockResponse::Custom(_) => Err(
            MockServerError::Protocol(format!("{response:?} cannot be encoded")),
        ),
    }
}

/// Recover the SQL text or procedure name of a request.
fn decode_request(message: &Message, opts: &CodecOptions) -> ReceivedRequest {
    let payload = &message.payload[..];
    let text = match message.packet_type {
        PacketType::Query => decode_text(payload, opts),
        PacketType::Rpc => decode_proc_name(payload, opts),
        _ => String::new(),
    };
    ReceivedRequest {
        packet_type: message.packet_type,
        text,
    }
}

fn decode_text(raw: &[u8], opts: &CodecOptions) -> String {
    if opts.unicode {
        decode_utf16(raw).unwrap_or_default()
    } else {
        String::from_utf8_lossy(raw).into_owned()
    }
}

fn decode_proc_name(payload: &[u8], opts: &CodecOptions) -> String {
    if opts.unicode {
        let Some(len) = payload.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]])) else {
            return String::new();
        };
        if len == 0xFFFF {
            let id = payload.get(2..4).map_or(0, |b| u16::from_le_bytes([b[0], b[1]]));
            return format!("#{id}");
        }
        payload
            .get(2..2 + usize::from(len) * 2)
            .map(|raw| decode_text(raw, opts))
            .unwrap_or_default()
    } else {
        let Some(&len) = payload.first() else {
            return String::new();
        };
        payload
            .get(1..1 + usize::from(len))
            .map(|raw| decode_text(raw, opts))
            .unwrap_or_default()
    }
}

async fn send_attention_ack(
    stream: &mut PacketStream<TcpStream>,
    config: &MockServerConfig,
) -> Result<()> {
    let ack = TokenWriter::new(config.tds_version)
        .done(DoneStatus::ATTN, 0, 0)
        .finish()?;
    stream.send_message(PacketType::Reply, &ack).await?;
    Ok(())
}
