//! Session client.

use bytes::Bytes;
use tds_codec::{Connection, PacketStream};
use tds_protocol::packet::PacketType;
use tds_protocol::token::LoginAck;
use tds_protocol::version::TdsVersion;
use tds_protocol::{
    Encryption, PreLogin, PreLoginResponse, ProtocolError, RpcRequest, encode_sql_batch,
    negotiate_encryption, substitute_params,
};
use tds_tls::TlsConnector;
use tds_types::SqlValue;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cancel::CancelHandle;
use crate::config::{Config, SslMode};
use crate::diagnostics::DiagnosticChain;
use crate::error::{Error, Result};
use crate::reader::TokenReader;
use crate::response::{BatchResult, EXECUTE_FAILED, NO_COUNT, ResultSet, Response};
use crate::session::{DoneKind, Event, OutputParam, OutputSlots, SessionState};
use crate::transport::Transport;

/// A connected TDS session.
///
/// One request is in flight at a time; `&mut self` on every request method
/// is the connection lock. Submitting a new request first drains whatever is
/// left of the previous response.
pub struct Client {
    config: Config,
    conn: Connection<Transport>,
    session: SessionState,
    reader: TokenReader,
    encryption: Encryption,
    server_version: Option<(u8, u8, u16)>,
    closed: bool,
}

impl Client {
    /// Connect and log in.
    ///
    /// For TDS 8.0 and later a pre-login exchange negotiates encryption
    /// first; older versions always connect in the clear.
    pub async fn connect(config: Config) -> Result<Self> {
        let version = config.effective_version();
        let port = config.effective_port();

        tracing::info!(
            host = %config.host,
            port,
            database = ?config.database,
            version = %version,
            "connecting"
        );

        let tcp = timeout(
            config.timeouts.connect_timeout,
            TcpStream::connect((config.host.as_str(), port)),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)??;
        tcp.set_nodelay(true)?;

        let login = config.login();
        let login_payload = login.encode(&version.codec_options())?;

        let (transport, encryption, server_version) = if version >= TdsVersion::V7_1 {
            Self::negotiate(&config, tcp, login.packet_type(), &login_payload).await?
        } else {
            if matches!(config.ssl, SslMode::Require | SslMode::Authenticate) {
                return Err(Error::Config(format!(
                    "encryption requires TDS 8.0 or later, not {version}"
                )));
            }
            (Transport::Plain(tcp), Encryption::Plain, None)
        };

        let mut conn = Connection::new(transport, version.default_packet_size());
        if encryption != Encryption::LoginOnly {
            conn.send_message(login.packet_type(), &login_payload)
                .await?;
        }

        let mut session = SessionState::new(version, config.server_type, conn.packet_size());
        if let Some(limit) = config.max_value_size {
            session.set_max_value_size(limit);
        }

        let mut client = Self {
            config,
            conn,
            session,
            reader: TokenReader::new(),
            encryption,
            server_version,
            closed: false,
        };

        let login_timeout = client.config.timeouts.login_timeout;
        timeout(login_timeout, client.read_login_response())
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        tracing::info!(
            version = %client.session.version(),
            database = client.session.database(),
            packet_size = client.session.packet_size(),
            "connected"
        );
        Ok(client)
    }

    /// Exchange pre-login packets and set up TLS as negotiated.
    ///
    /// For login-only encryption the login is sent here, inside TLS, and the
    /// plain stream is returned for the rest of the session.
    async fn negotiate(
        config: &Config,
        tcp: TcpStream,
        login_type: PacketType,
        login_payload: &[u8],
    ) -> Result<(Transport, Encryption, Option<(u8, u8, u16)>)> {
        let requested = config.ssl.level();
        let mut prelogin = PreLogin::new(requested);
        if let Some(instance) = &config.instance {
            prelogin = prelogin.with_instance(instance);
        }

        let mut stream = PacketStream::new(tcp);
        stream
            .send_message(PacketType::PreLogin, &prelogin.encode())
            .await?;
        let reply = stream.read_message().await?;
        let response = PreLoginResponse::decode(&reply.payload);
        let tcp = stream.into_inner();

        let encryption = negotiate_encryption(requested, response.encryption)
            .ok_or(tds_tls::TlsError::EncryptionNotSupported)?;
        tracing::debug!(
            requested = ?requested,
            server = ?response.encryption,
            negotiated = ?encryption,
            "encryption negotiated"
        );

        if encryption == Encryption::Plain {
            return Ok((Transport::Plain(tcp), encryption, response.server_version));
        }

        let connector = TlsConnector::new(config.tls_config())?;
        let tls = timeout(
            config.timeouts.tls_timeout,
            connector.connect_prelogin(tcp, &config.host),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)??;

        let transport = match encryption {
            Encryption::LoginOnly => {
                let mut stream = PacketStream::new(tls);
                stream.send_message(login_type, login_payload).await?;
                let (wrapper, _) = stream.into_inner().into_inner();
                tracing::debug!("login sent encrypted, continuing in the clear");
                Transport::Plain(wrapper.into_inner())
            }
            _ => Transport::Tls(Box::new(tls)),
        };
        Ok((transport, encryption, response.server_version))
    }

    async fn read_login_response(&mut self) -> Result<()> {
        self.session.begin_request(OutputSlots::default());
        self.reader.start();
        while self.read_event().await? != Event::End {}

        if self.session.login_ack().is_none() {
            let mut diagnostics = self.session.diagnostics_mut().take();
            diagnostics.check()?;
            return Err(Error::LoginFailed(
                "server did not acknowledge the login".into(),
            ));
        }
        self.session.diagnostics_mut().check()
    }

    /// Submit a SQL batch.
    pub async fn submit_sql(&mut self, sql: &str) -> Result<()> {
        self.prepare().await?;
        let payload = encode_sql_batch(sql, self.session.codec_options()).map_err(request_error)?;
        self.send(PacketType::Query, payload, OutputSlots::default())
            .await
    }

    /// Submit a SQL batch with `?` markers replaced by literal values.
    pub async fn submit_sql_with_params(&mut self, sql: &str, params: &[SqlValue]) -> Result<()> {
        self.prepare().await?;
        let unicode = self.session.codec_options().unicode;
        let sql = substitute_params(sql, params, unicode).map_err(request_error)?;
        let payload =
            encode_sql_batch(&sql, self.session.codec_options()).map_err(request_error)?;
        self.send(PacketType::Query, payload, OutputSlots::default())
            .await
    }

    /// Submit a remote procedure call.
    pub async fn submit_rpc(&mut self, rpc: &RpcRequest) -> Result<()> {
        self.prepare().await?;
        let payload = rpc
            .encode(self.session.version(), self.session.codec_options())
            .map_err(request_error)?;
        tracing::debug!(procedure = rpc.proc_name(), params = rpc.params().len(), "rpc");
        self.send(PacketType::Rpc, payload, OutputSlots::from_params(rpc.params()))
            .await
    }

    async fn prepare(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if !self.session.is_end_of_response() {
            self.clear_response_queue().await?;
        }
        Ok(())
    }

    /// Discard the rest of the current response, including the
    /// acknowledgement of a cancel sent on timeout.
    async fn clear_response_queue(&mut self) -> Result<()> {
        tracing::debug!("discarding unread response");
        while self.read_event().await? != Event::End {}
        Ok(())
    }

    async fn send(&mut self, packet_type: PacketType, payload: Bytes, outputs: OutputSlots) -> Result<()> {
        self.session.begin_request(outputs);
        if let Err(e) = self.conn.send_message(packet_type, &payload).await {
            self.session.mark_fatal();
            self.closed = true;
            return Err(e.into());
        }
        self.reader.start();
        Ok(())
    }

    async fn read_event(&mut self) -> Result<Event> {
        let first_byte_timeout = self.config.timeouts.command_timeout;
        let result = self
            .reader
            .next_event(&mut self.conn, &mut self.session, first_byte_timeout)
            .await;

        let failed_fatally = matches!(&result, Err(e) if e.is_fatal());
        if failed_fatally || (self.reader.is_closing() && self.session.is_end_of_response()) {
            if !self.closed {
                tracing::info!("session closed after a fatal error");
            }
            self.closed = true;
        }
        result
    }

    /// Next step of the current response.
    ///
    /// Returns [`Event::End`] once the response is complete, and keeps
    /// returning it until a new request is submitted. Server errors arrive
    /// as [`Event::Message`] and are also kept in [`Client::diagnostics`].
    pub async fn next_event(&mut self) -> Result<Event> {
        if self.session.is_end_of_response() {
            return Ok(Event::End);
        }
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.read_event().await
    }

    /// Consume the rest of the response and collect it.
    ///
    /// Server errors are raised after the response has been fully read, so
    /// output parameters and return status stay available through
    /// [`Client::output_params`] and [`Client::return_status`].
    pub async fn collect(&mut self) -> Result<Response> {
        let mut response = Response::default();
        loop {
            match self.next_event().await? {
                Event::ResultSet(columns) => response.result_sets.push(ResultSet {
                    columns,
                    rows: Vec::new(),
                }),
                Event::Row(values) => {
                    if let Some(rs) = response.result_sets.last_mut() {
                        rs.rows.push(values);
                    }
                }
                Event::Done(done) => {
                    if let Some(count) = done.update_count {
                        response.update_counts.push(count);
                    }
                }
                Event::OutputParam { .. } | Event::ReturnStatus(_) | Event::Message(_) => {}
                Event::End => break,
            }
        }

        self.check_diagnostics()?;
        response.return_status = self.session.return_status();
        response.output_params = self.session.output_params().to_vec();
        response.warnings = self.session.diagnostics().clone();
        Ok(response)
    }

    /// Consume the rest of the response, raising any server error.
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_event().await? != Event::End {}
        self.check_diagnostics()
    }

    /// Run a SQL batch and collect everything it returns.
    pub async fn query(&mut self, sql: &str) -> Result<Response> {
        self.submit_sql(sql).await?;
        self.collect().await
    }

    /// Run a SQL batch with `?` markers replaced by literal values.
    pub async fn query_with_params(&mut self, sql: &str, params: &[SqlValue]) -> Result<Response> {
        self.submit_sql_with_params(sql, params).await?;
        self.collect().await
    }

    /// Call a procedure and collect everything it returns.
    pub async fn execute_rpc(&mut self, rpc: &RpcRequest) -> Result<Response> {
        self.submit_rpc(rpc).await?;
        self.collect().await
    }

    /// Run statements as one batch and report one entry per statement.
    ///
    /// Consumption continues past failed statements so counts already
    /// produced are kept. A statement whose completion carries the error bit,
    /// or that was preceded by an error message, reports
    /// [`EXECUTE_FAILED`]; one without an update count reports
    /// [`NO_COUNT`]. All errors are chained into [`BatchResult::error`].
    pub async fn execute_batch(&mut self, statements: &[&str]) -> Result<BatchResult> {
        self.submit_sql(&statements.join("\n")).await?;

        let mut counts = Vec::with_capacity(statements.len());
        let mut statement_failed = false;
        loop {
            match self.next_event().await? {
                Event::Message(d) if d.is_error() => statement_failed = true,
                Event::Done(done) if done.cancelled => {}
                Event::Done(done) if done.kind == DoneKind::InProc => {
                    statement_failed |= done.failed;
                }
                Event::Done(done) => {
                    let count = if done.failed || statement_failed {
                        EXECUTE_FAILED
                    } else {
                        done.update_count.unwrap_or(NO_COUNT)
                    };
                    counts.push(count);
                    statement_failed = false;
                }
                Event::End => break,
                _ => {}
            }
        }

        let error = self.check_diagnostics().err();
        Ok(BatchResult { counts, error })
    }

    /// Raise the errors recorded for the current request as one chained
    /// error. Warnings are kept.
    pub fn check_diagnostics(&mut self) -> Result<()> {
        let result = self.session.diagnostics_mut().check();
        if let Err(e) = &result {
            if e.is_fatal() {
                self.closed = true;
            }
        }
        result
    }

    /// Messages recorded for the current request.
    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticChain {
        self.session.diagnostics()
    }

    /// Output and return-value slots of the last procedure call.
    #[must_use]
    pub fn output_params(&self) -> &[OutputParam] {
        self.session.output_params()
    }

    /// Return status of the last procedure call.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.session.return_status()
    }

    /// Get a handle that can cancel requests from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.conn.cancel_handle())
    }

    /// Cancel the outstanding request.
    ///
    /// The response must still be read to the end; it finishes with a
    /// cancelled completion and a "request cancelled" error.
    pub async fn cancel(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.cancel_handle().cancel().await.map(|_| ())
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            tracing::info!(host = %self.config.host, "closing connection");
            self.conn.shutdown().await?;
        }
        Ok(())
    }

    /// Check if the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn version(&self) -> TdsVersion {
        self.session.version()
    }

    /// Server product as reported in the login acknowledgement.
    #[must_use]
    pub fn server_info(&self) -> Option<&LoginAck> {
        self.session.login_ack()
    }

    /// Server version from the pre-login answer.
    #[must_use]
    pub fn server_version(&self) -> Option<(u8, u8, u16)> {
        self.server_version
    }

    /// How the connection is encrypted.
    #[must_use]
    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> &str {
        self.session.database()
    }

    /// Current packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.conn.packet_size()
    }

    /// Session state, for inspection.
    #[must_use]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Configuration the client was created with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("version", &self.session.version())
            .field("encryption", &self.encryption)
            .field("phase", &self.session.phase())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Encoding failures are caller errors; nothing has touched the wire.
fn request_error(err: ProtocolError) -> Error {
    match err {
        ProtocolError::Type(e) => Error::Type(e),
        ProtocolError::ParameterCount {
            placeholders,
            values,
        } => Error::Parameters(format!(
            "{placeholders} parameter markers but {values} values"
        )),
        other => Error::Parameters(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_is_local() {
        let err = request_error(ProtocolError::ParameterCount {
            placeholders: 2,
            values: 1,
        });
        assert_eq!(err.sqlstate(), "07002");
        assert!(!err.is_fatal());

        let err = request_error(ProtocolError::UnsupportedByVersion("RPC"));
        assert!(!err.is_fatal());
    }
}
