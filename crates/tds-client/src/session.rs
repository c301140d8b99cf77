//! Session state and the token fold.
//!
//! Decoding a token is a pure function in `tds-protocol`. This module holds
//! the other half: [`SessionState::apply`] folds one decoded [`Token`] into
//! the session and reports what the caller should see. Nothing here touches
//! the wire, so every rule can be exercised with hand-built tokens.
//!
//! The state machine is:
//!
//! ```text
//! Idle --submit--> InResponse --ColMetaData--> InResultSet
//!                      ^                            |
//!                      +------ Done(MORE) ----------+
//!        Done(!MORE) returns to Idle from either state
//! ```

use std::sync::Arc;

use tds_protocol::token::{
    ColumnData, ColumnInfo, Done, DoneStatus, EnvChange, LoginAck, ReturnValue, TableName, Token,
};
use tds_protocol::version::TdsVersion;
use tds_types::{CodecOptions, ParamDescriptor, ParamDirection, SqlValue, encoding_for_charset};

use crate::config::ServerType;
use crate::diagnostics::{Diagnostic, DiagnosticChain};

/// Where the session is in the request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No response pending.
    Idle,
    /// Consuming tokens of a response.
    InResponse,
    /// A result set is open; rows may follow.
    InResultSet,
}

/// Which Done token completed a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKind {
    /// A statement of a batch.
    Done,
    /// A stored procedure.
    Proc,
    /// A statement inside a stored procedure.
    InProc,
}

/// A statement completion as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Token that carried the completion.
    pub kind: DoneKind,
    /// Update count, when the server reported a meaningful one.
    pub update_count: Option<i32>,
    /// The statement failed.
    pub failed: bool,
    /// More results follow in this response.
    pub more: bool,
    /// The server acknowledged a cancel.
    pub cancelled: bool,
}

/// One step of a response, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A result set started; rows follow.
    ResultSet(Arc<[ColumnData]>),
    /// One row, one value per column of the current result set.
    Row(Vec<SqlValue>),
    /// A statement completed.
    Done(Completion),
    /// An output parameter was filled.
    OutputParam {
        /// Position of the parameter in the request.
        index: usize,
        /// Returned value.
        value: SqlValue,
    },
    /// Procedure return status.
    ReturnStatus(i32),
    /// A server message was recorded.
    Message(Diagnostic),
    /// The response is complete.
    End,
}

/// Result of folding one token.
#[derive(Debug, Default)]
pub struct Applied {
    /// What the caller should see, if anything.
    pub event: Option<Event>,
    /// New packet size to apply to outbound packets.
    pub packet_size: Option<usize>,
    /// A Done acknowledged the pending cancel.
    pub cancel_acknowledged: bool,
    /// The server will drop the connection; close it.
    pub close: bool,
}

impl Applied {
    fn event(event: Event) -> Self {
        Self {
            event: Some(event),
            ..Self::default()
        }
    }
}

/// An output or return-value parameter slot of the current request.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputParam {
    /// Position in the request's parameter list.
    pub index: usize,
    /// Declared name.
    pub name: String,
    /// Whether this is the function return-value slot.
    pub is_return: bool,
    /// Value returned by the server, `None` until filled.
    pub value: Option<SqlValue>,
}

/// Output slots of one request, filled in declared order.
#[derive(Debug, Clone, Default)]
pub struct OutputSlots {
    slots: Vec<OutputParam>,
    cursor: usize,
}

impl OutputSlots {
    /// Slots for the output and return-value parameters of a request.
    #[must_use]
    pub fn from_params(params: &[ParamDescriptor]) -> Self {
        let slots = params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.direction.is_output())
            .map(|(index, p)| OutputParam {
                index,
                name: p.name.clone(),
                is_return: p.direction == ParamDirection::Return,
                value: None,
            })
            .collect();
        Self { slots, cursor: 0 }
    }

    /// All slots in declared order.
    #[must_use]
    pub fn as_slice(&self) -> &[OutputParam] {
        &self.slots
    }

    fn return_slot(&mut self) -> Option<&mut OutputParam> {
        self.slots.iter_mut().find(|s| s.is_return)
    }

    fn has_open_return_slot(&self) -> bool {
        self.slots.iter().any(|s| s.is_return && s.value.is_none())
    }

    fn fill_return(&mut self, value: SqlValue) -> Option<usize> {
        let slot = self.return_slot()?;
        if slot.value.is_some() {
            return None;
        }
        slot.value = Some(value);
        Some(slot.index)
    }

    fn fill_next(&mut self, value: SqlValue) -> Option<usize> {
        while let Some(slot) = self.slots.get_mut(self.cursor) {
            self.cursor += 1;
            if !slot.is_return && slot.value.is_none() {
                slot.value = Some(value);
                return Some(slot.index);
            }
        }
        None
    }
}

/// Mutable state of one session.
///
/// Owned by the connection and mutated only by the task holding it; the
/// cancel flag is the one piece of state shared with other tasks and lives
/// in the transport.
#[derive(Debug)]
pub struct SessionState {
    version: TdsVersion,
    opts: CodecOptions,
    server_type: ServerType,
    phase: Phase,
    columns: Vec<ColumnData>,
    column_names: Vec<String>,
    tables: Vec<TableName>,
    param_formats: Vec<ColumnData>,
    diagnostics: DiagnosticChain,
    end_of_response: bool,
    end_of_results: bool,
    fatal_seen: bool,
    return_status: Option<i32>,
    outputs: OutputSlots,
    packet_size: usize,
    database: String,
    language: String,
    charset: String,
    login_ack: Option<LoginAck>,
}

impl SessionState {
    /// Fresh state for a session requesting `version`.
    #[must_use]
    pub fn new(version: TdsVersion, server_type: ServerType, packet_size: usize) -> Self {
        Self {
            version,
            opts: version.codec_options(),
            server_type,
            phase: Phase::Idle,
            columns: Vec::new(),
            column_names: Vec::new(),
            tables: Vec::new(),
            param_formats: Vec::new(),
            diagnostics: DiagnosticChain::new(),
            end_of_response: true,
            end_of_results: true,
            fatal_seen: false,
            return_status: None,
            outputs: OutputSlots::default(),
            packet_size,
            database: String::new(),
            language: String::new(),
            charset: String::new(),
            login_ack: None,
        }
    }

    /// Bound the size of single decoded values.
    pub fn set_max_value_size(&mut self, limit: usize) {
        self.opts.max_value_size = limit;
    }

    /// Reset per-response state before a request is sent.
    pub fn begin_request(&mut self, outputs: OutputSlots) {
        self.phase = Phase::InResponse;
        self.diagnostics.clear();
        self.end_of_response = false;
        self.end_of_results = true;
        self.fatal_seen = false;
        self.return_status = None;
        self.param_formats.clear();
        self.outputs = outputs;
    }

    /// Fold one decoded token into the session.
    ///
    /// `cancel_pending` says whether a cancel is outstanding for this
    /// request. For a final Done it must come from the same atomic step that
    /// ends the request on the transport.
    pub fn apply(&mut self, token: Token, cancel_pending: bool) -> Applied {
        match token {
            Token::Done(done) => self.apply_done(DoneKind::Done, done, cancel_pending),
            Token::DoneProc(done) => self.apply_done(DoneKind::Proc, done, cancel_pending),
            Token::DoneInProc(done) => self.apply_done(DoneKind::InProc, done, cancel_pending),
            Token::ColMetaData(meta) => {
                self.columns = meta.columns;
                self.tables.clear();
                self.open_result_set()
            }
            Token::NoMetaData => self.open_result_set(),
            Token::ColName(names) => {
                self.column_names = names;
                Applied::default()
            }
            Token::ColFmt(mut formats) => {
                for (column, name) in formats.iter_mut().zip(self.column_names.drain(..)) {
                    column.name = name;
                }
                self.columns = formats;
                self.tables.clear();
                self.open_result_set()
            }
            Token::ParamFmt(formats) => {
                self.param_formats = formats;
                Applied::default()
            }
            Token::Params(values) => {
                let mut applied = Applied::default();
                for rv in values {
                    if let Some(event) = self.apply_return_value(rv).event {
                        applied.event = Some(event);
                    }
                }
                applied
            }
            Token::Row(values) => {
                self.end_of_results = false;
                Applied::event(Event::Row(values))
            }
            Token::Error(msg) => {
                let record = Diagnostic::from_error(msg);
                if record.is_fatal() {
                    self.fatal_seen = true;
                    tracing::warn!(
                        number = record.number,
                        class = record.class,
                        message = %record.message,
                        "server reported a fatal error"
                    );
                }
                self.diagnostics.push(record.clone());
                Applied::event(Event::Message(record))
            }
            Token::Info(msg) => {
                let record = Diagnostic::from_info(msg);
                self.diagnostics.push(record.clone());
                Applied::event(Event::Message(record))
            }
            Token::EnvChange(change) => self.apply_env_change(change),
            Token::LoginAck(ack) => {
                self.apply_login_ack(ack);
                Applied::default()
            }
            Token::ReturnValue(rv) => self.apply_return_value(rv),
            Token::ReturnStatus(status) => {
                self.return_status = Some(status);
                self.outputs.fill_return(SqlValue::Int(status));
                Applied::event(Event::ReturnStatus(status))
            }
            Token::TabName(tables) => {
                self.tables = tables;
                Applied::default()
            }
            Token::ColInfo(infos) => {
                self.backfill_column_info(&infos);
                Applied::default()
            }
            Token::Order(_)
            | Token::Control
            | Token::Offsets
            | Token::ProcId(_)
            | Token::Capability => Applied::default(),
        }
    }

    fn open_result_set(&mut self) -> Applied {
        self.end_of_results = false;
        self.phase = Phase::InResultSet;
        Applied::event(Event::ResultSet(self.columns_snapshot()))
    }

    fn apply_done(&mut self, kind: DoneKind, mut done: Done, cancel_pending: bool) -> Applied {
        if self.end_of_response {
            return Applied::event(Event::End);
        }

        let mut applied = Applied::default();

        // A second completion for the same result (Sybase) or the count of a
        // SELECT is not an update count.
        if !self.end_of_results {
            done.status.remove(DoneStatus::COUNT);
            self.end_of_results = true;
        }

        let mut cancel_pending = cancel_pending;
        if done.is_attention() {
            cancel_pending = false;
            applied.cancel_acknowledged = true;
            self.diagnostics.push(Diagnostic::cancelled());
            tracing::debug!("cancel acknowledged");
        }

        if done.has_more() {
            self.phase = Phase::InResponse;
        } else {
            self.end_of_response = !cancel_pending;
            if self.end_of_response {
                self.phase = Phase::Idle;
            }
            if self.fatal_seen {
                applied.close = true;
            }
        }

        // Only the low byte carries the operation.
        if self.server_type == ServerType::SqlServer
            && (done.cur_cmd & 0xFF) == Done::DDL_OPERATION
        {
            done.status.remove(DoneStatus::COUNT);
        }

        applied.event = Some(Event::Done(Completion {
            kind,
            update_count: done.has_count().then_some(done.row_count),
            failed: done.has_error(),
            more: done.has_more(),
            cancelled: done.is_attention(),
        }));
        applied
    }

    fn apply_env_change(&mut self, change: EnvChange) -> Applied {
        let mut applied = Applied::default();
        match change {
            EnvChange::Database { new, .. } => {
                tracing::debug!(database = %new, "database changed");
                self.database = new;
            }
            EnvChange::Language { new, .. } => {
                tracing::debug!(language = %new, "language changed");
                self.language = new;
            }
            EnvChange::Charset { new, .. } => {
                match encoding_for_charset(&new) {
                    Some(encoding) => self.opts.charset = encoding,
                    None => tracing::debug!(charset = %new, "unknown charset, keeping current"),
                }
                self.charset = new;
            }
            EnvChange::PacketSize { new, .. } => {
                tracing::debug!(packet_size = new, "packet size changed");
                self.packet_size = new;
                applied.packet_size = Some(new);
            }
            EnvChange::Collation(collation) => {
                self.opts.default_collation = Some(collation);
            }
            EnvChange::LocaleId { .. } => {}
            EnvChange::Ignored(kind) => {
                tracing::trace!(kind, "skipped env change");
            }
        }
        applied
    }

    fn apply_login_ack(&mut self, ack: LoginAck) {
        tracing::debug!(
            program = %ack.program,
            version = %ack.tds_version,
            "login acknowledged"
        );
        let previous = self.opts;
        self.version = ack.tds_version;
        self.opts = self.version.codec_options();
        self.opts.charset = previous.charset;
        self.opts.default_collation = previous.default_collation;
        self.opts.max_value_size = previous.max_value_size;
        self.login_ack = Some(ack);
    }

    fn apply_return_value(&mut self, rv: ReturnValue) -> Applied {
        if !rv.name.is_empty() && !rv.name.starts_with('@') {
            tracing::warn!(name = %rv.name, "ignoring spurious output parameter");
            return Applied::default();
        }

        let function_return = self.version.supports_collations()
            && self.outputs.has_open_return_slot()
            && (rv.is_udf_return() || !rv.column_type.type_id.is_integer());

        let index = if function_return {
            self.outputs.fill_return(rv.value.clone())
        } else {
            self.outputs.fill_next(rv.value.clone())
        };

        match index {
            Some(index) => Applied::event(Event::OutputParam {
                index,
                value: rv.value,
            }),
            None => {
                tracing::warn!(name = %rv.name, "output parameter with no matching slot");
                Applied::default()
            }
        }
    }

    fn backfill_column_info(&mut self, infos: &[ColumnInfo]) {
        for info in infos {
            let Some(column) = usize::from(info.column)
                .checked_sub(1)
                .and_then(|i| self.columns.get_mut(i))
            else {
                continue;
            };
            if let Some(table) = usize::from(info.table)
                .checked_sub(1)
                .and_then(|i| self.tables.get(i))
            {
                column.table = Some(table.clone());
            }
            if let Some(base) = &info.base_name {
                column.base_name = Some(base.clone());
            }
        }
    }

    /// Current result-set columns.
    #[must_use]
    pub fn columns(&self) -> &[ColumnData] {
        &self.columns
    }

    /// Formats of the output parameters the next PARAMS token carries.
    #[must_use]
    pub fn param_formats(&self) -> &[ColumnData] {
        &self.param_formats
    }

    /// Shared copy of the current columns.
    #[must_use]
    pub fn columns_snapshot(&self) -> Arc<[ColumnData]> {
        Arc::from(self.columns.as_slice())
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn version(&self) -> TdsVersion {
        self.version
    }

    /// Codec options for the current session settings.
    #[must_use]
    pub fn codec_options(&self) -> &CodecOptions {
        &self.opts
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Check if the response has been fully consumed.
    #[must_use]
    pub fn is_end_of_response(&self) -> bool {
        self.end_of_response
    }

    /// Check if an error of fatal severity was seen in this response.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal_seen
    }

    /// Mark the session fatal after a transport or decode failure.
    pub fn mark_fatal(&mut self) {
        self.fatal_seen = true;
        self.end_of_response = true;
        self.phase = Phase::Idle;
    }

    /// Messages recorded for the current request.
    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticChain {
        &self.diagnostics
    }

    /// Mutable access to the recorded messages.
    pub fn diagnostics_mut(&mut self) -> &mut DiagnosticChain {
        &mut self.diagnostics
    }

    /// Return status of the last procedure call.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    /// Output slots of the current request.
    #[must_use]
    pub fn output_params(&self) -> &[OutputParam] {
        self.outputs.as_slice()
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Current session language.
    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Current charset name as reported by the server.
    #[must_use]
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// Current packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Login acknowledgement, once received.
    #[must_use]
    pub fn login_ack(&self) -> Option<&LoginAck> {
        self.login_ack.as_ref()
    }

    /// Server product.
    #[must_use]
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }
}
