//! Server messages accumulated over a request.
//!
//! Error and Info tokens are not raised mid-decode. They are collected into a
//! [`DiagnosticChain`] and checked at well-defined points (after login, after
//! each result, at the end of a batch) so output parameters and update counts
//! produced by the same response remain visible to the caller.

use std::fmt;

use tds_protocol::ServerMessage;

use crate::error::{Error, Result};

/// Lowest class the server uses for real errors.
const MIN_ERROR_CLASS: u8 = 11;

/// Highest class an informational message may carry.
const MAX_INFO_CLASS: u8 = 9;

/// Class at which the server drops the connection.
pub const FATAL_CLASS: u8 = 20;

/// Whether a record is an error or a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Reported by an Error token.
    Error,
    /// Reported by an Info token.
    Warning,
}

/// One server-reported message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Error or warning.
    pub kind: DiagnosticKind,
    /// Server message number.
    pub number: i32,
    /// Server state byte.
    pub state: u8,
    /// Severity class after clamping.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name.
    pub server: String,
    /// Stored procedure name, empty for batches.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u16,
    sqlstate: Option<&'static str>,
}

impl Diagnostic {
    /// Build an error record.
    #[must_use]
    pub fn error(number: i32, state: u8, class: u8, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            number,
            state,
            class: class.max(MIN_ERROR_CLASS),
            message: message.into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
            sqlstate: None,
        }
    }

    /// Build a warning record.
    #[must_use]
    pub fn warning(number: i32, state: u8, class: u8, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            class: class.min(MAX_INFO_CLASS),
            ..Self::error(number, state, 0, message)
        }
    }

    /// Record for an Error token. A class below 11 is raised to 11.
    #[must_use]
    pub fn from_error(msg: ServerMessage) -> Self {
        Self {
            server: msg.server,
            procedure: msg.procedure,
            line: msg.line,
            ..Self::error(msg.number, msg.state, msg.class, msg.message)
        }
    }

    /// Record for an Info token. The class is capped at 9.
    #[must_use]
    pub fn from_info(msg: ServerMessage) -> Self {
        Self {
            server: msg.server,
            procedure: msg.procedure,
            line: msg.line,
            ..Self::warning(msg.number, msg.state, msg.class, msg.message)
        }
    }

    /// The record appended when the server acknowledges a cancel.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            sqlstate: Some("HY008"),
            ..Self::error(0, 1, MIN_ERROR_CLASS, "Request cancelled")
        }
    }

    /// Check if this is an error record.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }

    /// Check if the server will drop the connection after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.is_error() && self.class >= FATAL_CLASS
    }

    /// Check if this record reports a cancelled request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.sqlstate == Some("HY008")
    }

    /// SQLSTATE for this record.
    #[must_use]
    pub fn sqlstate(&self) -> &'static str {
        if let Some(state) = self.sqlstate {
            return state;
        }
        match (self.kind, self.number) {
            (DiagnosticKind::Error, n) => error_state(n),
            (DiagnosticKind::Warning, 8153) => "01003",
            (DiagnosticKind::Warning, _) => "01000",
        }
    }
}

fn error_state(number: i32) -> &'static str {
    match number {
        102 | 156 | 170 | 229 | 230 => "42000",
        207 => "42S22",
        208 => "42S02",
        515 | 547 | 2601 | 2627 => "23000",
        1205 => "40001",
        2714 => "42S01",
        245 | 8114 => "22018",
        220 | 232 | 8115 => "22003",
        8134 => "22012",
        8152 => "22001",
        18456 => "28000",
        _ => "S1000",
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.number == 0 {
            return f.write_str(&self.message);
        }
        write!(
            f,
            "Msg {}, Level {}, State {}",
            self.number, self.class, self.state
        )?;
        if !self.procedure.is_empty() {
            write!(f, ", Procedure {}", self.procedure)?;
        }
        if self.line > 0 {
            write!(f, ", Line {}", self.line)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Ordered collection of the messages of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticChain {
    records: Vec<Diagnostic>,
}

impl DiagnosticChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: Diagnostic) {
        self.records.push(record);
    }

    /// Append every record of another chain.
    pub fn extend(&mut self, other: DiagnosticChain) {
        self.records.extend(other.records);
    }

    /// All records in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter()
    }

    /// Error records in arrival order.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter().filter(|d| d.is_error())
    }

    /// Warning records in arrival order.
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter().filter(|d| !d.is_error())
    }

    /// First error record.
    #[must_use]
    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.errors().next()
    }

    /// Check if any error record is present.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Move the records out, leaving the chain empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// SQLSTATE of the first error, or of the first record if none is an error.
    #[must_use]
    pub fn sqlstate(&self) -> &'static str {
        self.first_error()
            .or_else(|| self.records.first())
            .map_or("HY000", Diagnostic::sqlstate)
    }

    /// Check if any record has fatal severity.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.records.iter().any(Diagnostic::is_fatal)
    }

    /// Check if the chain reports a cancelled request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.records.iter().any(Diagnostic::is_cancelled)
    }

    /// Raise the accumulated errors as one chained error.
    ///
    /// Returns `Ok` when only warnings are present; warnings stay in the
    /// chain. On error the whole chain, warnings included, moves into the
    /// returned [`Error::Server`].
    pub fn check(&mut self) -> Result<()> {
        if self.has_errors() {
            return Err(Error::Server(self.take()));
        }
        Ok(())
    }
}

impl fmt::Display for DiagnosticChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.errors();
        match errors.next() {
            Some(first) => write!(f, "{first}")?,
            None => return f.write_str("no server errors"),
        }
        let more = errors.count();
        if more > 0 {
            write!(f, " (and {more} more)")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a DiagnosticChain {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message(class: u8) -> ServerMessage {
        ServerMessage {
            number: 50000,
            state: 1,
            class,
            message: "boom".into(),
            server: "srv".into(),
            procedure: "p".into(),
            line: 3,
        }
    }

    #[test]
    fn test_error_class_raised_to_eleven() {
        let d = Diagnostic::from_error(message(5));
        assert_eq!(d.class, 11);
        assert!(d.is_error());
        assert_eq!(d.procedure, "p");
        assert_eq!(d.line, 3);
    }

    #[test]
    fn test_info_class_capped_at_nine() {
        let d = Diagnostic::from_info(message(15));
        assert_eq!(d.class, 9);
        assert!(!d.is_error());
        assert!(!d.is_fatal());
        assert_eq!(d.sqlstate(), "01000");
    }

    #[test]
    fn test_fatal_class() {
        assert!(Diagnostic::from_error(message(20)).is_fatal());
        assert!(!Diagnostic::from_error(message(19)).is_fatal());
    }

    #[test]
    fn test_cancelled_record() {
        let d = Diagnostic::cancelled();
        assert!(d.is_cancelled());
        assert_eq!(d.sqlstate(), "HY008");
        assert!(!d.is_fatal());
    }

    #[test]
    fn test_check_only_warnings() {
        let mut chain = DiagnosticChain::new();
        chain.push(Diagnostic::warning(5701, 2, 0, "Changed database context"));
        assert!(chain.check().is_ok());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_check_chains_all_records() {
        let mut chain = DiagnosticChain::new();
        chain.push(Diagnostic::warning(5701, 2, 0, "Changed database context"));
        chain.push(Diagnostic::error(208, 1, 16, "Invalid object name 't'."));
        chain.push(Diagnostic::error(2627, 1, 14, "duplicate key"));

        let err = chain.check().unwrap_err();
        assert!(chain.is_empty());

        let inner = err.diagnostics().unwrap();
        assert_eq!(inner.len(), 3);
        assert_eq!(inner.sqlstate(), "42S02");
        assert_eq!(err.to_string(), "Msg 208, Level 16, State 1: Invalid object name 't'. (and 1 more)");
    }
}
