//! Canned server conversations.
//!
//! Token scripts for responses that are tedious to build by hand and that
//! several test suites need.

use tds_protocol::{DoneStatus, TdsVersion};
use tds_types::{SqlValue, TypeId};

use crate::mock_server::{MockResponse, Result, TokenWriter};

/// Outcome of one statement in a scripted batch.
#[derive(Debug, Clone)]
pub enum Statement {
    /// Succeeded with an update count.
    Count(i32),
    /// Succeeded without an update count.
    NoCount,
    /// Failed with an error message.
    Fails {
        /// Error number.
        number: i32,
        /// Error message.
        message: String,
    },
}

/// A batch of DML statements, one completion per statement.
///
/// SQL Server reports a failed statement with an error message and a
/// completion carrying the error bit. Sybase sends the message followed by a
/// plain completion, so the error bit is left off for it.
pub fn update_batch(version: TdsVersion, statements: &[Statement]) -> Result<MockResponse> {
    let mut writer = TokenWriter::new(version);
    let last = statements.len().saturating_sub(1);
    for (i, statement) in statements.iter().enumerate() {
        let more = i < last;
        let mut status = DoneStatus::empty();
        status.set(DoneStatus::MORE, more);
        writer = match statement {
            Statement::Count(n) => writer.update_count(*n, more),
            Statement::NoCount => writer.done(status, 0, 0),
            Statement::Fails { number, message } => {
                if version.is_tds7() {
                    status.insert(DoneStatus::ERROR);
                }
                writer.error(*number, 16, message).done(status, 0, 0)
            }
        };
    }
    Ok(MockResponse::Tokens(writer.finish()?))
}

/// A procedure that updates `count` rows, sets its output parameters and
/// returns `status`.
///
/// Output values are sent in parameter order, each named after its parameter.
pub fn procedure_call(
    version: TdsVersion,
    count: i32,
    outputs: &[(&str, SqlValue)],
    status: i32,
) -> Result<MockResponse> {
    let mut writer = TokenWriter::new(version).done_in_proc(
        DoneStatus::COUNT | DoneStatus::MORE,
        0xC5,
        count,
    );
    writer = writer.return_status(status);
    for (name, value) in outputs {
        writer = writer.return_value(name, 0x01, value, None);
    }
    writer = writer.done_proc(DoneStatus::empty(), 0);
    Ok(MockResponse::Tokens(writer.finish()?))
}

/// A scalar function call: the function value arrives as a UDF return value
/// ahead of the procedure return status.
pub fn function_call(version: TdsVersion, value: SqlValue, wire_type: TypeId) -> Result<MockResponse> {
    let writer = TokenWriter::new(version)
        .return_value("", 0x02, &value, Some(wire_type))
        .return_status(0)
        .done_proc(DoneStatus::empty(), 0);
    Ok(MockResponse::Tokens(writer.finish()?))
}

/// A response the server aborts with a fatal error.
pub fn fatal_error(version: TdsVersion, number: i32, message: &str) -> Result<MockResponse> {
    let writer = TokenWriter::new(version)
        .error(number, 20, message)
        .done(DoneStatus::ERROR, 0, 0);
    Ok(MockResponse::Tokens(writer.finish()?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_update_batch_is_tokens() {
        let response = update_batch(
            TdsVersion::V5_0,
            &[
                Statement::Count(1),
                Statement::Fails {
                    number: 2601,
                    message: "duplicate key".into(),
                },
                Statement::Count(1),
            ],
        )
        .unwrap();
        match response {
            MockResponse::Tokens(bytes) => assert!(!bytes.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
