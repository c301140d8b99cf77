//! Collected responses.

use std::sync::Arc;

use tds_protocol::token::ColumnData;
use tds_types::SqlValue;

use crate::diagnostics::DiagnosticChain;
use crate::error::Error;
use crate::session::OutputParam;

/// Batch entry for a statement that produced no update count.
pub const NO_COUNT: i32 = -1;

/// Batch entry for a statement that failed.
pub const EXECUTE_FAILED: i32 = -3;

/// One result set with all of its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    /// Column descriptors.
    pub columns: Arc<[ColumnData]>,
    /// Rows, one value per column.
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    /// Index of the column with the given name, ignoring ASCII case.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// First value of the first row.
    #[must_use]
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Everything a request produced.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Result sets in arrival order.
    pub result_sets: Vec<ResultSet>,
    /// Update counts of statements that reported one.
    pub update_counts: Vec<i32>,
    /// Procedure return status.
    pub return_status: Option<i32>,
    /// Output and return-value parameter slots.
    pub output_params: Vec<OutputParam>,
    /// Warnings the server sent.
    pub warnings: DiagnosticChain,
}

impl Response {
    /// First result set, if any.
    #[must_use]
    pub fn first(&self) -> Option<&ResultSet> {
        self.result_sets.first()
    }

    /// First value of the first result set.
    #[must_use]
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.first().and_then(ResultSet::scalar)
    }

    /// Sum of all update counts.
    #[must_use]
    pub fn rows_affected(&self) -> i64 {
        self.update_counts.iter().map(|&c| i64::from(c)).sum()
    }

    /// Value of the output parameter with the given name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&SqlValue> {
        self.output_params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_ref())
    }

    /// Value of the function return-value slot.
    #[must_use]
    pub fn return_value(&self) -> Option<&SqlValue> {
        self.output_params
            .iter()
            .find(|p| p.is_return)
            .and_then(|p| p.value.as_ref())
    }
}

/// Outcome of a statement batch.
#[derive(Debug)]
pub struct BatchResult {
    /// One entry per completed statement: the update count, [`NO_COUNT`]
    /// or [`EXECUTE_FAILED`].
    pub counts: Vec<i32>,
    /// Every server error of the batch, chained, if any statement failed.
    pub error: Option<Error>,
}

impl BatchResult {
    /// Check if every statement succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.counts.contains(&EXECUTE_FAILED)
    }
}
