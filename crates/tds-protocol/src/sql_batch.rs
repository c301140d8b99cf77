//! SQL batch request encoding.
//!
//! A batch (packet type 0x01) is the SQL text itself: UTF-16LE for TDS 7.x,
//! the session charset for TDS 4.2 and 5.0. TDS 7.0 and 7.1 have no
//! ALL_HEADERS prefix.
//!
//! Values bound to `?` markers in free-form text that cannot travel as an
//! RPC are substituted into the text as literals.

use bytes::Bytes;
use tds_types::{CodecOptions, SqlValue};

use crate::codec::encode_string;
use crate::error::ProtocolError;

/// Encode a SQL batch payload.
///
/// # Example
///
/// ```
/// use tds_protocol::sql_batch::encode_sql_batch;
/// use tds_types::CodecOptions;
///
/// let payload = encode_sql_batch("SELECT 1", &CodecOptions::tds7(true)).unwrap();
/// assert_eq!(payload.len(), 16);
/// ```
pub fn encode_sql_batch(sql: &str, opts: &CodecOptions) -> Result<Bytes, ProtocolError> {
    let (bytes, _) = encode_string(sql, opts)?;
    Ok(Bytes::from(bytes))
}

/// Replace every `?` marker outside string literals, quoted identifiers and
/// comments with the literal form of the matching value.
pub fn substitute_params(
    sql: &str,
    values: &[SqlValue],
    unicode: bool,
) -> Result<String, ProtocolError> {
    let markers = marker_positions(sql);
    if markers.len() != values.len() {
        return Err(ProtocolError::ParameterCount {
            placeholders: markers.len(),
            values: values.len(),
        });
    }

    let mut out = String::with_capacity(sql.len() + values.len() * 8);
    let mut last = 0;
    for (pos, value) in markers.into_iter().zip(values) {
        out.push_str(&sql[last..pos]);
        out.push_str(&value.to_sql_literal(unicode));
        last = pos + 1;
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Text,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Byte offsets of the `?` markers that take a value.
fn marker_positions(sql: &str) -> Vec<usize> {
    let mut markers = Vec::new();
    let mut state = Scan::Text;
    let mut chars = sql.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match state {
            Scan::Text => match c {
                '?' => markers.push(pos),
                '\'' | '"' => state = Scan::Quoted(c),
                '[' => state = Scan::Quoted(']'),
                '-' if matches!(chars.peek(), Some((_, '-'))) => {
                    chars.next();
                    state = Scan::LineComment;
                }
                '/' if matches!(chars.peek(), Some((_, '*'))) => {
                    chars.next();
                    state = Scan::BlockComment;
                }
                _ => {}
            },
            // a doubled closing quote is an escaped quote; re-entering the
            // quoted state on the second one has the same effect
            Scan::Quoted(close) if c == close => state = Scan::Text,
            Scan::Quoted(_) => {}
            Scan::LineComment if c == '\n' => state = Scan::Text,
            Scan::LineComment => {}
            Scan::BlockComment => {
                if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                    chars.next();
                    state = Scan::Text;
                }
            }
        }
    }

    markers
}

/// SQL batch builder with optional bound values.
#[derive(Debug, Clone)]
pub struct SqlBatch {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlBatch {
    /// Create a new SQL batch.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a value to the next `?` marker.
    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Get the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Encode the batch, substituting any bound values.
    pub fn encode(&self, opts: &CodecOptions) -> Result<Bytes, ProtocolError> {
        if self.params.is_empty() {
            return encode_sql_batch(&self.sql, opts);
        }
        let sql = substitute_params(&self.sql, &self.params, opts.unicode)?;
        encode_sql_batch(&sql, opts)
    }
}
