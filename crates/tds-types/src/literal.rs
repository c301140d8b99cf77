//! SQL literal rendering for statements sent without RPC parameters.

use std::fmt::Write;

use crate::value::SqlValue;

impl SqlValue {
    /// Render this value as a SQL literal.
    ///
    /// With `unicode` set, strings become `N'...'` literals so characters
    /// outside the server code page survive.
    #[must_use]
    pub fn to_sql_literal(&self, unicode: bool) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Self::TinyInt(v) => v.to_string(),
            Self::SmallInt(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::BigInt(v) => v.to_string(),
            Self::Float(v) => float_literal(f64::from(*v)),
            Self::Double(v) => float_literal(*v),
            Self::Decimal(d) => d.to_string(),
            Self::String(s) => {
                let escaped = s.replace('\'', "''");
                if unicode {
                    format!("N'{escaped}'")
                } else {
                    format!("'{escaped}'")
                }
            }
            Self::Binary(b) => {
                let mut out = String::with_capacity(2 + b.len() * 2);
                out.push_str("0x");
                for byte in b.iter() {
                    let _ = write!(out, "{byte:02X}");
                }
                out
            }
            Self::Uuid(u) => format!("'{u}'"),
            Self::DateTime(dt) => format!("'{}'", dt.format("%Y%m%d %H:%M:%S%.3f")),
        }
    }
}

fn float_literal(v: f64) -> String {
    if v.is_finite() {
        format!("{v:e}")
    } else {
        "NULL".to_string()
    }
}
