//! SQL value representation.

use bytes::Bytes;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use uuid::Uuid;

/// A value decoded from, or destined for, the TDS wire.
///
/// `Null` is distinct from an empty `String` or `Binary`; the codec keeps
/// the two apart in every length family.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    #[default]
    Null,
    /// Boolean value (BIT).
    Bool(bool),
    /// 8-bit unsigned integer (TINYINT).
    TinyInt(u8),
    /// 16-bit signed integer (SMALLINT).
    SmallInt(i16),
    /// 32-bit signed integer (INT).
    Int(i32),
    /// 64-bit signed integer (BIGINT).
    BigInt(i64),
    /// 32-bit floating point (REAL).
    Float(f32),
    /// 64-bit floating point (FLOAT).
    Double(f64),
    /// Exact numeric (DECIMAL, NUMERIC, MONEY, SMALLMONEY).
    Decimal(Decimal),
    /// Character data (CHAR, VARCHAR, NCHAR, NVARCHAR, TEXT, NTEXT).
    String(String),
    /// Binary data (BINARY, VARBINARY, IMAGE).
    Binary(Bytes),
    /// UNIQUEIDENTIFIER.
    Uuid(Uuid),
    /// DATETIME and SMALLDATETIME.
    DateTime(NaiveDateTime),
}

impl SqlValue {
    /// Check if the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the value as a bool, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as an i32 if it is an integer that fits.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::SmallInt(v) => Some(i32::from(*v)),
            Self::TinyInt(v) => Some(i32::from(*v)),
            Self::BigInt(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get the value as an i64 if it is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::BigInt(v) => Some(*v),
            Self::Int(v) => Some(i64::from(*v)),
            Self::SmallInt(v) => Some(i64::from(*v)),
            Self::TinyInt(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Get the value as an f64, if it is floating point.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Get the value as a decimal, if it is an exact numeric.
    #[must_use]
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as a string slice, if it is character data.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Get the value as bytes, if it is binary.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    /// Name of the variant, used in conversion errors.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BIT",
            Self::TinyInt(_) => "TINYINT",
            Self::SmallInt(_) => "SMALLINT",
            Self::Int(_) => "INT",
            Self::BigInt(_) => "BIGINT",
            Self::Float(_) => "REAL",
            Self::Double(_) => "FLOAT",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Binary(_) => "VARBINARY",
            Self::Uuid(_) => "UNIQUEIDENTIFIER",
            Self::DateTime(_) => "DATETIME",
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u8> for SqlValue {
    fn from(v: u8) -> Self {
        Self::TinyInt(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        Self::SmallInt(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for SqlValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_not_empty() {
        assert!(SqlValue::Null.is_null());
        assert!(!SqlValue::from("").is_null());
        assert!(!SqlValue::from(Vec::<u8>::new()).is_null());
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(SqlValue::TinyInt(7).as_i32(), Some(7));
        assert_eq!(SqlValue::SmallInt(-3).as_i64(), Some(-3));
        assert_eq!(SqlValue::BigInt(i64::MAX).as_i32(), None);
        assert_eq!(SqlValue::String("1".into()).as_i32(), None);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<i32>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(5i32)), SqlValue::Int(5));
    }
}
