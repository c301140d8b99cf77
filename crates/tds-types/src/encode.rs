//! Encoding of parameter type descriptors and values.

use bytes::{BufMut, BytesMut};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rust_decimal::Decimal;

use crate::collation::{COLLATION_LEN, Collation};
use crate::column::{CodecOptions, ColumnType};
use crate::error::TypeError;
use crate::param::ParamDescriptor;
use crate::type_id::{LengthFamily, TypeId};
use crate::value::SqlValue;

/// Largest two-byte-length value in bytes.
const SHORT_MAX: usize = 8000;
/// Largest one-byte-length value in bytes.
const BYTE_MAX: usize = 255;
/// Largest declared length for TEXT/NTEXT/IMAGE parameters.
const LONG_MAX: u32 = 0x7FFF_FFFF;

/// Choose the wire type a parameter is declared with.
///
/// An explicit wire type is widened to its nullable form; otherwise the type
/// is inferred from the value and the negotiated protocol level.
pub fn resolve_param_type(
    param: &ParamDescriptor,
    opts: &CodecOptions,
) -> Result<ColumnType, TypeError> {
    let col = match param.wire_type {
        Some(explicit) => nullable_type(explicit, param.scale, opts)?,
        None => infer_type(&param.value, opts)?,
    };
    Ok(attach_charset(col, opts))
}

fn attach_charset(col: ColumnType, opts: &CodecOptions) -> ColumnType {
    if !col.type_id.is_character() {
        return col;
    }
    match opts.default_collation {
        Some(collation) if opts.collations => col.with_collation(collation),
        _ => col.with_encoding(opts.charset),
    }
}

fn max_precision(opts: &CodecOptions) -> u8 {
    if opts.collations || !opts.unicode { 38 } else { 28 }
}

fn nullable_type(id: TypeId, scale: u8, opts: &CodecOptions) -> Result<ColumnType, TypeError> {
    let col = match id {
        TypeId::Int1 => ColumnType::new(TypeId::IntN).with_length(1),
        TypeId::Int2 => ColumnType::new(TypeId::IntN).with_length(2),
        TypeId::Int4 | TypeId::IntN => ColumnType::new(TypeId::IntN).with_length(4),
        TypeId::Int8 => ColumnType::new(TypeId::IntN).with_length(8),
        TypeId::Bit | TypeId::BitN => ColumnType::new(TypeId::BitN),
        TypeId::Float4 => ColumnType::new(TypeId::FloatN).with_length(4),
        TypeId::Float8 | TypeId::FloatN => ColumnType::new(TypeId::FloatN),
        TypeId::Money | TypeId::MoneyN => ColumnType::new(TypeId::MoneyN),
        TypeId::Money4 => ColumnType::new(TypeId::MoneyN).with_length(4),
        TypeId::DateTime | TypeId::DateTimeN => ColumnType::new(TypeId::DateTimeN),
        TypeId::DateTime4 => ColumnType::new(TypeId::DateTimeN).with_length(4),
        TypeId::Decimal | TypeId::DecimalN => {
            ColumnType::new(TypeId::DecimalN).with_precision(max_precision(opts), scale)
        }
        TypeId::Numeric | TypeId::NumericN => {
            ColumnType::new(TypeId::NumericN).with_precision(max_precision(opts), scale)
        }
        TypeId::Null | TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar => {
            if opts.unicode {
                ColumnType::new(TypeId::BigVarChar)
            } else {
                ColumnType::new(TypeId::VarChar)
            }
        }
        TypeId::Binary | TypeId::VarBinary | TypeId::BigBinary | TypeId::BigVarBinary => {
            if opts.unicode {
                ColumnType::new(TypeId::BigVarBinary)
            } else {
                ColumnType::new(TypeId::VarBinary)
            }
        }
        TypeId::NChar | TypeId::NVarChar => ColumnType::new(TypeId::NVarChar),
        TypeId::Guid | TypeId::Text | TypeId::Image | TypeId::NText => ColumnType::new(id),
        TypeId::Variant => {
            return Err(TypeError::UnsupportedConversion {
                from: "SQL_VARIANT".to_string(),
                to: "parameter",
            });
        }
    };

    let needs_tds7 = matches!(
        col.type_id.length_family(),
        LengthFamily::Short
    ) || matches!(col.type_id, TypeId::Guid | TypeId::NText)
        || (col.type_id == TypeId::IntN && col.max_length == 8);
    if needs_tds7 && !opts.unicode {
        return Err(TypeError::UnsupportedConversion {
            from: format!("{:?}", col.type_id),
            to: "TDS 5.0 parameter",
        });
    }
    Ok(col)
}

fn infer_type(value: &SqlValue, opts: &CodecOptions) -> Result<ColumnType, TypeError> {
    let col = match value {
        SqlValue::Null => {
            if opts.unicode {
                ColumnType::new(TypeId::NVarChar)
            } else {
                ColumnType::new(TypeId::VarChar)
            }
        }
        SqlValue::Bool(_) => ColumnType::new(TypeId::BitN),
        SqlValue::TinyInt(_) => ColumnType::new(TypeId::IntN).with_length(1),
        SqlValue::SmallInt(_) => ColumnType::new(TypeId::IntN).with_length(2),
        SqlValue::Int(_) => ColumnType::new(TypeId::IntN).with_length(4),
        SqlValue::BigInt(_) if opts.unicode => ColumnType::new(TypeId::IntN).with_length(8),
        SqlValue::BigInt(_) => ColumnType::new(TypeId::NumericN).with_precision(19, 0),
        SqlValue::Float(_) => ColumnType::new(TypeId::FloatN).with_length(4),
        SqlValue::Double(_) => ColumnType::new(TypeId::FloatN),
        SqlValue::Decimal(d) => {
            let scale = u8::try_from(d.scale()).map_err(|_| TypeError::OutOfRange {
                target_type: "DECIMAL",
            })?;
            ColumnType::new(TypeId::DecimalN).with_precision(max_precision(opts), scale)
        }
        SqlValue::String(s) if opts.unicode => {
            if s.encode_utf16().count() * 2 <= SHORT_MAX {
                ColumnType::new(TypeId::NVarChar)
            } else {
                ColumnType::new(TypeId::NText).with_length(LONG_MAX)
            }
        }
        SqlValue::String(s) => {
            let (bytes, _, _) = opts.charset.encode(s);
            if bytes.len() <= BYTE_MAX {
                ColumnType::new(TypeId::VarChar)
            } else {
                ColumnType::new(TypeId::Text).with_length(LONG_MAX)
            }
        }
        SqlValue::Binary(b) => match (opts.unicode, b.len()) {
            (true, n) if n <= SHORT_MAX => ColumnType::new(TypeId::BigVarBinary),
            (false, n) if n <= BYTE_MAX => ColumnType::new(TypeId::VarBinary),
            _ => ColumnType::new(TypeId::Image).with_length(LONG_MAX),
        },
        SqlValue::Uuid(_) if opts.unicode => ColumnType::new(TypeId::Guid),
        SqlValue::Uuid(_) => {
            return Err(TypeError::UnsupportedConversion {
                from: "UNIQUEIDENTIFIER".to_string(),
                to: "TDS 5.0 parameter",
            });
        }
        SqlValue::DateTime(_) => ColumnType::new(TypeId::DateTimeN),
    };
    Ok(col)
}

/// Write a parameter type descriptor.
pub fn encode_type(col: &ColumnType, opts: &CodecOptions, dst: &mut BytesMut) {
    dst.put_u8(col.type_id as u8);
    match col.type_id.length_family() {
        LengthFamily::Fixed(_) => {}
        LengthFamily::Byte => {
            dst.put_u8(u8::try_from(col.max_length).unwrap_or(u8::MAX));
            if col.type_id.is_decimal() {
                dst.put_u8(col.precision);
                dst.put_u8(col.scale);
            }
        }
        LengthFamily::Short => {
            dst.put_u16_le(u16::try_from(col.max_length).unwrap_or(u16::MAX));
            put_collation(col, opts, dst);
        }
        LengthFamily::Long => {
            dst.put_u32_le(col.max_length);
            put_collation(col, opts, dst);
        }
        LengthFamily::Variant => dst.put_u32_le(col.max_length),
    }
}

fn put_collation(col: &ColumnType, opts: &CodecOptions, dst: &mut BytesMut) {
    if col.type_id.is_character() && opts.collations {
        let bytes = col
            .collation
            .map_or([0u8; COLLATION_LEN], Collation::to_bytes);
        dst.put_slice(&bytes);
    }
}

/// Write a parameter value in the layout its declared type requires.
pub fn encode_value(
    value: &SqlValue,
    col: &ColumnType,
    opts: &CodecOptions,
    dst: &mut BytesMut,
) -> Result<(), TypeError> {
    if value.is_null() {
        match col.type_id.length_family() {
            LengthFamily::Fixed(_) => return Err(TypeError::UnexpectedNull),
            LengthFamily::Byte => dst.put_u8(0),
            LengthFamily::Short => dst.put_u16_le(0xFFFF),
            LengthFamily::Long => dst.put_u32_le(0xFFFF_FFFF),
            LengthFamily::Variant => dst.put_u32_le(0),
        }
        return Ok(());
    }

    match col.type_id {
        TypeId::BitN | TypeId::Bit => {
            let bit = match value {
                SqlValue::Bool(b) => *b,
                other => integer(other, "BIT")? != 0,
            };
            put_sized(col, &[u8::from(bit)], dst)
        }
        TypeId::IntN | TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 => {
            let v = integer(value, "INT")?;
            let bytes = v.to_le_bytes();
            let width = col.max_length as usize;
            if !matches!(width, 1 | 2 | 4 | 8) || !fits(v, width) {
                return Err(TypeError::OutOfRange { target_type: "INT" });
            }
            put_sized(col, &bytes[..width], dst)
        }
        TypeId::FloatN | TypeId::Float4 | TypeId::Float8 => {
            let v = match value {
                SqlValue::Float(f) => f64::from(*f),
                SqlValue::Double(f) => *f,
                other => integer(other, "FLOAT")? as f64,
            };
            if col.max_length == 4 {
                put_sized(col, &(v as f32).to_le_bytes(), dst)
            } else {
                put_sized(col, &v.to_le_bytes(), dst)
            }
        }
        TypeId::MoneyN | TypeId::Money | TypeId::Money4 => {
            let scaled = (exact(value)? * Decimal::new(10_000, 0)).round();
            let units = i64::try_from(scaled).map_err(|_| TypeError::OutOfRange {
                target_type: "MONEY",
            })?;
            if col.max_length == 4 {
                let small = i32::try_from(units).map_err(|_| TypeError::OutOfRange {
                    target_type: "SMALLMONEY",
                })?;
                put_sized(col, &small.to_le_bytes(), dst)
            } else {
                let mut raw = [0u8; 8];
                raw[..4].copy_from_slice(&((units >> 32) as i32).to_le_bytes());
                raw[4..].copy_from_slice(&(units as u32).to_le_bytes());
                put_sized(col, &raw, dst)
            }
        }
        TypeId::DateTimeN | TypeId::DateTime | TypeId::DateTime4 => {
            let SqlValue::DateTime(dt) = value else {
                return Err(mismatch("DATETIME", value));
            };
            if col.max_length == 4 {
                put_sized(col, &small_datetime_bytes(dt)?, dst)
            } else {
                put_sized(col, &datetime_bytes(dt)?, dst)
            }
        }
        TypeId::Guid => {
            let SqlValue::Uuid(u) = value else {
                return Err(mismatch("UNIQUEIDENTIFIER", value));
            };
            put_sized(col, &u.to_bytes_le(), dst)
        }
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            let raw = decimal_bytes(exact(value)?, col.scale, opts.unicode)?;
            put_sized(col, &raw, dst)
        }
        TypeId::NChar | TypeId::NVarChar | TypeId::NText => {
            let SqlValue::String(s) = value else {
                return Err(mismatch("NVARCHAR", value));
            };
            let raw: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
            put_sized(col, &raw, dst)
        }
        TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar | TypeId::Text => {
            let SqlValue::String(s) = value else {
                return Err(mismatch("VARCHAR", value));
            };
            let (raw, _, unmappable) = col.encoding().encode(s);
            if unmappable {
                return Err(TypeError::InvalidEncoding(format!(
                    "string not representable in {}",
                    col.encoding().name()
                )));
            }
            put_sized(col, &raw, dst)
        }
        TypeId::Binary
        | TypeId::VarBinary
        | TypeId::BigBinary
        | TypeId::BigVarBinary
        | TypeId::Image => {
            let SqlValue::Binary(b) = value else {
                return Err(mismatch("VARBINARY", value));
            };
            put_sized(col, b, dst)
        }
        TypeId::Variant => Err(mismatch("SQL_VARIANT", value)),
        TypeId::Null => Err(TypeError::UnexpectedNull),
    }
}

/// Write `data` with the length prefix of the column's family.
fn put_sized(col: &ColumnType, data: &[u8], dst: &mut BytesMut) -> Result<(), TypeError> {
    let too_long = || TypeError::OutOfRange {
        target_type: "parameter length",
    };
    match col.type_id.length_family() {
        LengthFamily::Fixed(_) => {}
        LengthFamily::Byte => dst.put_u8(u8::try_from(data.len()).map_err(|_| too_long())?),
        LengthFamily::Short => {
            if data.len() > SHORT_MAX {
                return Err(too_long());
            }
            dst.put_u16_le(data.len() as u16);
        }
        LengthFamily::Long | LengthFamily::Variant => {
            dst.put_u32_le(u32::try_from(data.len()).map_err(|_| too_long())?);
        }
    }
    dst.put_slice(data);
    Ok(())
}

fn mismatch(expected: &'static str, actual: &SqlValue) -> TypeError {
    TypeError::TypeMismatch {
        expected,
        actual: actual.type_name().to_string(),
    }
}

fn integer(value: &SqlValue, expected: &'static str) -> Result<i64, TypeError> {
    value.as_i64().ok_or_else(|| mismatch(expected, value))
}

fn exact(value: &SqlValue) -> Result<Decimal, TypeError> {
    match value {
        SqlValue::Decimal(d) => Ok(*d),
        other => integer(other, "DECIMAL").map(Decimal::from),
    }
}

fn fits(v: i64, width: usize) -> bool {
    match width {
        1 => u8::try_from(v).is_ok(),
        2 => i16::try_from(v).is_ok(),
        4 => i32::try_from(v).is_ok(),
        _ => true,
    }
}

/// Sign byte plus a 16 byte magnitude rescaled to `scale`.
fn decimal_bytes(value: Decimal, scale: u8, little_endian: bool) -> Result<Vec<u8>, TypeError> {
    let mut scaled = value;
    scaled.rescale(u32::from(scale));
    if scaled.scale() != u32::from(scale) {
        return Err(TypeError::OutOfRange {
            target_type: "DECIMAL",
        });
    }
    let mantissa = scaled.mantissa();
    let magnitude = mantissa.unsigned_abs().to_le_bytes();

    let mut raw = Vec::with_capacity(17);
    if little_endian {
        raw.push(u8::from(mantissa >= 0));
        raw.extend_from_slice(&magnitude);
    } else {
        raw.push(u8::from(mantissa < 0));
        raw.extend(magnitude.iter().rev());
    }
    Ok(raw)
}

fn base_date() -> Result<NaiveDate, TypeError> {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .ok_or_else(|| TypeError::InvalidDateTime("base date".to_string()))
}

fn datetime_bytes(dt: &NaiveDateTime) -> Result<[u8; 8], TypeError> {
    let days = i32::try_from((dt.date() - base_date()?).num_days()).map_err(|_| {
        TypeError::OutOfRange {
            target_type: "DATETIME",
        }
    })?;
    let millis = u64::from(dt.num_seconds_from_midnight()) * 1000
        + u64::from(dt.nanosecond() / 1_000_000);
    let ticks = (millis * 3 + 5) / 10;

    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(&days.to_le_bytes());
    raw[4..].copy_from_slice(&(ticks as u32).to_le_bytes());
    Ok(raw)
}

fn small_datetime_bytes(dt: &NaiveDateTime) -> Result<[u8; 4], TypeError> {
    let out_of_range = || TypeError::OutOfRange {
        target_type: "SMALLDATETIME",
    };
    let days = u16::try_from((dt.date() - base_date()?).num_days()).map_err(|_| out_of_range())?;
    let minutes = (dt.num_seconds_from_midnight() / 60) as u16;

    let mut raw = [0u8; 4];
    raw[..2].copy_from_slice(&days.to_le_bytes());
    raw[2..].copy_from_slice(&minutes.to_le_bytes());
    Ok(raw)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decode::decode_value;

    fn encode_param(param: &ParamDescriptor, opts: &CodecOptions) -> (ColumnType, BytesMut) {
        let col = resolve_param_type(param, opts).unwrap();
        let mut buf = BytesMut::new();
        encode_type(&col, opts, &mut buf);
        encode_value(&param.value, &col, opts, &mut buf).unwrap();
        (col, buf)
    }

    #[test]
    fn test_int_param_layout() {
        let opts = CodecOptions::default();
        let (_, buf) = encode_param(&ParamDescriptor::input("@p", 1i32), &opts);
        assert_eq!(&buf[..], &[0x26, 0x04, 0x04, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_output_param_sends_null() {
        let opts = CodecOptions::default();
        let (col, buf) = encode_param(&ParamDescriptor::output("@out", TypeId::Int4), &opts);
        assert_eq!(col.type_id, TypeId::IntN);
        assert_eq!(&buf[..], &[0x26, 0x04, 0x00]);
    }

    #[test]
    fn test_nvarchar_param_carries_collation() {
        let opts = CodecOptions {
            default_collation: Some(Collation {
                info: 0x00D0_0409,
                sort_id: 0x34,
            }),
            ..CodecOptions::tds7(true)
        };
        let (_, buf) = encode_param(&ParamDescriptor::input("@s", "ab"), &opts);
        assert_eq!(
            &buf[..],
            &[
                0xE7, 0x40, 0x1F, // NVARCHAR(8000)
                0x09, 0x04, 0xD0, 0x00, 0x34, // collation
                0x04, 0x00, b'a', 0x00, b'b', 0x00,
            ]
        );
    }

    #[test]
    fn test_tds70_has_no_collation() {
        let opts = CodecOptions::tds7(false);
        let (_, buf) = encode_param(&ParamDescriptor::input("@s", ""), &opts);
        assert_eq!(&buf[..], &[0xE7, 0x40, 0x1F, 0x00, 0x00]);
    }

    #[test]
    fn test_legacy_string_is_varchar() {
        let opts = CodecOptions::legacy();
        let (col, buf) = encode_param(&ParamDescriptor::input("@s", "ok"), &opts);
        assert_eq!(col.type_id, TypeId::VarChar);
        assert_eq!(&buf[..], &[0x27, 0xFF, 0x02, b'o', b'k']);
    }

    #[test]
    fn test_values_decode_back() {
        let opts = CodecOptions::default();
        let values = [
            SqlValue::Int(-42),
            SqlValue::Bool(true),
            SqlValue::Double(2.5),
            SqlValue::Decimal(Decimal::new(-123_456, 3)),
            SqlValue::String("héllo".to_string()),
            SqlValue::Binary(bytes::Bytes::from_static(&[1, 2, 3])),
        ];
        for value in values {
            let param = ParamDescriptor::input("@v", value.clone());
            let col = resolve_param_type(&param, &opts).unwrap();
            let mut buf = BytesMut::new();
            encode_value(&value, &col, &opts, &mut buf).unwrap();
            let mut src = &buf[..];
            assert_eq!(decode_value(&mut src, &col, &opts).unwrap(), value);
        }
    }

    #[test]
    fn test_datetime_ticks() {
        let dt = NaiveDate::from_ymd_opt(1900, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        assert_eq!(datetime_bytes(&dt).unwrap(), [1, 0, 0, 0, 0x2C, 0x01, 0, 0]);
    }

    #[test]
    fn test_int_out_of_range() {
        let opts = CodecOptions::default();
        let param = ParamDescriptor::input("@p", 300i32).with_wire_type(TypeId::Int1);
        let col = resolve_param_type(&param, &opts).unwrap();
        let mut buf = BytesMut::new();
        assert!(encode_value(&param.value, &col, &opts, &mut buf).is_err());
    }

    #[test]
    fn test_guid_needs_tds7() {
        let param = ParamDescriptor::input("@g", uuid::Uuid::nil());
        assert!(resolve_param_type(&param, &CodecOptions::legacy()).is_err());
    }

    #[test]
    fn test_variant_is_not_a_parameter_type() {
        let param = ParamDescriptor::output("@v", TypeId::Variant);
        assert!(resolve_param_type(&param, &CodecOptions::default()).is_err());
    }
}
