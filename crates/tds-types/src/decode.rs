//! Decoding of wire values into [`SqlValue`].
//!
//! Every length family keeps NULL apart from empty data: a zero one-byte
//! length, a `0xFFFF` two-byte length, or an empty text pointer is NULL,
//! while a zero two-byte or four-byte length is an empty value.

use bytes::{Buf, Bytes};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::column::{CodecOptions, ColumnType, need, read_collation};
use crate::collation::COLLATION_LEN;
use crate::error::TypeError;
use crate::type_id::{LengthFamily, TypeId};
use crate::value::SqlValue;

/// Two-byte length marking NULL.
const SHORT_NULL: u16 = 0xFFFF;

/// Size of the timestamp following a text pointer.
const TEXT_TIMESTAMP_LEN: usize = 8;

/// Decode one value described by `col`.
///
/// Returns `BufferTooSmall` if `buf` ends before the declared length, so a
/// caller holding a partial packet can retry with more input.
pub fn decode_value<B: Buf>(
    buf: &mut B,
    col: &ColumnType,
    opts: &CodecOptions,
) -> Result<SqlValue, TypeError> {
    let Some(data) = read_value_bytes(buf, col, opts)? else {
        return Ok(SqlValue::Null);
    };
    convert(data, col, opts)
}

/// Read the raw bytes of one value, or `None` for NULL.
fn read_value_bytes<B: Buf>(
    buf: &mut B,
    col: &ColumnType,
    opts: &CodecOptions,
) -> Result<Option<Bytes>, TypeError> {
    let len = match col.type_id.length_family() {
        LengthFamily::Fixed(0) => return Ok(None),
        LengthFamily::Fixed(n) => n,
        LengthFamily::Byte => {
            need(buf, 1)?;
            match buf.get_u8() {
                0 => return Ok(None),
                n => usize::from(n),
            }
        }
        LengthFamily::Short => {
            need(buf, 2)?;
            match buf.get_u16_le() {
                SHORT_NULL => return Ok(None),
                n => usize::from(n),
            }
        }
        LengthFamily::Long => {
            need(buf, 1)?;
            let ptr_len = usize::from(buf.get_u8());
            if ptr_len == 0 {
                return Ok(None);
            }
            need(buf, ptr_len + TEXT_TIMESTAMP_LEN + 4)?;
            buf.advance(ptr_len + TEXT_TIMESTAMP_LEN);
            buf.get_u32_le() as usize
        }
        LengthFamily::Variant => {
            need(buf, 4)?;
            match buf.get_u32_le() {
                0 => return Ok(None),
                n => n as usize,
            }
        }
    };

    if len > opts.max_value_size {
        return Err(TypeError::ValueTooLarge {
            declared: len,
            limit: opts.max_value_size,
        });
    }
    need(buf, len)?;
    Ok(Some(buf.copy_to_bytes(len)))
}

fn convert(mut data: Bytes, col: &ColumnType, opts: &CodecOptions) -> Result<SqlValue, TypeError> {
    let len = data.len();
    let value = match col.type_id {
        TypeId::Null => SqlValue::Null,
        TypeId::Bit | TypeId::BitN => SqlValue::Bool(data.get_u8() != 0),
        TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::IntN => {
            match len {
                1 => SqlValue::TinyInt(data.get_u8()),
                2 => SqlValue::SmallInt(data.get_i16_le()),
                4 => SqlValue::Int(data.get_i32_le()),
                8 => SqlValue::BigInt(data.get_i64_le()),
                _ => return Err(bad_length("INTN", len)),
            }
        }
        TypeId::Float4 | TypeId::Float8 | TypeId::FloatN => match len {
            4 => SqlValue::Float(data.get_f32_le()),
            8 => SqlValue::Double(data.get_f64_le()),
            _ => return Err(bad_length("FLOATN", len)),
        },
        TypeId::Money | TypeId::Money4 | TypeId::MoneyN => match len {
            4 => SqlValue::Decimal(Decimal::new(i64::from(data.get_i32_le()), 4)),
            8 => {
                let high = i64::from(data.get_i32_le());
                let low = i64::from(data.get_u32_le());
                SqlValue::Decimal(Decimal::new((high << 32) | low, 4))
            }
            _ => return Err(bad_length("MONEYN", len)),
        },
        TypeId::DateTime | TypeId::DateTime4 | TypeId::DateTimeN => match len {
            4 => {
                let days = data.get_u16_le();
                let minutes = data.get_u16_le();
                SqlValue::DateTime(small_datetime(days, minutes)?)
            }
            8 => {
                let days = data.get_i32_le();
                let ticks = data.get_u32_le();
                SqlValue::DateTime(datetime(days, ticks)?)
            }
            _ => return Err(bad_length("DATETIMEN", len)),
        },
        TypeId::Guid => {
            if len != 16 {
                return Err(bad_length("UNIQUEIDENTIFIER", len));
            }
            let mut raw = [0u8; 16];
            data.copy_to_slice(&mut raw);
            SqlValue::Uuid(Uuid::from_bytes_le(raw))
        }
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            SqlValue::Decimal(decimal(&data, col.scale, opts.unicode)?)
        }
        TypeId::NChar | TypeId::NVarChar | TypeId::NText => SqlValue::String(decode_utf16(&data)?),
        TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar | TypeId::Text => {
            let (text, _) = col.encoding().decode_without_bom_handling(&data);
            SqlValue::String(text.into_owned())
        }
        TypeId::Binary
        | TypeId::VarBinary
        | TypeId::BigBinary
        | TypeId::BigVarBinary
        | TypeId::Image => SqlValue::Binary(data),
        TypeId::Variant => variant(data, opts)?,
    };
    Ok(value)
}

/// SQL_VARIANT body: base type, property length, properties, then the
/// value in the base type's fixed layout.
fn variant(mut data: Bytes, opts: &CodecOptions) -> Result<SqlValue, TypeError> {
    need(&data, 2)?;
    let base = TypeId::from_u8(data.get_u8())?;
    let prop_len = usize::from(data.get_u8());
    need(&data, prop_len)?;
    let mut props = data.split_to(prop_len);

    let mut col = ColumnType::new(base).with_encoding(opts.charset);
    match base {
        TypeId::Variant | TypeId::Text | TypeId::Image | TypeId::NText => {
            return Err(TypeError::UnsupportedType(base as u8));
        }
        t if t.is_decimal() => {
            need(&props, 2)?;
            col.precision = props.get_u8();
            col.scale = props.get_u8();
        }
        t if t.is_character() => {
            need(&props, 2 + COLLATION_LEN)?;
            col.max_length = u32::from(props.get_u16_le());
            col = col.with_collation(read_collation(&mut props)?);
        }
        TypeId::Binary | TypeId::VarBinary | TypeId::BigBinary | TypeId::BigVarBinary => {
            need(&props, 2)?;
            col.max_length = u32::from(props.get_u16_le());
        }
        _ => {}
    }
    convert(data, &col, opts)
}

fn bad_length(type_name: &str, len: usize) -> TypeError {
    TypeError::InvalidBinary(format!("invalid {type_name} length: {len}"))
}

/// Decode a sign byte and magnitude into a decimal with the column's scale.
///
/// TDS 7 sends a little-endian magnitude with sign 1 for positive; Sybase
/// and TDS 4.2 send it big-endian with sign 1 for negative.
fn decimal(data: &[u8], scale: u8, little_endian: bool) -> Result<Decimal, TypeError> {
    let Some((&sign, magnitude)) = data.split_first() else {
        return Err(bad_length("DECIMAL", 0));
    };
    if magnitude.len() > 16 {
        return Err(bad_length("DECIMAL", data.len()));
    }

    let mut raw = [0u8; 16];
    if little_endian {
        raw[..magnitude.len()].copy_from_slice(magnitude);
    } else {
        for (dst, src) in raw.iter_mut().zip(magnitude.iter().rev()) {
            *dst = *src;
        }
    }
    let unsigned = u128::from_le_bytes(raw);
    let negative = if little_endian { sign == 0 } else { sign != 0 };

    let mantissa = i128::try_from(unsigned).map_err(|_| TypeError::OutOfRange {
        target_type: "DECIMAL",
    })?;
    let mantissa = if negative { -mantissa } else { mantissa };
    Decimal::try_from_i128_with_scale(mantissa, u32::from(scale)).map_err(|_| {
        TypeError::OutOfRange {
            target_type: "DECIMAL",
        }
    })
}

fn base_date() -> Result<NaiveDate, TypeError> {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .ok_or_else(|| TypeError::InvalidDateTime("base date".to_string()))
}

/// DATETIME: days since 1900-01-01 and 1/300 second ticks since midnight.
fn datetime(days: i32, ticks: u32) -> Result<NaiveDateTime, TypeError> {
    let date = base_date()?
        .checked_add_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| TypeError::InvalidDateTime(format!("day offset {days}")))?;
    let millis = (u64::from(ticks) * 10 + 1) / 3;
    let secs = u32::try_from(millis / 1000)
        .map_err(|_| TypeError::InvalidDateTime(format!("tick count {ticks}")))?;
    let nanos = u32::try_from((millis % 1000) * 1_000_000)
        .map_err(|_| TypeError::InvalidDateTime(format!("tick count {ticks}")))?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("tick count {ticks}")))?;
    Ok(date.and_time(time))
}

/// SMALLDATETIME: days since 1900-01-01 and minutes since midnight.
fn small_datetime(days: u16, minutes: u16) -> Result<NaiveDateTime, TypeError> {
    let date = base_date()?
        .checked_add_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| TypeError::InvalidDateTime(format!("day offset {days}")))?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("minute count {minutes}")))?;
    Ok(date.and_time(time))
}

/// Decode UTF-16LE bytes into a string.
pub fn decode_utf16(data: &[u8]) -> Result<String, TypeError> {
    if data.len() % 2 != 0 {
        return Err(TypeError::InvalidEncoding(
            "UTF-16 data has odd byte length".to_string(),
        ));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| TypeError::InvalidEncoding(e.to_string()))
}
