//! Column and parameter type descriptors.

use bytes::Buf;
use encoding_rs::Encoding;

use crate::collation::{COLLATION_LEN, Collation};
use crate::error::TypeError;
use crate::type_id::{LengthFamily, TypeId};

/// Default limit on a single decoded value (64 MiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Protocol-level switches the codec needs from the session.
///
/// Built once per session from the negotiated version and the current
/// charset; cheap to copy into every decode call.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    /// Strings in descriptors and NCHAR data are UTF-16 (TDS 7.0+).
    pub unicode: bool,
    /// Character descriptors carry a collation (TDS 7.1+).
    pub collations: bool,
    /// Encoding for single-byte data when no collation applies.
    pub charset: &'static Encoding,
    /// Collation sent with character parameters (TDS 7.1+).
    pub default_collation: Option<Collation>,
    /// Upper bound on any single value's declared length.
    pub max_value_size: usize,
}

impl CodecOptions {
    /// Options for a Sybase or TDS 4.2 session.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            unicode: false,
            collations: false,
            charset: encoding_rs::WINDOWS_1252,
            default_collation: None,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }

    /// Options for a TDS 7.x session.
    #[must_use]
    pub fn tds7(collations: bool) -> Self {
        Self {
            unicode: true,
            collations,
            ..Self::legacy()
        }
    }
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self::tds7(true)
    }
}

/// The wire type of a column, output parameter or RPC parameter.
///
/// The character encoding is resolved from the collation (or the session
/// charset) when the descriptor is decoded and cached here, so row decoding
/// never repeats the lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnType {
    /// Wire type code.
    pub type_id: TypeId,
    /// Declared maximum length in bytes (fixed size for fixed types).
    pub max_length: u32,
    /// Precision for decimal/numeric.
    pub precision: u8,
    /// Scale for decimal/numeric.
    pub scale: u8,
    /// Collation for character data (TDS 7.1+).
    pub collation: Option<Collation>,
    /// Table name reported for TEXT/NTEXT/IMAGE columns.
    pub text_table: Option<String>,
    encoding: &'static Encoding,
}

impl ColumnType {
    /// Descriptor for a type with its natural length and no collation.
    #[must_use]
    pub fn new(type_id: TypeId) -> Self {
        let max_length = match type_id.length_family() {
            LengthFamily::Fixed(n) => n as u32,
            LengthFamily::Byte => match type_id {
                TypeId::IntN | TypeId::FloatN | TypeId::MoneyN | TypeId::DateTimeN => 8,
                TypeId::BitN => 1,
                TypeId::Guid => 16,
                t if t.is_decimal() => 17,
                _ => 255,
            },
            LengthFamily::Short => 8000,
            LengthFamily::Long => 0x7FFF_FFFF,
            LengthFamily::Variant => 8016,
        };
        Self {
            type_id,
            max_length,
            precision: if type_id.is_decimal() { 38 } else { 0 },
            scale: 0,
            collation: None,
            text_table: None,
            encoding: encoding_rs::WINDOWS_1252,
        }
    }

    /// Set the declared maximum length.
    #[must_use]
    pub fn with_length(mut self, max_length: u32) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set precision and scale.
    #[must_use]
    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Attach a collation and cache its encoding.
    #[must_use]
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.encoding = collation.encoding();
        self.collation = Some(collation);
        self
    }

    /// Set the encoding used for single-byte character data.
    #[must_use]
    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// The encoding cached for single-byte character data.
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }
}

/// Decode a type descriptor: the type byte followed by its length,
/// precision/scale, collation and text table name as the type requires.
pub fn decode_column_type<B: Buf>(
    buf: &mut B,
    opts: &CodecOptions,
) -> Result<ColumnType, TypeError> {
    need(buf, 1)?;
    let type_id = TypeId::from_u8(buf.get_u8())?;
    let mut col = ColumnType::new(type_id).with_encoding(opts.charset);

    match type_id.length_family() {
        LengthFamily::Fixed(_) => {}
        LengthFamily::Byte => {
            need(buf, 1)?;
            col.max_length = u32::from(buf.get_u8());
            if type_id.is_decimal() {
                need(buf, 2)?;
                col.precision = buf.get_u8();
                col.scale = buf.get_u8();
            }
        }
        LengthFamily::Short => {
            need(buf, 2)?;
            col.max_length = u32::from(buf.get_u16_le());
            if type_id.is_character() && opts.collations {
                col = col.with_collation(read_collation(buf)?);
            }
        }
        LengthFamily::Long => {
            need(buf, 4)?;
            col.max_length = buf.get_u32_le();
            if type_id.is_character() && opts.collations {
                col = col.with_collation(read_collation(buf)?);
            }
            col.text_table = Some(read_table_name(buf, opts)?);
        }
        LengthFamily::Variant => {
            need(buf, 4)?;
            col.max_length = buf.get_u32_le();
        }
    }

    Ok(col)
}

pub(crate) fn read_collation<B: Buf>(buf: &mut B) -> Result<Collation, TypeError> {
    need(buf, COLLATION_LEN)?;
    let mut bytes = [0u8; COLLATION_LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(Collation::from_bytes(bytes))
}

fn read_table_name<B: Buf>(buf: &mut B, opts: &CodecOptions) -> Result<String, TypeError> {
    need(buf, 2)?;
    let len = usize::from(buf.get_u16_le());
    if opts.unicode {
        need(buf, len * 2)?;
        let raw = buf.copy_to_bytes(len * 2);
        crate::decode::decode_utf16(&raw)
    } else {
        need(buf, len)?;
        let raw = buf.copy_to_bytes(len);
        let (text, _) = opts.charset.decode_without_bom_handling(&raw);
        Ok(text.into_owned())
    }
}

/// Fail with `BufferTooSmall` unless `n` bytes remain.
pub(crate) fn need<B: Buf>(buf: &B, n: usize) -> Result<(), TypeError> {
    if buf.remaining() < n {
        return Err(TypeError::BufferTooSmall {
            needed: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}
