//! Wire type codes and their length families.

use crate::error::TypeError;

/// TDS wire type codes understood by this codec.
///
/// The set covers the types a TDS 4.2 through 7.1 server puts in result
/// metadata, output parameters and RPC parameter descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Fixed-length types
    /// Null type.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Nullable types with a one-byte length
    /// Nullable GUID.
    Guid = 0x24,
    /// Nullable integer.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Nullable decimal.
    DecimalN = 0x6A,
    /// Nullable numeric.
    NumericN = 0x6C,
    /// Nullable float.
    FloatN = 0x6D,
    /// Nullable money.
    MoneyN = 0x6E,
    /// Nullable datetime.
    DateTimeN = 0x6F,
    /// Short fixed-length character.
    Char = 0x2F,
    /// Short variable-length character.
    VarChar = 0x27,
    /// Short fixed-length binary.
    Binary = 0x2D,
    /// Short variable-length binary.
    VarBinary = 0x25,

    // Two-byte length types (TDS 7.0+)
    /// Large variable-length character.
    BigVarChar = 0xA7,
    /// Large variable-length binary.
    BigVarBinary = 0xA5,
    /// Large fixed-length character.
    BigChar = 0xAF,
    /// Large fixed-length binary.
    BigBinary = 0xAD,
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,

    // Four-byte length types with a text pointer
    /// TEXT.
    Text = 0x23,
    /// IMAGE.
    Image = 0x22,
    /// NTEXT.
    NText = 0x63,

    // Four-byte length, self-describing
    /// SQL_VARIANT (TDS 7.1+).
    Variant = 0x62,
}

/// How a value of a given type is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFamily {
    /// No length prefix; the size is implied by the type.
    Fixed(usize),
    /// One-byte length prefix; zero means NULL.
    Byte,
    /// Two-byte length prefix; `0xFFFF` means NULL.
    Short,
    /// Text pointer followed by a four-byte length; an empty pointer means NULL.
    Long,
    /// Four-byte length with no text pointer; zero means NULL. The value
    /// starts with its own base type and properties.
    Variant,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, TypeError> {
        Ok(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x7F => Self::Int8,
            0x3B => Self::Float4,
            0x3E => Self::Float8,
            0x3C => Self::Money,
            0x7A => Self::Money4,
            0x3D => Self::DateTime,
            0x3A => Self::DateTime4,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x37 => Self::Decimal,
            0x3F => Self::Numeric,
            0x68 => Self::BitN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x2F => Self::Char,
            0x27 => Self::VarChar,
            0x2D => Self::Binary,
            0x25 => Self::VarBinary,
            0xA7 => Self::BigVarChar,
            0xA5 => Self::BigVarBinary,
            0xAF => Self::BigChar,
            0xAD => Self::BigBinary,
            0xEF => Self::NChar,
            0xE7 => Self::NVarChar,
            0x23 => Self::Text,
            0x22 => Self::Image,
            0x63 => Self::NText,
            0x62 => Self::Variant,
            other => return Err(TypeError::UnsupportedType(other)),
        })
    }

    /// The length family that delimits values of this type.
    #[must_use]
    pub const fn length_family(self) -> LengthFamily {
        match self {
            Self::Null => LengthFamily::Fixed(0),
            Self::Int1 | Self::Bit => LengthFamily::Fixed(1),
            Self::Int2 => LengthFamily::Fixed(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => LengthFamily::Fixed(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => LengthFamily::Fixed(8),
            Self::Guid
            | Self::IntN
            | Self::Decimal
            | Self::Numeric
            | Self::BitN
            | Self::DecimalN
            | Self::NumericN
            | Self::FloatN
            | Self::MoneyN
            | Self::DateTimeN
            | Self::Char
            | Self::VarChar
            | Self::Binary
            | Self::VarBinary => LengthFamily::Byte,
            Self::BigVarChar
            | Self::BigVarBinary
            | Self::BigChar
            | Self::BigBinary
            | Self::NChar
            | Self::NVarChar => LengthFamily::Short,
            Self::Text | Self::Image | Self::NText => LengthFamily::Long,
            Self::Variant => LengthFamily::Variant,
        }
    }

    /// Single-byte character data decoded through a code page.
    #[must_use]
    pub const fn is_single_byte_char(self) -> bool {
        matches!(
            self,
            Self::Char | Self::VarChar | Self::BigChar | Self::BigVarChar | Self::Text
        )
    }

    /// UTF-16 character data.
    #[must_use]
    pub const fn is_unicode(self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }

    /// Character data of either width. These carry a collation in TDS 7.1+.
    #[must_use]
    pub const fn is_character(self) -> bool {
        self.is_single_byte_char() || self.is_unicode()
    }

    /// Decimal or numeric, carrying precision and scale in the descriptor.
    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(
            self,
            Self::Decimal | Self::Numeric | Self::DecimalN | Self::NumericN
        )
    }

    /// The integer types a return status can be stored in.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int1 | Self::Int2 | Self::Int4 | Self::Int8 | Self::IntN
        )
    }
}

impl TryFrom<u8> for TypeId {
    type Error = TypeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value)
    }
}
