//! Collations and server character sets.
//!
//! TDS 7.1 servers describe character columns with a five byte collation.
//! Older servers announce one session-wide charset name through an
//! environment change instead. Both resolve to an `encoding_rs` encoding
//! used for single-byte character data; UTF-16 columns ignore it.

use encoding_rs::Encoding;

/// Wire size of a collation.
pub const COLLATION_LEN: usize = 5;

/// Mask for the locale id inside the collation info word.
const LCID_MASK: u32 = 0x000F_FFFF;

/// SQL Server collation as carried in TDS 7.1 column metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation {
    /// Locale id (low 20 bits) and comparison flags.
    pub info: u32,
    /// SQL sort order id; zero for Windows collations.
    pub sort_id: u8,
}

impl Collation {
    /// Build a collation from its five wire bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; COLLATION_LEN]) -> Self {
        Self {
            info: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sort_id: bytes[4],
        }
    }

    /// The five wire bytes of this collation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; COLLATION_LEN] {
        let info = self.info.to_le_bytes();
        [info[0], info[1], info[2], info[3], self.sort_id]
    }

    /// The locale id.
    #[must_use]
    pub fn lcid(self) -> u32 {
        self.info & LCID_MASK
    }

    /// Windows code page for single-byte data in this collation.
    ///
    /// SQL collations are resolved by sort id, Windows collations by locale.
    #[must_use]
    pub fn code_page(self) -> u16 {
        if self.sort_id != 0 {
            if let Some(cp) = code_page_for_sort_id(self.sort_id) {
                return cp;
            }
        }
        code_page_for_lcid(self.lcid())
    }

    /// The encoding used to decode single-byte character data.
    #[must_use]
    pub fn encoding(self) -> &'static Encoding {
        encoding_for_code_page(self.code_page())
    }
}

/// Code page for a SQL Server sort order id.
fn code_page_for_sort_id(sort_id: u8) -> Option<u16> {
    Some(match sort_id {
        30..=34 => 437,
        40..=49 => 850,
        51..=61 | 183..=186 | 210..=215 => 1252,
        80..=90 => 1250,
        104..=108 => 1251,
        112..=114 | 120..=124 => 1253,
        128..=130 => 1254,
        136..=138 => 1255,
        144..=146 => 1256,
        152..=160 => 1257,
        192 | 193 | 200 => 932,
        194 | 195 | 201 => 949,
        196 | 197 | 202 => 950,
        198 | 199 | 203 => 936,
        204..=206 => 874,
        _ => return None,
    })
}

/// Locale ids grouped by the ANSI code page Windows assigns them.
const LCID_CODE_PAGES: &[(u16, &[u32])] = &[
    (932, &[0x0411]),
    (936, &[0x0804, 0x1004]),
    (949, &[0x0412]),
    (950, &[0x0404, 0x0C04, 0x1404]),
    (874, &[0x041E]),
    (1258, &[0x042A]),
    (
        1250,
        &[
            0x0405, 0x0415, 0x040E, 0x041A, 0x081A, 0x141A, 0x101A, 0x041B, 0x0424, 0x0418,
            0x041C,
        ],
    ),
    (
        1251,
        &[
            0x0419, 0x0422, 0x0423, 0x0402, 0x042F, 0x0C1A, 0x201A, 0x0440, 0x0843, 0x0444,
            0x0450, 0x0485,
        ],
    ),
    (1253, &[0x0408]),
    (1254, &[0x041F, 0x042C]),
    (1255, &[0x040D]),
    (
        1256,
        &[
            0x0401, 0x0801, 0x0C01, 0x1001, 0x1401, 0x1801, 0x1C01, 0x2001, 0x2401, 0x2801,
            0x2C01, 0x3001, 0x3401, 0x3801, 0x3C01, 0x4001, 0x0429, 0x0420, 0x048C, 0x0463,
        ],
    ),
    (1257, &[0x0425, 0x0426, 0x0427]),
];

/// Windows code page for a locale id. Unlisted locales use 1252.
#[must_use]
pub fn code_page_for_lcid(lcid: u32) -> u16 {
    let lang = lcid & 0xFFFF;
    LCID_CODE_PAGES
        .iter()
        .find(|(_, lcids)| lcids.contains(&lang))
        .map_or(1252, |(cp, _)| *cp)
}

/// Encoding for a Windows code page.
///
/// The OEM pages 437 and 850 have no `encoding_rs` table and decode as 1252.
#[must_use]
pub fn encoding_for_code_page(code_page: u16) -> &'static Encoding {
    match code_page {
        874 => encoding_rs::WINDOWS_874,
        932 => encoding_rs::SHIFT_JIS,
        936 => encoding_rs::GBK,
        949 => encoding_rs::EUC_KR,
        950 => encoding_rs::BIG5,
        1250 => encoding_rs::WINDOWS_1250,
        1251 => encoding_rs::WINDOWS_1251,
        1253 => encoding_rs::WINDOWS_1253,
        1254 => encoding_rs::WINDOWS_1254,
        1255 => encoding_rs::WINDOWS_1255,
        1256 => encoding_rs::WINDOWS_1256,
        1257 => encoding_rs::WINDOWS_1257,
        1258 => encoding_rs::WINDOWS_1258,
        65001 => encoding_rs::UTF_8,
        _ => encoding_rs::WINDOWS_1252,
    }
}

/// Encoding for a server charset name as sent in a charset environment change.
///
/// Sybase names are mapped first, then the name is tried as a WHATWG label.
/// Returns `None` for names neither table knows.
#[must_use]
pub fn encoding_for_charset(name: &str) -> Option<&'static Encoding> {
    let lower = name.trim().to_ascii_lowercase();
    let sybase = match lower.as_str() {
        "iso_1" | "iso-1" | "iso88591" | "cp437" | "cp850" | "cp1252" | "ascii_8" => {
            Some(encoding_rs::WINDOWS_1252)
        }
        "utf8" => Some(encoding_rs::UTF_8),
        "iso88592" => Some(encoding_rs::ISO_8859_2),
        "iso88595" => Some(encoding_rs::ISO_8859_5),
        "iso88597" => Some(encoding_rs::ISO_8859_7),
        "iso88598" => Some(encoding_rs::ISO_8859_8),
        "iso88599" => Some(encoding_rs::WINDOWS_1254),
        "iso15" => Some(encoding_rs::ISO_8859_15),
        "cp1250" => Some(encoding_rs::WINDOWS_1250),
        "cp1251" => Some(encoding_rs::WINDOWS_1251),
        "cp1253" => Some(encoding_rs::WINDOWS_1253),
        "cp1254" => Some(encoding_rs::WINDOWS_1254),
        "cp1255" => Some(encoding_rs::WINDOWS_1255),
        "cp1256" => Some(encoding_rs::WINDOWS_1256),
        "cp1257" => Some(encoding_rs::WINDOWS_1257),
        "cp1258" => Some(encoding_rs::WINDOWS_1258),
        "cp874" | "tis620" => Some(encoding_rs::WINDOWS_874),
        "cp932" | "sjis" => Some(encoding_rs::SHIFT_JIS),
        "eucjis" => Some(encoding_rs::EUC_JP),
        "cp936" | "eucgb" => Some(encoding_rs::GBK),
        "gb18030" => Some(encoding_rs::GB18030),
        "cp949" | "eucksc" => Some(encoding_rs::EUC_KR),
        "cp950" | "big5" => Some(encoding_rs::BIG5),
        "koi8" => Some(encoding_rs::KOI8_R),
        "mac" | "roman8" => Some(encoding_rs::MACINTOSH),
        _ => None,
    };
    sybase.or_else(|| Encoding::for_label(lower.as_bytes()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_collation_bytes() {
        // SQL_Latin1_General_CP1_CI_AS
        let c = Collation::from_bytes([0x09, 0x04, 0xD0, 0x00, 0x34]);
        assert_eq!(c.lcid(), 0x0409);
        assert_eq!(c.sort_id, 0x34);
        assert_eq!(c.code_page(), 1252);
        assert_eq!(c.to_bytes(), [0x09, 0x04, 0xD0, 0x00, 0x34]);
    }

    #[test]
    fn test_windows_collation_uses_lcid() {
        let c = Collation {
            info: 0x0419,
            sort_id: 0,
        };
        assert_eq!(c.code_page(), 1251);
        assert_eq!(c.encoding().name(), "windows-1251");
    }

    #[test]
    fn test_unknown_lcid_defaults_to_1252() {
        assert_eq!(code_page_for_lcid(0x9999), 1252);
    }

    #[test]
    fn test_sybase_charset_names() {
        assert_eq!(encoding_for_charset("iso_1").unwrap().name(), "windows-1252");
        assert_eq!(encoding_for_charset("UTF8").unwrap().name(), "UTF-8");
        assert_eq!(encoding_for_charset("sjis").unwrap().name(), "Shift_JIS");
        assert_eq!(encoding_for_charset("latin2").unwrap().name(), "ISO-8859-2");
        assert!(encoding_for_charset("no-such-charset").is_none());
    }

    #[test]
    fn test_decode_cyrillic_text() {
        let enc = encoding_for_code_page(1251);
        let (decoded, _, had_errors) = enc.decode(&[0xCF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2]);
        assert!(!had_errors);
        assert_eq!(decoded, "Привет");
    }
}
