//! TDS protocol version definitions.

use core::fmt;

use tds_types::CodecOptions;

use crate::packet::{DEFAULT_PACKET_SIZE, MIN_PACKET_SIZE};

/// TDS protocol version.
///
/// Values are ordered, so capability checks compare against the first
/// version that introduced a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 4.2 (SQL Server 6.x, old Sybase)
    pub const V4_2: Self = Self(0x0402_0000);

    /// TDS 5.0 (Sybase ASE)
    pub const V5_0: Self = Self(0x0500_0000);

    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x7000_0000);

    /// TDS 7.1, also called TDS 8.0 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0000);

    /// TDS 7.1 Revision 1, also called TDS 8.1 (SQL Server 2000 SP1)
    pub const V7_1_REV1: Self = Self(0x7100_0001);

    /// Create a new TDS version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Get the raw version value, as sent in the extended login.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Map the version word of a login acknowledgement to a protocol version.
    ///
    /// SQL Server 7.0 and 2000 report `0x07000000` and `0x07010000`; later
    /// releases echo the login value. Sybase reports `5.0.0.0`.
    #[must_use]
    pub const fn from_login_ack(raw: u32) -> Self {
        match raw {
            0x0402_0000 => Self::V4_2,
            0x0500_0000 => Self::V5_0,
            0x0700_0000 | 0x7000_0000 => Self::V7_0,
            0x0701_0000 | 0x7100_0000 => Self::V7_1,
            _ if raw >= 0x7100_0001 => Self::V7_1_REV1,
            _ => Self(raw),
        }
    }

    /// Extended login packet and UTF-16 strings (TDS 7.0+).
    #[must_use]
    pub const fn is_tds7(self) -> bool {
        self.0 >= Self::V7_0.0
    }

    /// Collations on character columns and parameters (TDS 7.1+).
    #[must_use]
    pub const fn supports_collations(self) -> bool {
        self.0 >= Self::V7_1.0
    }

    /// Two-byte procedure ids in place of well-known procedure names.
    #[must_use]
    pub const fn supports_proc_ids(self) -> bool {
        self.0 >= Self::V7_0.0
    }

    /// Three-part table names in TABNAME tokens (TDS 7.1 revision 1+).
    #[must_use]
    pub const fn multipart_table_names(self) -> bool {
        self.0 >= Self::V7_1_REV1.0
    }

    /// Packet size used until the server announces one.
    #[must_use]
    pub const fn default_packet_size(self) -> usize {
        if self.is_tds7() {
            DEFAULT_PACKET_SIZE
        } else {
            MIN_PACKET_SIZE
        }
    }

    /// Type codec switches for this version.
    #[must_use]
    pub fn codec_options(self) -> CodecOptions {
        if self.is_tds7() {
            CodecOptions::tds7(self.supports_collations())
        } else {
            CodecOptions::legacy()
        }
    }

    /// Parse a version from its configuration spelling.
    ///
    /// Accepts `4.2`, `5.0`, `7.0`, `7.1`/`8.0` and `8.1`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "4.2" => Some(Self::V4_2),
            "5.0" | "5" => Some(Self::V5_0),
            "7.0" | "7" => Some(Self::V7_0),
            "7.1" | "8.0" | "8" => Some(Self::V7_1),
            "8.1" => Some(Self::V7_1_REV1),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_1_REV1
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V4_2 => write!(f, "TDS 4.2"),
            Self::V5_0 => write!(f, "TDS 5.0"),
            Self::V7_0 => write!(f, "TDS 7.0"),
            Self::V7_1 => write!(f, "TDS 8.0"),
            Self::V7_1_REV1 => write!(f, "TDS 8.1"),
            Self(raw) => write!(f, "TDS 0x{raw:08X}"),
        }
    }
}
