//! Login packet construction.
//!
//! TDS 7.x clients send an extended login (packet type 0x10): an 86-byte
//! fixed header of offsets and lengths followed by UTF-16 strings. TDS 4.2
//! and 5.0 clients send the older login record (packet type 0x02) made of
//! fixed-width fields in the session charset.
//!
//! ## Security Note
//!
//! The extended login only obfuscates the password with a nibble swap and an
//! XOR. The legacy login carries it in clear text. Use TLS where the server
//! offers it.

use bytes::{BufMut, Bytes, BytesMut};
use tds_types::CodecOptions;

use crate::codec::{encode_string, write_utf16_string};
use crate::error::ProtocolError;
use crate::packet::PacketType;
use crate::version::TdsVersion;

/// Extended login header size (fixed portion).
pub const LOGIN7_HEADER_SIZE: usize = 86;

/// Width of the name fields of the legacy login record.
const LEGACY_FIELD_LEN: usize = 30;

/// Width of the remote password block of the legacy login record.
const LEGACY_REMOTE_PASSWORD_LEN: usize = 253;

/// Program name field width of the legacy login record.
const LEGACY_PROGRAM_LEN: usize = 10;

/// Packet size field width of the legacy login record.
const LEGACY_PACKET_SIZE_LEN: usize = 6;

/// TDS 5.0 capability token.
const CAPABILITY_TOKEN: u8 = 0xE2;

/// Request and response capability bitmaps sent in a TDS 5.0 login.
const CAPABILITIES: [u8; 24] = [
    0x01, 0x0B, 0x4F, 0xFF, 0x85, 0xEE, 0xEF, 0x65, 0x7F, 0xFF, 0xFF, 0xFF, 0xD6, //
    0x02, 0x0A, 0x00, 0x02, 0x00, 0x06, 0x80, 0x06, 0x48, 0x00, 0x00,
];

/// Extended login option bytes: use-database and set-language notices,
/// fatal database and language errors, ODBC semantics.
const LOGIN7_OPTIONS: [u8; 4] = [0xE0, 0x03, 0x00, 0x00];

/// Everything a login packet carries.
#[derive(Debug, Clone)]
pub struct Login {
    /// Protocol version to log in with.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Client machine name.
    pub hostname: String,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client knows it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database (extended login only).
    pub database: String,
    /// Charset requested from a TDS 4.2/5.0 server.
    pub charset: String,
    /// Client network address.
    pub client_id: [u8; 6],
    /// Client locale id.
    pub client_lcid: u32,
}

impl Default for Login {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::default(),
            packet_size: 4096,
            client_pid: std::process::id(),
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::from("tds-engine"),
            server_name: String::new(),
            library_name: String::from("tds-engine"),
            language: String::new(),
            database: String::new(),
            charset: String::new(),
            client_id: [0u8; 6],
            client_lcid: 0x0409,
        }
    }
}

impl Login {
    /// Create a login builder for the given version.
    #[must_use]
    pub fn new(tds_version: TdsVersion) -> Self {
        Self {
            tds_version,
            packet_size: tds_version.default_packet_size() as u32,
            ..Self::default()
        }
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the database to connect to.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the hostname (client machine name).
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Packet type the login travels in.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        if self.tds_version.is_tds7() {
            PacketType::Login
        } else {
            PacketType::LegacyLogin
        }
    }

    /// Encode the login in the form its version calls for.
    pub fn encode(&self, opts: &CodecOptions) -> Result<Bytes, ProtocolError> {
        if self.tds_version.is_tds7() {
            self.encode_extended()
        } else {
            self.encode_legacy(opts)
        }
    }

    fn encode_extended(&self) -> Result<Bytes, ProtocolError> {
        let fields: [(&str, bool); 9] = [
            (&self.hostname, false),
            (&self.username, false),
            (&self.password, true),
            (&self.app_name, false),
            (&self.server_name, false),
            ("", false),
            (&self.library_name, false),
            (&self.language, false),
            (&self.database, false),
        ];

        let mut var_data = BytesMut::new();
        let mut pointers = Vec::with_capacity(fields.len());
        let mut offset = LOGIN7_HEADER_SIZE;
        for (value, obfuscate) in fields {
            let units = value.encode_utf16().count();
            if units > u16::MAX as usize / 2 {
                return Err(ProtocolError::FieldTooLong {
                    field: "login string",
                    len: units,
                    max: u16::MAX as usize / 2,
                });
            }
            if obfuscate {
                write_obfuscated_password(&mut var_data, value);
            } else {
                write_utf16_string(&mut var_data, value);
            }
            pointers.push((offset as u16, units as u16));
            offset += units * 2;
        }
        if offset > u16::MAX as usize {
            return Err(ProtocolError::FieldTooLong {
                field: "login",
                len: offset,
                max: u16::MAX as usize,
            });
        }
        let end = offset as u16;

        let mut buf = BytesMut::with_capacity(offset);
        buf.put_u32_le(offset as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(0); // client program version
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_slice(&LOGIN7_OPTIONS);
        buf.put_i32_le(0); // client timezone
        buf.put_u32_le(self.client_lcid);
        for (field_offset, len) in pointers {
            buf.put_u16_le(field_offset);
            buf.put_u16_le(len);
        }
        buf.put_slice(&self.client_id);
        // SSPI and attach-db are empty and point at the end of the data
        buf.put_u16_le(end);
        buf.put_u16_le(0);
        buf.put_u16_le(end);
        buf.put_u16_le(0);

        debug_assert_eq!(buf.len(), LOGIN7_HEADER_SIZE);
        buf.put_slice(&var_data);
        Ok(buf.freeze())
    }

    fn encode_legacy(&self, opts: &CodecOptions) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(600);
        let text = |s: &str| encode_string(s, opts).map(|(bytes, _)| bytes);

        put_field(&mut buf, &text(&self.hostname)?, LEGACY_FIELD_LEN, "host name", true)?;
        put_field(&mut buf, &text(&self.username)?, LEGACY_FIELD_LEN, "user name", false)?;
        let password = text(&self.password)?;
        put_field(&mut buf, &password, LEGACY_FIELD_LEN, "password", false)?;
        put_field(
            &mut buf,
            self.client_pid.to_string().as_bytes(),
            LEGACY_FIELD_LEN,
            "host process",
            true,
        )?;

        // little-endian int2/int4, ASCII, IEEE floats, 8-byte dates,
        // use-database notices, no dump/load, default interface and network
        buf.put_slice(&[0x03, 0x01, 0x06, 0x0A, 0x09, 0x01, 0x01, 0x00, 0x00]);
        buf.put_bytes(0, 7);

        put_field(&mut buf, &text(&self.app_name)?, LEGACY_FIELD_LEN, "application name", true)?;
        put_field(&mut buf, &text(&self.server_name)?, LEGACY_FIELD_LEN, "server name", true)?;

        // remote password block: no server name, then the local password
        buf.put_u8(0);
        buf.put_u8(password.len() as u8);
        put_padded(&mut buf, &password, LEGACY_REMOTE_PASSWORD_LEN);
        buf.put_u8(password.len() as u8 + 2);

        let version = if self.tds_version == TdsVersion::V5_0 {
            [5, 0, 0, 0]
        } else {
            [4, 2, 0, 0]
        };
        buf.put_slice(&version);

        put_field(&mut buf, &text(&self.library_name)?, LEGACY_PROGRAM_LEN, "program name", true)?;
        buf.put_slice(&[0x06, 0x00, 0x00, 0x00]); // program version

        // no implicit short conversion, 4-byte float and date types
        buf.put_slice(&[0x00, 0x0D, 0x11]);

        put_field(&mut buf, &text(&self.language)?, LEGACY_FIELD_LEN, "language", false)?;
        buf.put_u8(1); // notify on language change

        // security label hierarchy, encryption flag, components and spare
        buf.put_bytes(0, 2 + 1 + 8 + 2);

        put_field(&mut buf, &text(&self.charset)?, LEGACY_FIELD_LEN, "charset", false)?;
        buf.put_u8(1); // notify on charset change

        put_field(
            &mut buf,
            self.packet_size.to_string().as_bytes(),
            LEGACY_PACKET_SIZE_LEN,
            "packet size",
            false,
        )?;

        if self.tds_version == TdsVersion::V5_0 {
            buf.put_bytes(0, 4);
            buf.put_u8(CAPABILITY_TOKEN);
            buf.put_u16(CAPABILITIES.len() as u16);
            buf.put_slice(&CAPABILITIES);
        } else {
            buf.put_bytes(0, 8);
        }

        Ok(buf.freeze())
    }
}

/// Write `value` zero-padded to `width`, followed by its length byte.
fn put_field(
    dst: &mut BytesMut,
    value: &[u8],
    width: usize,
    field: &'static str,
    truncate: bool,
) -> Result<(), ProtocolError> {
    let value = if value.len() > width {
        if !truncate {
            return Err(ProtocolError::FieldTooLong {
                field,
                len: value.len(),
                max: width,
            });
        }
        &value[..width]
    } else {
        value
    };
    put_padded(dst, value, width);
    dst.put_u8(value.len() as u8);
    Ok(())
}

fn put_padded(dst: &mut BytesMut, value: &[u8], width: usize) {
    let len = value.len().min(width);
    dst.put_slice(&value[..len]);
    dst.put_bytes(0, width - len);
}

/// Write a password with the extended login obfuscation.
///
/// Each UTF-16 unit is XORed with 0x5A5A and has the nibbles of both bytes
/// swapped.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for c in password.encode_utf16() {
        let c = c ^ 0x5A5A;
        dst.put_u16_le(((c << 4) & 0xF0F0) | ((c >> 4) & 0x0F0F));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn u16_at(buf: &[u8], pos: usize) -> u16 {
        u16::from_le_bytes([buf[pos], buf[pos + 1]])
    }

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        assert_eq!(&buf[..], &[0xB3, 0xA5]);

        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "Password1");
        assert_eq!(
            &buf[..],
            &[
                0xA0, 0xA5, 0xB3, 0xA5, 0x92, 0xA5, 0x92, 0xA5, 0xD2, 0xA5, 0x53, 0xA5, 0x82,
                0xA5, 0xE3, 0xA5, 0xB6, 0xA5,
            ]
        );
    }

    #[test]
    fn test_extended_login_header() {
        let login = Login::new(TdsVersion::V7_1)
            .with_hostname("HOST")
            .with_credentials("sa", "pw")
            .with_database("master");
        let encoded = login.encode(&CodecOptions::tds7(true)).unwrap();

        let total = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(total as usize, encoded.len());
        assert_eq!(&encoded[4..8], &0x7100_0000u32.to_le_bytes());
        assert_eq!(&encoded[24..28], &LOGIN7_OPTIONS);

        // host name is the first field, right after the header
        assert_eq!(u16_at(&encoded, 36), LOGIN7_HEADER_SIZE as u16);
        assert_eq!(u16_at(&encoded, 38), 4);
        assert_eq!(&encoded[86..94], &[b'H', 0, b'O', 0, b'S', 0, b'T', 0]);

        // database is the ninth field
        let db_offset = u16_at(&encoded, 36 + 8 * 4) as usize;
        assert_eq!(u16_at(&encoded, 38 + 8 * 4), 6);
        assert_eq!(encoded[db_offset], b'm');
        assert_eq!(login.packet_type(), PacketType::Login);
    }

    #[test]
    fn test_legacy_login_fields() {
        let login = Login::new(TdsVersion::V4_2)
            .with_hostname("client")
            .with_credentials("sa", "secret");
        let encoded = login.encode(&CodecOptions::legacy()).unwrap();

        assert_eq!(&encoded[..6], b"client");
        assert_eq!(encoded[30], 6);
        assert_eq!(&encoded[31..33], b"sa");
        assert_eq!(encoded[61], 2);
        assert_eq!(&encoded[62..68], b"secret");
        assert_eq!(encoded[92], 6);
        assert_eq!(login.packet_type(), PacketType::LegacyLogin);
    }

    #[test]
    fn test_sybase_login_carries_capabilities() {
        let login = Login::new(TdsVersion::V5_0).with_credentials("sa", "");
        let encoded = login.encode(&CodecOptions::legacy()).unwrap();
        let tail = &encoded[encoded.len() - CAPABILITIES.len() - 3..];
        assert_eq!(tail[0], CAPABILITY_TOKEN);
        assert_eq!(&tail[3..], &CAPABILITIES);
    }

    #[test]
    fn test_legacy_user_too_long() {
        let login = Login::new(TdsVersion::V4_2).with_credentials("u".repeat(31), "");
        assert!(matches!(
            login.encode(&CodecOptions::legacy()),
            Err(ProtocolError::FieldTooLong { field: "user name", .. })
        ));
    }
}
