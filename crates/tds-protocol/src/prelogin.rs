//! TDS pre-login packet handling.
//!
//! The pre-login packet is the first message a TDS 7.x client sends. It
//! carries the client version and the encryption mode the client wants; the
//! server answers with its own version and the mode it settled on.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Version bytes sent by the client (8.0.341, sub-build 0).
const CLIENT_VERSION: [u8; 6] = [8, 0, 0x01, 0x55, 0, 0];

/// Most option entries read from a server response.
const MAX_RESPONSE_OPTIONS: usize = 8;

/// Pre-login option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name (for named instances).
    Instance = 0x02,
    /// Thread ID.
    ThreadId = 0x03,
    /// Terminator (end of options).
    Terminator = 0xFF,
}

/// Encryption mode byte of the pre-login exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login packet only.
    Off = 0x00,
    /// Encrypt the whole connection.
    On = 0x01,
    /// No encryption available.
    #[default]
    NotSupported = 0x02,
    /// Server insists on encrypting the whole connection.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from raw byte value. Unknown values mean no encryption.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Off,
            0x01 => Self::On,
            0x03 => Self::Required,
            _ => Self::NotSupported,
        }
    }
}

/// How the transport is secured once the pre-login exchange is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// No TLS at all.
    Plain,
    /// TLS for the login packet, plain TDS afterwards.
    LoginOnly,
    /// TLS for the rest of the connection.
    Full,
}

/// Combine the client's request with the server's answer.
///
/// Returns `None` when the client insisted on encryption the server does not
/// offer. A server that requires encryption gets it even if the client only
/// asked for none.
#[must_use]
pub fn negotiate_encryption(
    requested: EncryptionLevel,
    server: EncryptionLevel,
) -> Option<Encryption> {
    use EncryptionLevel::{NotSupported, Off, On, Required};

    match (requested, server) {
        (NotSupported, NotSupported | Off) | (Off, NotSupported) => Some(Encryption::Plain),
        (Off, Off) => Some(Encryption::LoginOnly),
        (_, On | Required) => Some(Encryption::Full),
        (On | Required, NotSupported | Off) => None,
    }
}

/// Pre-login request built by the client.
#[derive(Debug, Clone, Default)]
pub struct PreLogin {
    /// Requested encryption mode.
    pub encryption: EncryptionLevel,
    /// Instance name (for named instances).
    pub instance: Option<String>,
    /// Client thread id.
    pub thread_id: u32,
}

impl PreLogin {
    /// Create a pre-login request.
    #[must_use]
    pub fn new(encryption: EncryptionLevel) -> Self {
        Self {
            encryption,
            instance: None,
            thread_id: std::process::id(),
        }
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Encode the pre-login payload.
    ///
    /// Every option entry is five bytes (type, big-endian offset and length),
    /// followed by a terminator and the option data.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let instance = self.instance.as_deref().unwrap_or("");
        let instance_len = instance.len() + 1;

        let header_size = 4 * 5 + 1;
        let mut buf = BytesMut::with_capacity(header_size + 11 + instance_len);

        let mut offset = header_size as u16;
        let entries = [
            (PreLoginOption::Version, CLIENT_VERSION.len() as u16),
            (PreLoginOption::Encryption, 1),
            (PreLoginOption::Instance, instance_len as u16),
            (PreLoginOption::ThreadId, 4),
        ];
        for (option, len) in entries {
            buf.put_u8(option as u8);
            buf.put_u16(offset);
            buf.put_u16(len);
            offset += len;
        }
        buf.put_u8(PreLoginOption::Terminator as u8);

        buf.put_slice(&CLIENT_VERSION);
        buf.put_u8(self.encryption as u8);
        buf.put_slice(instance.as_bytes());
        buf.put_u8(0);
        buf.put_u32(self.thread_id);

        buf.freeze()
    }
}

/// The server's pre-login answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreLoginResponse {
    /// Encryption mode chosen by the server.
    pub encryption: EncryptionLevel,
    /// Server product version, as major, minor and build.
    pub server_version: Option<(u8, u8, u16)>,
}

impl PreLoginResponse {
    /// Decode a server pre-login answer.
    ///
    /// The first directory entry holds the server version and the second the
    /// encryption mode. A response too short to hold the mode means the server
    /// does not support encryption.
    #[must_use]
    pub fn decode(src: &[u8]) -> Self {
        let mut response = Self {
            encryption: EncryptionLevel::NotSupported,
            server_version: None,
        };

        let mut headers = src;
        for index in 0..MAX_RESPONSE_OPTIONS {
            if !headers.has_remaining() {
                break;
            }
            let option = headers.get_u8();
            if option == PreLoginOption::Terminator as u8 || headers.remaining() < 4 {
                break;
            }
            let offset = headers.get_u16() as usize;
            let len = headers.get_u16() as usize;
            let Some(data) = src.get(offset..offset + len) else {
                continue;
            };

            match index {
                0 if len >= 4 => {
                    response.server_version =
                        Some((data[0], data[1], u16::from_be_bytes([data[2], data[3]])));
                }
                1 if len >= 1 => {
                    response.encryption = EncryptionLevel::from_u8(data[0]);
                }
                _ => {}
            }
        }

        response
    }
}

/// Reject a pre-login payload with a malformed option table.
///
/// Used by servers and tests that need the strict form of [`PreLoginResponse::decode`].
pub fn validate_options(src: &[u8]) -> Result<(), ProtocolError> {
    let mut headers = src;
    loop {
        if !headers.has_remaining() {
            return Err(ProtocolError::malformed("pre-login", "missing terminator"));
        }
        if headers.get_u8() == PreLoginOption::Terminator as u8 {
            return Ok(());
        }
        if headers.remaining() < 4 {
            return Err(ProtocolError::malformed("pre-login", "truncated option entry"));
        }
        let offset = headers.get_u16() as usize;
        let len = headers.get_u16() as usize;
        if offset + len > src.len() {
            return Err(ProtocolError::malformed(
                "pre-login",
                format!("option data {offset}+{len} past end of {}", src.len()),
            ));
        }
    }
}
