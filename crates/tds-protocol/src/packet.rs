//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Smallest packet size a client may negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Default packet size for the extended (TDS 7.x) login.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Largest packet size a client may negotiate.
pub const MAX_PACKET_SIZE: usize = 32768;

/// Largest packet length accepted from a server.
pub const MAX_RECEIVE_PACKET_SIZE: usize = 65536;

/// TDS packet type.
///
/// Only these types are accepted on receive; anything else is treated as a
/// corrupt stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch (query) request.
    Query = 0x01,
    /// TDS 4.2/5.0 login.
    LegacyLogin = 0x02,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    Reply = 0x04,
    /// Out-of-band cancel.
    Cancel = 0x06,
    /// Bulk load / MSDTC request.
    MsDtc = 0x0E,
    /// TDS 7.x login.
    Login = 0x10,
    /// NTLM authentication.
    Ntlm = 0x11,
    /// Pre-login negotiation.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Query),
            0x02 => Ok(Self::LegacyLogin),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::Reply),
            0x06 => Ok(Self::Cancel),
            0x0E => Ok(Self::MsDtc),
            0x10 => Ok(Self::Login),
            0x11 => Ok(Self::Ntlm),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// More packets of this message follow.
        const NORMAL = 0x00;
        /// Last packet of a message.
        const END_OF_MESSAGE = 0x01;
        /// Ignore this event.
        const IGNORE_EVENT = 0x02;
        /// Reset connection.
        const RESET_CONNECTION = 0x08;
    }
}

/// TDS packet header.
///
/// Every packet begins with eight bytes: type, status, big-endian length
/// (header included), big-endian channel, packet id and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Channel (server process id).
    pub spid: u16,
    /// Packet sequence number (wraps at 255).
    pub packet_id: u8,
    /// Window (unused, zero).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse and validate a packet header.
    ///
    /// The type must be in the allow-list and the declared length must lie
    /// in `[PACKET_HEADER_SIZE, MAX_RECEIVE_PACKET_SIZE]`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        validate_length(usize::from(length))?;

        Ok(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }
}

/// Check a declared packet length against the receive bounds.
pub fn validate_length(length: usize) -> Result<(), ProtocolError> {
    if !(PACKET_HEADER_SIZE..=MAX_RECEIVE_PACKET_SIZE).contains(&length) {
        return Err(ProtocolError::InvalidPacketLength {
            length,
            min: PACKET_HEADER_SIZE,
            max: MAX_RECEIVE_PACKET_SIZE,
        });
    }
    Ok(())
}

/// Clamp a requested packet size to the negotiable range.
///
/// Zero selects the version default.
#[must_use]
pub fn clamp_packet_size(requested: usize, default: usize) -> usize {
    if requested == 0 {
        default
    } else {
        requested.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::Query,
            status: PacketStatus::END_OF_MESSAGE,
            length: 100,
            spid: 54,
            packet_id: 1,
            window: 0,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        assert_eq!(&bytes[..4], &[0x01, 0x01, 0x00, 0x64]);

        let mut cursor = bytes.as_ref();
        let decoded = PacketHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_payload_length() {
        let header = PacketHeader::new(PacketType::Query, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_packet_type_allow_list() {
        for byte in [0x01, 0x02, 0x03, 0x04, 0x06, 0x0E, 0x10, 0x11, 0x12] {
            assert_eq!(PacketType::from_u8(byte).unwrap() as u8, byte);
        }
        for byte in [0x00, 0x05, 0x07, 0x0F, 0x13, 0xFF] {
            assert!(PacketType::from_u8(byte).is_err());
        }
    }

    #[test]
    fn test_length_below_header_rejected() {
        let raw = [0x04u8, 0x01, 0x00, 0x07, 0x00, 0x00, 0x01, 0x00];
        let err = PacketHeader::decode(&mut &raw[..]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPacketLength { length: 7, .. }
        ));
    }

    #[test]
    fn test_clamp_packet_size() {
        assert_eq!(clamp_packet_size(0, 4096), 4096);
        assert_eq!(clamp_packet_size(100, 4096), MIN_PACKET_SIZE);
        assert_eq!(clamp_packet_size(65000, 4096), MAX_PACKET_SIZE);
        assert_eq!(clamp_packet_size(8192, 4096), 8192);
    }
}
