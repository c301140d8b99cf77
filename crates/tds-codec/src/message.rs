//! TDS message reassembly.
//!
//! Requests and replies may span several packets; the last one carries the
//! `END_OF_MESSAGE` status bit. Used for the small login-phase exchanges.
//! The session reader streams reply packets directly instead.

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};

use crate::packet_codec::Packet;

/// A complete TDS message reassembled from one or more packets.
#[derive(Debug, Clone)]
pub struct Message {
    /// The packet type of this message.
    pub packet_type: PacketType,
    /// The complete message payload (all packets combined).
    pub payload: Bytes,
}

impl Message {
    /// Get the message payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the message is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Split a message payload into packets of at most `packet_size` bytes.
///
/// Only the last packet carries `END_OF_MESSAGE`. An empty payload still
/// yields one header-only packet.
pub fn split_message(packet_type: PacketType, payload: &[u8], packet_size: usize) -> Vec<Packet> {
    let max_payload = packet_size.saturating_sub(PACKET_HEADER_SIZE).max(1);
    if payload.is_empty() {
        let header = PacketHeader::new(packet_type, PacketStatus::END_OF_MESSAGE, 0);
        return vec![Packet::new(header, BytesMut::new())];
    }

    let total = payload.len().div_ceil(max_payload);
    payload
        .chunks(max_payload)
        .enumerate()
        .map(|(i, chunk)| {
            let status = if i + 1 == total {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            Packet::new(
                PacketHeader::new(packet_type, status, 0),
                BytesMut::from(chunk),
            )
        })
        .collect()
}

/// Reassembles multiple TDS packets into complete messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
    packet_type: Option<PacketType>,
    packet_count: usize,
}

impl MessageAssembler {
    /// Create a new message assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a packet into the assembler.
    ///
    /// Returns `Some(Message)` if this packet completes a message,
    /// `None` if more packets are needed.
    pub fn push(&mut self, packet: Packet) -> Option<Message> {
        let packet_type = *self.packet_type.get_or_insert(packet.header.packet_type);
        self.buffer.extend_from_slice(&packet.payload);
        self.packet_count += 1;

        tracing::trace!(
            ?packet_type,
            packet_count = self.packet_count,
            buffer_len = self.buffer.len(),
            is_eom = packet.is_end_of_message(),
            "assembling message"
        );

        if !packet.is_end_of_message() {
            return None;
        }

        self.packet_type = None;
        self.packet_count = 0;
        Some(Message {
            packet_type,
            payload: self.buffer.split().freeze(),
        })
    }

    /// Check if the assembler has partial data buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.packet_type.is_some()
    }

    /// Get the number of packets accumulated so far.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Discard any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.packet_type = None;
        self.packet_count = 0;
    }
}
