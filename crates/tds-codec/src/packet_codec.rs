//! TDS packet codec implementation.

use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Number of payload bytes mirrored into the packet log.
const LOG_PREFIX_LEN: usize = 32;

/// A TDS packet with header and payload.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload (excluding header).
    pub payload: BytesMut,
}

impl Packet {
    /// Create a new packet with the given header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    /// Get the total packet size including header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// TDS packet codec for tokio-util framing.
///
/// Incoming packets are accepted up to the header's receive bound
/// regardless of the negotiated size; outgoing packets are bounded by the
/// negotiated packet size.
#[derive(Debug)]
pub struct TdsCodec {
    /// Largest packet this side will encode.
    packet_size: usize,
    /// Current packet sequence number for encoding.
    packet_id: u8,
    /// Largest packet seen on receive so far.
    high_water: usize,
}

impl TdsCodec {
    /// Create a new TDS codec with the extended-login default packet size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            packet_id: 1,
            high_water: 0,
        }
    }

    /// Create a codec with a specific outbound packet size.
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.set_packet_size(size);
        self
    }

    /// Change the outbound packet size.
    pub fn set_packet_size(&mut self, size: usize) {
        self.packet_size = size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE);
    }

    /// Outbound packet size in bytes, header included.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Largest packet length received so far.
    ///
    /// Never decreases; callers size reusable buffers from it.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    fn next_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        id
    }

    /// Reset the packet ID counter.
    pub fn reset_packet_id(&mut self) {
        self.packet_id = 1;
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        // Validate type and length before waiting for the body so a corrupt
        // stream fails fast instead of stalling on a bogus length.
        let header = PacketHeader::decode(&mut &src[..PACKET_HEADER_SIZE])
            .map_err(CodecError::InvalidHeader)?;
        let length = usize::from(header.length);

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        let payload = frame.split_off(PACKET_HEADER_SIZE);
        self.high_water = self.high_water.max(length);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            data = %hex_prefix(&payload),
            "received TDS packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::ConnectionClosed),
        }
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = item.total_size();

        if total_length > self.packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total_length,
                max: self.packet_size,
            });
        }

        dst.reserve(total_length);

        let mut header = item.header;
        header.length = total_length as u16;
        header.packet_id = self.next_packet_id();
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total_length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            data = %hex_prefix(&item.payload),
            "sent TDS packet"
        );

        Ok(())
    }
}

/// Render the first bytes of a payload as hex for the packet log.
fn hex_prefix(data: &[u8]) -> String {
    let shown = &data[..data.len().min(LOG_PREFIX_LEN)];
    let mut out = String::with_capacity(shown.len() * 3 + 3);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
    }
    if data.len() > LOG_PREFIX_LEN {
        out.push_str(" ..");
    }
    out
}
