//! Split I/O connection for out-of-band cancellation.
//!
//! The transport is split into read and write halves so a cancel packet can
//! be written from another task while the owner is blocked reading a reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tds_protocol::packet::{
    MAX_PACKET_SIZE, MIN_PACKET_SIZE, PacketHeader, PacketStatus, PacketType,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::CodecError;
use crate::framed::{PacketReader, PacketWriter};
use crate::message::split_message;
use crate::packet_codec::{Packet, TdsCodec};

type SharedWriter<T> = Arc<Mutex<PacketWriter<WriteHalf<T>>>>;

/// Request lifecycle shared between a connection and its cancel handles.
///
/// One atomic word, so deciding that a response has ended and deciding to
/// send a cancel cannot interleave: whichever transition lands first wins.
#[derive(Debug, Default)]
struct CancelState(AtomicU8);

impl CancelState {
    /// No request outstanding.
    const IDLE: u8 = 0;
    /// A request has been flushed and its reply is not fully read.
    const IN_FLIGHT: u8 = 1;
    /// A cancel packet was sent and not yet acknowledged.
    const PENDING: u8 = 2;

    fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    fn store(&self, state: u8) {
        self.0.store(state, Ordering::Release);
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A TDS connection with split I/O.
///
/// # Example
///
/// ```rust,ignore
/// use tds_codec::Connection;
/// use tokio::net::TcpStream;
///
/// let stream = TcpStream::connect("localhost:1433").await?;
/// let conn = Connection::new(stream, 4096);
///
/// let cancel = conn.cancel_handle();
/// tokio::spawn(async move {
///     tokio::time::sleep(Duration::from_secs(5)).await;
///     cancel.cancel().await?;
/// });
/// ```
pub struct Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    reader: PacketReader<ReadHalf<T>>,
    /// Shared with cancel handles; the lock keeps a cancel packet from
    /// landing inside a multi-packet request.
    writer: SharedWriter<T>,
    cancel: Arc<CancelState>,
    packet_size: usize,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Create a new connection from a transport with the given outbound
    /// packet size.
    pub fn new(transport: T, packet_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let codec = TdsCodec::new().with_packet_size(packet_size);
        let packet_size = codec.packet_size();

        Self {
            reader: PacketReader::new(read_half),
            writer: Arc::new(Mutex::new(PacketWriter::with_codec(write_half, codec))),
            cancel: Arc::new(CancelState::default()),
            packet_size,
        }
    }

    /// Get a handle for cancelling requests on this connection.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle {
            writer: Arc::clone(&self.writer),
            state: Arc::clone(&self.cancel),
        }
    }

    /// Outbound packet size in bytes.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Buffer capacity used for the next outbound packet.
    ///
    /// Equal to the packet size; changes take effect on the next send.
    #[must_use]
    pub fn outbound_capacity(&self) -> usize {
        self.packet_size
    }

    /// Change the outbound packet size after a server notification.
    pub fn set_packet_size(&mut self, size: usize) {
        let size = size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        tracing::debug!(old = self.packet_size, new = size, "packet size changed");
        self.packet_size = size;
    }

    /// Largest packet received so far.
    #[must_use]
    pub fn receive_high_water_mark(&self) -> usize {
        self.reader.codec().high_water_mark()
    }

    /// Check if a cancellation is waiting for its acknowledgement.
    #[must_use]
    pub fn is_cancel_pending(&self) -> bool {
        self.cancel.load() == CancelState::PENDING
    }

    /// Check if a request is outstanding.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.cancel.load() != CancelState::IDLE
    }

    /// Try to end the outstanding request on its final Done token.
    ///
    /// Returns `false` when a cancel is pending: its acknowledgement is still
    /// on the way and the response must be read up to it. Once this returns
    /// `true` no cancel can be sent for the request.
    pub fn finish_response(&self) -> bool {
        self.cancel
            .transition(CancelState::IN_FLIGHT, CancelState::IDLE)
            || self.cancel.load() == CancelState::IDLE
    }

    /// Record that the reply to the outstanding request has been consumed.
    pub fn response_complete(&self) {
        self.cancel.store(CancelState::IDLE);
    }

    /// Record that the server acknowledged a cancel.
    pub fn cancel_acknowledged(&self) {
        if self
            .cancel
            .transition(CancelState::PENDING, CancelState::IDLE)
        {
            tracing::debug!("cancel acknowledged by server");
        }
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Read exactly one packet.
    pub async fn read_packet(&mut self) -> Result<Packet, CodecError> {
        match self.reader.next().await {
            Some(packet) => packet,
            None => Err(CodecError::ConnectionClosed),
        }
    }

    /// Write one packet, flushing when it ends the message.
    pub async fn send_packet(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        last: bool,
    ) -> Result<(), CodecError> {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let packet = Packet::new(
            PacketHeader::new(packet_type, status, 0),
            BytesMut::from(payload),
        );

        let mut writer = self.writer.lock().await;
        writer.codec_mut().set_packet_size(self.packet_size);
        if last {
            writer.send(packet).await?;
            self.cancel.store(CancelState::IN_FLIGHT);
        } else {
            writer.feed(packet).await?;
        }
        Ok(())
    }

    /// Send a complete message split to the current packet size, then flush.
    ///
    /// The request counts as in flight once the flush succeeds.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.codec_mut().set_packet_size(self.packet_size);

        for packet in split_message(packet_type, payload, self.packet_size) {
            writer.feed(packet).await?;
        }
        writer.flush().await?;

        self.cancel.store(CancelState::IN_FLIGHT);
        Ok(())
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.close().await
    }
}

impl<T> std::fmt::Debug for Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("packet_size", &self.packet_size)
            .field("in_flight", &self.is_in_flight())
            .field("cancel_pending", &self.is_cancel_pending())
            .finish_non_exhaustive()
    }
}

/// Handle for cancelling the outstanding request on a connection.
///
/// Cloneable and `Send`, so a timer task can hold one.
pub struct CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    writer: SharedWriter<T>,
    state: Arc<CancelState>,
}

impl<T> CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Check if a cancellation is waiting for its acknowledgement.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.load() == CancelState::PENDING
    }

    /// Check if a request is outstanding.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.state.load() != CancelState::IDLE
    }
}

impl<T> CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a cancel packet for the outstanding request.
    ///
    /// Returns `Ok(false)` without touching the wire when nothing is in
    /// flight, the response has already ended, or a cancel is already
    /// pending.
    pub async fn cancel(&self) -> Result<bool, CodecError> {
        if !self
            .state
            .transition(CancelState::IN_FLIGHT, CancelState::PENDING)
        {
            return Ok(false);
        }

        let header = PacketHeader::new(PacketType::Cancel, PacketStatus::END_OF_MESSAGE, 0);
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(Packet::new(header, BytesMut::new())).await {
            self.state
                .transition(CancelState::PENDING, CancelState::IN_FLIGHT);
            return Err(err);
        }

        tracing::debug!("cancel packet sent");
        Ok(true)
    }
}

impl<T> Clone for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const QUERY_PACKET: [u8; 11] = [0x01, 0x01, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x00, 1, 2, 3];

    #[tokio::test]
    async fn test_cancel_idle_is_noop() {
        let mock = tokio_test::io::Builder::new().build();
        let conn = Connection::new(mock, 4096);
        let handle = conn.cancel_handle();

        assert!(!handle.cancel().await.unwrap());
        assert!(!conn.is_cancel_pending());
    }

    #[tokio::test]
    async fn test_cancel_sent_once_while_in_flight() {
        let mock = tokio_test::io::Builder::new()
            .write(&QUERY_PACKET)
            .write(&[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x02, 0x00])
            .build();
        let mut conn = Connection::new(mock, 4096);
        conn.send_message(PacketType::Query, &[1, 2, 3]).await.unwrap();
        assert!(conn.is_in_flight());

        let handle = conn.cancel_handle();
        assert!(handle.cancel().await.unwrap());
        assert!(!handle.cancel().await.unwrap());
        assert!(conn.is_cancel_pending());

        conn.cancel_acknowledged();
        assert!(!handle.is_pending());
    }

    #[tokio::test]
    async fn test_cancel_refused_after_response_finished() {
        let mock = tokio_test::io::Builder::new().write(&QUERY_PACKET).build();
        let mut conn = Connection::new(mock, 4096);
        conn.send_message(PacketType::Query, &[1, 2, 3]).await.unwrap();
        let handle = conn.cancel_handle();

        assert!(conn.finish_response());
        assert!(!handle.is_in_flight());
        assert!(!handle.cancel().await.unwrap());
        assert!(!conn.is_cancel_pending());
    }

    #[tokio::test]
    async fn test_pending_cancel_keeps_response_open() {
        let mock = tokio_test::io::Builder::new()
            .write(&QUERY_PACKET)
            .write(&[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x02, 0x00])
            .build();
        let mut conn = Connection::new(mock, 4096);
        conn.send_message(PacketType::Query, &[1, 2, 3]).await.unwrap();
        assert!(conn.cancel_handle().cancel().await.unwrap());

        assert!(!conn.finish_response());
        assert!(conn.is_in_flight());
        conn.cancel_acknowledged();
        assert!(!conn.is_in_flight());
        assert!(conn.finish_response());
    }

    #[tokio::test]
    async fn test_packet_size_change_applies_to_next_send() {
        let payload = vec![0x55u8; 600];
        let mut expected = vec![0x01, 0x01, 0x02, 0x60, 0x00, 0x00, 0x01, 0x00];
        expected.extend_from_slice(&payload);

        let mock = tokio_test::io::Builder::new().write(&expected).build();
        let mut conn = Connection::new(mock, 512);
        conn.set_packet_size(1024);
        assert_eq!(conn.outbound_capacity(), 1024);

        conn.send_message(PacketType::Query, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_packet_partial_then_last() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0x03, 0x00, 0x00, 0x09, 0x00, 0x00, 0x01, 0x00, 0xAA])
            .write(&[0x03, 0x01, 0x00, 0x09, 0x00, 0x00, 0x02, 0x00, 0xBB])
            .build();
        let mut conn = Connection::new(mock, 4096);

        conn.send_packet(PacketType::Rpc, &[0xAA], false).await.unwrap();
        assert!(!conn.is_in_flight());
        conn.send_packet(PacketType::Rpc, &[0xBB], true).await.unwrap();
        assert!(conn.is_in_flight());
    }

    #[tokio::test]
    async fn test_read_packet_and_close() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x04, 0x01, 0x00, 0x09, 0x00, 0x00, 0x01, 0x00, 0xFD])
            .build();
        let mut conn = Connection::new(mock, 4096);

        let packet = conn.read_packet().await.unwrap();
        assert_eq!(&packet.payload[..], &[0xFD]);
        assert!(conn.read_packet().await.unwrap_err().is_closed());
    }
}
