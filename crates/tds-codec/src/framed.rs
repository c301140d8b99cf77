//! Framed packet streams for async I/O.
//!
//! - `PacketStream<T>` reads and writes over one transport. It is used for
//!   the pre-login and login exchanges, before the stream is split.
//! - `PacketReader<T>` and `PacketWriter<T>` are the two halves used by
//!   [`Connection`](crate::Connection) once the session is established.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use pin_project_lite::pin_project;
use tds_protocol::packet::PacketType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::message::{Message, MessageAssembler, split_message};
use crate::packet_codec::{Packet, TdsCodec};

pin_project! {
    /// A framed packet stream over an async I/O transport.
    pub struct PacketStream<T> {
        #[pin]
        inner: Framed<T, TdsCodec>,
        assembler: MessageAssembler,
    }
}

impl<T> PacketStream<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Create a new packet stream over the given transport.
    pub fn new(transport: T) -> Self {
        Self::with_codec(transport, TdsCodec::new())
    }

    /// Create a new packet stream with a custom codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: Framed::new(transport, codec),
            assembler: MessageAssembler::new(),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Get a mutable reference to the codec.
    pub fn codec_mut(&mut self) -> &mut TdsCodec {
        self.inner.codec_mut()
    }

    /// Consume the stream and return the underlying transport.
    ///
    /// Any bytes read ahead but not yet decoded are discarded, so only call
    /// this at a point where the peer is waiting for us.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> PacketStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a complete message, split to the codec's packet size, and flush.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        let packet_size = self.inner.codec().packet_size();
        for packet in split_message(packet_type, payload, packet_size) {
            self.inner.feed(packet).await?;
        }
        self.inner.flush().await
    }

    /// Read packets until a complete message has arrived.
    pub async fn read_message(&mut self) -> Result<Message, CodecError> {
        loop {
            match self.inner.next().await {
                Some(packet) => {
                    if let Some(message) = self.assembler.push(packet?) {
                        return Ok(message);
                    }
                }
                None => return Err(CodecError::ConnectionClosed),
            }
        }
    }
}

impl<T> std::fmt::Debug for PacketStream<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("transport", self.inner.get_ref())
            .finish_non_exhaustive()
    }
}

pin_project! {
    /// A read-only packet stream for receiving TDS packets.
    pub struct PacketReader<T> {
        #[pin]
        inner: FramedRead<T, TdsCodec>,
    }
}

impl<T> PacketReader<T>
where
    T: AsyncRead,
{
    /// Create a new packet reader over the given transport.
    pub fn new(transport: T) -> Self {
        Self {
            inner: FramedRead::new(transport, TdsCodec::new()),
        }
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &TdsCodec {
        self.inner.decoder()
    }
}

impl<T> Stream for PacketReader<T>
where
    T: AsyncRead + Unpin,
{
    type Item = Result<Packet, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T> std::fmt::Debug for PacketReader<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

pin_project! {
    /// A write-only packet sink for sending TDS packets.
    pub struct PacketWriter<T> {
        #[pin]
        inner: FramedWrite<T, TdsCodec>,
    }
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite,
{
    /// Create a new packet writer with the given codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: FramedWrite::new(transport, codec),
        }
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &TdsCodec {
        self.inner.encoder()
    }

    /// Get a mutable reference to the codec.
    pub fn codec_mut(&mut self) -> &mut TdsCodec {
        self.inner.encoder_mut()
    }

    /// Get a mutable reference to the underlying transport.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> Sink<Packet> for PacketWriter<T>
where
    T: AsyncWrite + Unpin,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Packet) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}

impl<T> std::fmt::Debug for PacketWriter<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_message_splits_and_flushes() {
        let payload = vec![0x41u8; 600];
        let mut expected = Vec::new();
        expected.extend_from_slice(&[0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00]);
        expected.extend_from_slice(&payload[..504]);
        expected.extend_from_slice(&[0x01, 0x01, 0x00, 0x68, 0x00, 0x00, 0x02, 0x00]);
        expected.extend_from_slice(&payload[504..]);

        let mock = tokio_test::io::Builder::new().write(&expected).build();
        let mut stream = PacketStream::with_codec(mock, TdsCodec::new().with_packet_size(512));
        stream
            .send_message(PacketType::Query, &payload)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_message_across_packets() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x04, 0x00, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x00, b'a', b'b', b'c'])
            .read(&[0x04, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x02, 0x00, b'd', b'e'])
            .build();
        let mut stream = PacketStream::new(mock);

        let message = stream.read_message().await.unwrap();
        assert_eq!(message.packet_type, PacketType::Reply);
        assert_eq!(&message.payload[..], b"abcde");
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let mock = tokio_test::io::Builder::new().build();
        let mut stream = PacketStream::new(mock);
        assert!(matches!(
            stream.read_message().await,
            Err(CodecError::ConnectionClosed)
        ));
    }
}
