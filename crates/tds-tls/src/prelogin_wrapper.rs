//! TDS pre-login wrapper for the TLS handshake.
//!
//! While the handshake runs, TLS records travel inside TDS pre-login
//! packets. Outgoing records are grouped into flights before framing: a
//! ClientHello goes out alone, and the key exchange, change-cipher-spec and
//! Finished records go out together in one packet. Once Finished has been
//! written, or the server starts sending bare TLS records, that direction
//! switches to pass-through for good.

use std::cmp;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// TDS packet header size.
const HEADER_SIZE: usize = 8;

/// TDS packet type for pre-login.
const PACKET_TYPE_PRELOGIN: u8 = 0x12;

/// TDS packet type for a tabular reply.
const PACKET_TYPE_REPLY: u8 = 0x04;

/// TDS packet status for end of message.
const PACKET_STATUS_EOM: u8 = 0x01;

/// Largest pre-login packet written during the handshake.
const HANDSHAKE_PACKET_SIZE: usize = 4096;

/// TLS record header: content type, version, length.
const RECORD_HEADER_SIZE: usize = 5;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_CLIENT_KEY_EXCHANGE: u8 = 16;

/// TLS record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Change cipher spec.
    ChangeCipherSpec = 20,
    /// Alert.
    Alert = 21,
    /// Handshake message.
    Handshake = 22,
    /// Application data.
    ApplicationData = 23,
}

impl RecordType {
    /// Classify a record's first byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

fn malformed(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Type and total length of the complete record at the start of `data`.
fn next_record(data: &[u8]) -> io::Result<Option<(RecordType, usize)>> {
    if data.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let kind = RecordType::from_u8(data[0])
        .ok_or_else(|| malformed(format!("unknown TLS record type 0x{:02X}", data[0])))?;
    let total = RECORD_HEADER_SIZE + usize::from(u16::from_be_bytes([data[3], data[4]]));
    if data.len() < total {
        return Ok(None);
    }
    Ok(Some((kind, total)))
}

/// Length of the next flight at the front of `pending` and whether it
/// carries the Finished record.
///
/// Returns `None` while the flight is incomplete.
fn next_flight(pending: &[u8]) -> io::Result<Option<(usize, bool)>> {
    let mut pos = 0;
    let mut key_exchange = false;
    let mut cipher_changed = false;

    while let Some((kind, len)) = next_record(&pending[pos..])? {
        let handshake_type = pending.get(pos + RECORD_HEADER_SIZE).copied();

        if kind == RecordType::Handshake && !cipher_changed {
            if handshake_type == Some(HANDSHAKE_CLIENT_HELLO) {
                // ClientHello travels alone.
                let end = if pos > 0 { pos } else { len };
                return Ok(Some((end, false)));
            }
            if handshake_type == Some(HANDSHAKE_CLIENT_KEY_EXCHANGE) {
                key_exchange = true;
            }
        }

        pos += len;
        if kind == RecordType::ChangeCipherSpec {
            cipher_changed = true;
        } else if cipher_changed {
            // The record after change-cipher-spec is Finished.
            return Ok(Some((pos, true)));
        }
    }

    if pos == 0 || key_exchange || cipher_changed {
        Ok(None)
    } else {
        Ok(Some((pos, false)))
    }
}

#[derive(Debug)]
enum ReadState {
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    Body { remaining: usize },
    PassThrough,
}

impl ReadState {
    fn header() -> Self {
        Self::Header {
            buf: [0; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Wrapper for TLS streams that adds TDS packet framing during the handshake.
pub struct TlsPreloginWrapper<S> {
    stream: S,

    read: ReadState,
    /// Bytes consumed while classifying a read that belong to the TLS layer.
    replay: Vec<u8>,
    replay_pos: usize,

    /// Records written by TLS and not yet framed.
    pending: Vec<u8>,
    /// Framed bytes waiting to reach the stream.
    out: Vec<u8>,
    out_pos: usize,
    packet_id: u8,
    finished_queued: bool,
    write_pass_through: bool,
}

impl<S> TlsPreloginWrapper<S> {
    /// Create a new TLS pre-login wrapper.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read: ReadState::header(),
            replay: Vec::new(),
            replay_pos: 0,
            pending: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            packet_id: 1,
            finished_queued: false,
            write_pass_through: false,
        }
    }

    /// Switch both directions to pass-through.
    ///
    /// A read that stopped inside a framed packet finishes that packet
    /// first; the next header is then classified as bare TLS.
    pub fn handshake_complete(&mut self) {
        if !self.pending.is_empty() {
            let rest = mem::take(&mut self.pending);
            self.out.extend_from_slice(&rest);
        }
        self.write_pass_through = true;
        if matches!(self.read, ReadState::Header { filled: 0, .. }) {
            self.read = ReadState::PassThrough;
        }
    }

    /// True once both directions are pass-through.
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.write_pass_through && matches!(self.read, ReadState::PassThrough)
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn frame_flight(&mut self, flight: &[u8]) {
        let max_payload = HANDSHAKE_PACKET_SIZE - HEADER_SIZE;
        let total = flight.len().div_ceil(max_payload);
        for (i, chunk) in flight.chunks(max_payload).enumerate() {
            let length = (HEADER_SIZE + chunk.len()) as u16;
            let status = if i + 1 == total { PACKET_STATUS_EOM } else { 0 };
            self.out.push(PACKET_TYPE_PRELOGIN);
            self.out.push(status);
            self.out.extend_from_slice(&length.to_be_bytes());
            self.out.extend_from_slice(&[0, 0, self.packet_id, 0]);
            self.out.extend_from_slice(chunk);
            self.packet_id = self.packet_id.wrapping_add(1);
        }
        tracing::trace!(bytes = flight.len(), packets = total, "TLS handshake flight framed");
    }
}

impl<S: AsyncWrite + Unpin> TlsPreloginWrapper<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsPreloginWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.read {
                ReadState::PassThrough => {
                    if this.replay_pos < this.replay.len() {
                        let n = cmp::min(buf.remaining(), this.replay.len() - this.replay_pos);
                        buf.put_slice(&this.replay[this.replay_pos..this.replay_pos + n]);
                        this.replay_pos += n;
                        return Poll::Ready(Ok(()));
                    }
                    return Pin::new(&mut this.stream).poll_read(cx, buf);
                }
                ReadState::Header { buf: header, filled } => {
                    let mut header_buf = ReadBuf::new(&mut header[*filled..]);
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut header_buf))?;
                    let n = header_buf.filled().len();
                    if n == 0 {
                        if *filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "truncated packet header during TLS handshake",
                        )));
                    }
                    *filled += n;
                    let (header, filled) = (*header, *filled);

                    if RecordType::from_u8(header[0]).is_some() {
                        tracing::debug!("server sent bare TLS records, reads now pass through");
                        this.replay = header[..filled].to_vec();
                        this.replay_pos = 0;
                        this.read = ReadState::PassThrough;
                        continue;
                    }
                    if filled < HEADER_SIZE {
                        continue;
                    }
                    if header[0] != PACKET_TYPE_PRELOGIN && header[0] != PACKET_TYPE_REPLY {
                        return Poll::Ready(Err(malformed(format!(
                            "expected pre-login packet during TLS handshake, got 0x{:02X}",
                            header[0]
                        ))));
                    }
                    let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
                    if length < HEADER_SIZE {
                        return Poll::Ready(Err(malformed(format!(
                            "packet length {length} shorter than its header"
                        ))));
                    }
                    tracing::trace!(length, "TLS handshake packet received");
                    this.read = if length == HEADER_SIZE {
                        ReadState::header()
                    } else {
                        ReadState::Body {
                            remaining: length - HEADER_SIZE,
                        }
                    };
                }
                ReadState::Body { remaining } => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let mut temp = vec![0u8; cmp::min(*remaining, buf.remaining())];
                    let mut temp_buf = ReadBuf::new(&mut temp);
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut temp_buf))?;
                    let n = temp_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "truncated TLS handshake packet",
                        )));
                    }
                    buf.put_slice(&temp[..n]);
                    *remaining -= n;
                    if *remaining == 0 {
                        this.read = ReadState::header();
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsPreloginWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_pass_through {
            ready!(this.poll_drain(cx))?;
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }

        this.pending.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            ready!(this.poll_drain(cx))?;

            if this.finished_queued {
                this.finished_queued = false;
                this.write_pass_through = true;
                tracing::debug!("Finished sent, writes now pass through");
                if !this.pending.is_empty() {
                    this.out = mem::take(&mut this.pending);
                    continue;
                }
            }
            if this.write_pass_through {
                break;
            }

            match next_flight(&this.pending)? {
                Some((len, finished)) => {
                    let flight: Vec<u8> = this.pending.drain(..len).collect();
                    this.frame_flight(&flight);
                    this.finished_queued = finished;
                }
                None => break,
            }
        }

        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for TlsPreloginWrapper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsPreloginWrapper")
            .field("read", &self.read)
            .field("write_pass_through", &self.write_pass_through)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
