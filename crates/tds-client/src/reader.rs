//! Response token reader.
//!
//! Pulls packets from the connection, decodes one token at a time and folds
//! it into the [`SessionState`]. Tokens never span messages, but they do
//! span packets: bytes are buffered until a whole token is available.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tds_codec::Connection;
use tds_protocol::ProtocolError;
use tds_protocol::token::{
    Done, Token, TokenContext, TokenType, decode_token, is_resource_exhaustion, peek_tag,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::session::{Event, SessionState};

/// Token-at-a-time reader over one connection.
#[derive(Debug)]
pub struct TokenReader {
    buf: BytesMut,
    /// Output values split out of a PARAMS token.
    queued: VecDeque<Token>,
    message_done: bool,
    awaiting_first_byte: bool,
    closing: bool,
}

impl Default for TokenReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenReader {
    /// Create an idle reader.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            queued: VecDeque::new(),
            message_done: true,
            awaiting_first_byte: false,
            closing: false,
        }
    }

    /// Prepare for the response to a request that was just sent.
    pub fn start(&mut self) {
        self.buf.clear();
        self.queued.clear();
        self.message_done = false;
        self.awaiting_first_byte = true;
    }

    /// Check if the server is about to drop the connection.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Read the next token.
    ///
    /// At end of response a terminal Done token is synthesized without
    /// touching the stream, however often this is called.
    pub async fn next_token<T>(
        &mut self,
        conn: &mut Connection<T>,
        session: &mut SessionState,
        first_byte_timeout: Option<Duration>,
    ) -> Result<Token>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if session.is_end_of_response() {
            return Ok(Token::Done(Done::end_of_response()));
        }

        loop {
            if !self.buf.is_empty() {
                let decoded = {
                    let opts = *session.codec_options();
                    let ctx = TokenContext {
                        version: session.version(),
                        opts: &opts,
                        columns: session.columns(),
                        params: session.param_formats(),
                    };
                    let mut src = &self.buf[..];
                    decode_token(&mut src, &ctx).map(|token| (token, src.remaining()))
                };

                match decoded {
                    Ok((token, remaining)) => {
                        let used = self.buf.len() - remaining;
                        self.buf.advance(used);
                        tracing::trace!(bytes = used, ?token, "token decoded");
                        return Ok(token);
                    }
                    Err(e) if e.is_incomplete() => {
                        if self.message_done {
                            let err = ProtocolError::Malformed {
                                context: "response",
                                reason: "message ends mid-token".into(),
                            };
                            return Err(self.fail(session, err.into()));
                        }
                    }
                    Err(e) if is_resource_exhaustion(&e) => {
                        return Err(self.exhausted(conn, session, e).await);
                    }
                    Err(e) => return Err(self.fail(session, e.into())),
                }
            }

            if let Err(e) = self.fill(conn, first_byte_timeout).await {
                if matches!(e, Error::Timeout) {
                    return Err(e);
                }
                return Err(self.fail(session, e));
            }
        }
    }

    /// Read tokens until one produces an event for the caller.
    pub async fn next_event<T>(
        &mut self,
        conn: &mut Connection<T>,
        session: &mut SessionState,
        first_byte_timeout: Option<Duration>,
    ) -> Result<Event>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let token = match self.queued.pop_front() {
                Some(token) => token,
                None => self.next_token(conn, session, first_byte_timeout).await?,
            };
            if let Token::Params(values) = token {
                self.queued.extend(values.into_iter().map(Token::ReturnValue));
                continue;
            }
            let is_metadata = matches!(token, Token::ColMetaData(_) | Token::ColFmt(_));

            // Ending the request and accepting a cancel for it are one atomic
            // decision; a cancel that got in first keeps the response open
            // until its acknowledgement.
            let cancel_pending = match &token {
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done)
                    if !done.has_more() =>
                {
                    !conn.finish_response()
                }
                _ => conn.is_cancel_pending(),
            };

            let applied = session.apply(token, cancel_pending);
            if let Some(size) = applied.packet_size {
                conn.set_packet_size(size);
            }
            if applied.cancel_acknowledged {
                conn.cancel_acknowledged();
            }
            if applied.close {
                self.closing = true;
            }
            if session.is_end_of_response() {
                conn.response_complete();
            }

            let Some(mut event) = applied.event else {
                continue;
            };
            if is_metadata && self.skip_trailers(conn, session).await? {
                event = Event::ResultSet(session.columns_snapshot());
            }
            return Ok(event);
        }
    }

    /// Fold any table-name, column-info or control tokens that follow result
    /// metadata, so callers see metadata followed directly by rows.
    ///
    /// Returns whether any trailer was applied.
    async fn skip_trailers<T>(
        &mut self,
        conn: &mut Connection<T>,
        session: &mut SessionState,
    ) -> Result<bool>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut applied_any = false;
        loop {
            if self.buf.is_empty() {
                if self.message_done {
                    return Ok(applied_any);
                }
                if let Err(e) = self.fill(conn, None).await {
                    return Err(self.fail(session, e));
                }
                continue;
            }

            match peek_tag(&self.buf).and_then(TokenType::from_u8) {
                Some(tag) if tag.is_metadata_trailer() => {
                    let token = self.next_token(conn, session, None).await?;
                    session.apply(token, false);
                    applied_any = true;
                }
                _ => return Ok(applied_any),
            }
        }
    }

    async fn fill<T>(
        &mut self,
        conn: &mut Connection<T>,
        first_byte_timeout: Option<Duration>,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = first_byte_timeout.filter(|_| self.awaiting_first_byte);
        let packet = match timeout {
            Some(limit) => match tokio::time::timeout(limit, conn.read_packet()).await {
                Ok(packet) => packet?,
                Err(_) => {
                    self.awaiting_first_byte = false;
                    tracing::debug!(?limit, "no response within command timeout, cancelling");
                    conn.cancel_handle().cancel().await?;
                    return Err(Error::Timeout);
                }
            },
            None => conn.read_packet().await?,
        };

        self.awaiting_first_byte = false;
        self.message_done = packet.is_end_of_message();
        tracing::trace!(
            packet_type = ?packet.header.packet_type,
            length = packet.header.length,
            packet_id = packet.header.packet_id,
            eom = self.message_done,
            "packet received"
        );
        self.buf.extend_from_slice(&packet.payload);
        Ok(())
    }

    /// Drain the rest of the message so the stream stays aligned, then
    /// report the oversized value as fatal.
    async fn exhausted<T>(
        &mut self,
        conn: &mut Connection<T>,
        session: &mut SessionState,
        cause: ProtocolError,
    ) -> Error
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::warn!(error = %cause, "value exceeds size limit, draining response");
        while !self.message_done {
            match conn.read_packet().await {
                Ok(packet) => self.message_done = packet.is_end_of_message(),
                Err(_) => break,
            }
        }
        self.buf.clear();
        self.closing = true;
        session.mark_fatal();
        Error::ResourceExhausted(cause.to_string())
    }

    fn fail(&mut self, session: &mut SessionState, err: Error) -> Error {
        tracing::debug!(error = %err, "response read failed, session is unusable");
        self.buf.clear();
        self.message_done = true;
        self.closing = true;
        session.mark_fatal();
        err
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::ServerType;
    use crate::session::OutputSlots;
    use bytes::BufMut;
    use tds_protocol::packet::PacketType;
    use tds_protocol::token::DoneStatus;
    use tds_protocol::version::TdsVersion;
    use crate::session::Completion;
    use tds_types::{ParamDescriptor, SqlValue, TypeId};
    use tokio_test::io::Builder;

    fn reply(payload: &[u8], last: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.put_u8(0x04);
        out.put_u8(u8::from(last));
        out.put_u16((payload.len() + 8) as u16);
        out.put_u16(0);
        out.put_u8(1);
        out.put_u8(0);
        out.extend_from_slice(payload);
        out
    }

    fn done_bytes(status: DoneStatus, row_count: i32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Done {
            status,
            cur_cmd: 0xC3,
            row_count,
        }
        .encode(TokenType::Done, &mut buf);
        buf.to_vec()
    }

    fn session() -> SessionState {
        let mut s = SessionState::new(TdsVersion::V7_1, ServerType::SqlServer, 4096);
        s.begin_request(OutputSlots::default());
        s
    }

    #[tokio::test]
    async fn test_token_split_across_packets() {
        let done = done_bytes(DoneStatus::COUNT, 3);
        let mock = Builder::new()
            .read(&reply(&done[..4], false))
            .read(&reply(&done[4..], true))
            .build();
        let mut conn = Connection::new(mock, 4096);
        let mut session = session();
        let mut reader = TokenReader::new();
        reader.start();

        let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
        match event {
            Event::Done(c) => assert_eq!(c.update_count, Some(3)),
            other => panic!("unexpected {other:?}"),
        }

        // End is synthesized without reading.
        for _ in 0..2 {
            let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
            assert_eq!(event, Event::End);
        }
    }

    fn query(packet_id: u8) -> Vec<u8> {
        vec![0x01, 0x01, 0x00, 0x09, 0x00, 0x00, packet_id, 0x00, 0xAB]
    }

    fn expect_count(event: Event, count: i32) {
        match event {
            Event::Done(c) => assert_eq!(c.update_count, Some(count)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_cancel_does_not_leak_into_next_response() {
        let mock = Builder::new()
            .write(&query(1))
            .read(&reply(&done_bytes(DoneStatus::COUNT, 1), true))
            .write(&query(2))
            .read(&reply(&done_bytes(DoneStatus::COUNT, 2), true))
            .build();
        let mut conn = Connection::new(mock, 4096);
        let cancel = conn.cancel_handle();
        let mut session = session();
        let mut reader = TokenReader::new();

        conn.send_message(PacketType::Query, &[0xAB]).await.unwrap();
        reader.start();
        let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
        expect_count(event, 1);

        // The final Done has been folded: the cancel must not reach the wire.
        assert!(!cancel.cancel().await.unwrap());
        assert!(!cancel.is_pending());

        session.begin_request(OutputSlots::default());
        conn.send_message(PacketType::Query, &[0xAB]).await.unwrap();
        reader.start();
        let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
        expect_count(event, 2);
        assert!(session.is_end_of_response());
    }

    #[tokio::test]
    async fn test_cancel_before_final_done_reads_to_acknowledgement() {
        let mock = Builder::new()
            .write(&query(1))
            .write(&[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x02, 0x00])
            .read(&reply(&done_bytes(DoneStatus::COUNT, 1), true))
            .read(&reply(&done_bytes(DoneStatus::ATTN, 0), true))
            .build();
        let mut conn = Connection::new(mock, 4096);
        let cancel = conn.cancel_handle();
        let mut session = session();
        let mut reader = TokenReader::new();

        conn.send_message(PacketType::Query, &[0xAB]).await.unwrap();
        reader.start();
        assert!(cancel.cancel().await.unwrap());

        let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
        expect_count(event, 1);
        assert!(!session.is_end_of_response());

        match reader.next_event(&mut conn, &mut session, None).await.unwrap() {
            Event::Done(c) => assert!(c.cancelled),
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.is_end_of_response());
        assert!(!cancel.is_pending());
        assert!(!cancel.is_in_flight());
    }

    fn framed(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.put_u16_le(body.len() as u16);
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_legacy_params_fill_output_slots() {
        // PARAMFMT for two INTN(4) outputs, then their values.
        let mut formats = vec![0x02, 0x00];
        for name in ["@a", "@b"] {
            formats.push(name.len() as u8);
            formats.extend_from_slice(name.as_bytes());
            formats.extend_from_slice(&[0x20, 0, 0, 0, 0, 0x26, 0x04, 0x00]);
        }
        let mut payload = framed(0xEC, &formats);
        payload.extend_from_slice(&[0xD7, 0x04, 0x05, 0x00, 0x00, 0x00, 0x04, 0x06, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&done_bytes(DoneStatus::empty(), 0));

        let mock = Builder::new().read(&reply(&payload, true)).build();
        let mut conn = Connection::new(mock, 512);
        let mut session = SessionState::new(TdsVersion::V5_0, ServerType::Sybase, 512);
        session.begin_request(OutputSlots::from_params(&[
            ParamDescriptor::output("@a", TypeId::IntN),
            ParamDescriptor::output("@b", TypeId::IntN),
        ]));
        let mut reader = TokenReader::new();
        reader.start();

        for (index, value) in [(0, 5), (1, 6)] {
            let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
            assert_eq!(
                event,
                Event::OutputParam {
                    index,
                    value: SqlValue::Int(value)
                }
            );
        }
        assert!(matches!(
            reader.next_event(&mut conn, &mut session, None).await.unwrap(),
            Event::Done(_)
        ));
        assert_eq!(session.param_formats().len(), 2);
    }

    #[tokio::test]
    async fn test_legacy_column_names_and_formats() {
        let mut names = Vec::new();
        for name in ["id", "code"] {
            names.push(name.len() as u8);
            names.extend_from_slice(name.as_bytes());
        }
        let mut payload = framed(0xA0, &names);
        payload.extend_from_slice(&framed(
            0xA1,
            &[0, 0, 0, 0, 0x38, 0, 0, 0x01, 0x00, 0x27, 0x08],
        ));
        payload.extend_from_slice(&[0xD1, 0x07, 0x00, 0x00, 0x00, 0x02, b'x', b'y']);
        payload.extend_from_slice(&done_bytes(DoneStatus::COUNT, 1));

        let mock = Builder::new().read(&reply(&payload, true)).build();
        let mut conn = Connection::new(mock, 512);
        let mut session = SessionState::new(TdsVersion::V4_2, ServerType::SqlServer, 512);
        session.begin_request(OutputSlots::default());
        let mut reader = TokenReader::new();
        reader.start();

        let Event::ResultSet(columns) = reader.next_event(&mut conn, &mut session, None).await.unwrap()
        else {
            panic!("expected a result set");
        };
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[1].name, "code");
        assert!(columns[1].is_nullable());

        let event = reader.next_event(&mut conn, &mut session, None).await.unwrap();
        assert_eq!(
            event,
            Event::Row(vec![SqlValue::Int(7), SqlValue::String("xy".into())])
        );
        // The count of a SELECT is not an update count.
        assert!(matches!(
            reader.next_event(&mut conn, &mut session, None).await.unwrap(),
            Event::Done(Completion { update_count: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_token_is_fatal() {
        let mock = Builder::new().read(&reply(&[0x88, 0, 0], true)).build();
        let mut conn = Connection::new(mock, 4096);
        let mut session = session();
        let mut reader = TokenReader::new();
        reader.start();

        let err = reader.next_event(&mut conn, &mut session, None).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.sqlstate(), "08S01");
        assert!(reader.is_closing());
        assert!(session.is_fatal());
    }

    #[tokio::test]
    async fn test_message_ends_mid_token() {
        let done = done_bytes(DoneStatus::empty(), 0);
        let mock = Builder::new().read(&reply(&done[..5], true)).build();
        let mut conn = Connection::new(mock, 4096);
        let mut session = session();
        let mut reader = TokenReader::new();
        reader.start();

        let err = reader.next_event(&mut conn, &mut session, None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_packet_size_change_applies_to_connection() {
        // EnvChange packet size 8192 (old 4096), then Done.
        let mut payload = vec![0xE3];
        let mut body = vec![4u8, 4];
        for c in "8192".encode_utf16() {
            body.extend_from_slice(&c.to_le_bytes());
        }
        body.push(4);
        for c in "4096".encode_utf16() {
            body.extend_from_slice(&c.to_le_bytes());
        }
        payload.extend_from_slice(&(body.len() as u16).to_le_bytes());
        payload.extend_from_slice(&body);
        payload.extend_from_slice(&done_bytes(DoneStatus::empty(), 0));

        let mock = Builder::new().read(&reply(&payload, true)).build();
        let mut conn = Connection::new(mock, 4096);
        let mut session = session();
        let mut reader = TokenReader::new();
        reader.start();

        reader.next_event(&mut conn, &mut session, None).await.unwrap();
        assert_eq!(session.packet_size(), 8192);
        assert_eq!(conn.outbound_capacity(), 8192);
    }

    #[tokio::test]
    async fn test_connection_closed_mid_response() {
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock, 4096);
        let mut session = session();
        let mut reader = TokenReader::new();
        reader.start();

        let err = reader.next_event(&mut conn, &mut session, None).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(session.is_fatal());
    }
}
