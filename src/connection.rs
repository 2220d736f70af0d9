//! Connection state machine
//!
//! Sequences frames into messages, interleaves control-frame handling,
//! performs the close handshake, and enforces UTF-8 on text payloads. One
//! task drives a connection; send and receive are not safe to call
//! concurrently from different tasks.

use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};
use tokio::time::timeout;

use crate::error::{CloseCode, CloseReason, Error, Result};
use crate::extension::{claimed_rsv, Extension};
use crate::frame::{decode_in_place, encode_into, DecodeOutcome, Frame, OpCode};
use crate::mask::generate_mask;
use crate::protocol::{Message, Role};
use crate::stream::WsStream;
use crate::utf8::validate_utf8;
use crate::{Config, INLINE_LEN_MAX};

/// Frame budget for the close-handshake drain loop
const CLOSE_WAIT_FRAMES: usize = 100;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Normal operation
    Open,
    /// We sent Close, awaiting the peer's Close
    ClosingLocal,
    /// Peer sent Close, we echo and terminate
    ClosingRemote,
    /// Terminal
    Closed,
}

/// A WebSocket connection over a [`WsStream`]
///
/// Exclusively owns its stream, fragment buffer, and encode/decode scratch
/// buffers. Messages returned from [`receive`](Connection::receive) are
/// independent of any buffer the connection continues to reuse.
pub struct Connection<S> {
    stream: S,
    config: Config,
    state: ConnectionState,
    /// Bytes that arrived with the handshake, consumed before stream reads
    preread: BytesMut,
    /// Reassembly buffer for the in-progress fragmented message
    fragment_buf: BytesMut,
    fragment_opcode: Option<OpCode>,
    /// Reusable frame decode scratch
    read_buf: BytesMut,
    /// Reusable frame encode scratch
    write_buf: BytesMut,
    extensions: Vec<Box<dyn Extension>>,
    awaiting_pong: bool,
    last_pong: Option<Instant>,
    subprotocol: Option<String>,
    close_sent: bool,
    closed_reason: Option<CloseReason>,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("closed_reason", &self.closed_reason)
            .finish_non_exhaustive()
    }
}

impl<S: WsStream> Connection<S> {
    /// Wrap an already-upgraded stream
    pub fn new(stream: S, config: Config) -> Self {
        Self {
            stream,
            config,
            state: ConnectionState::Open,
            preread: BytesMut::new(),
            fragment_buf: BytesMut::new(),
            fragment_opcode: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            extensions: Vec::new(),
            awaiting_pong: false,
            last_pong: None,
            subprotocol: None,
            close_sent: false,
            closed_reason: None,
        }
    }

    /// Record the subprotocol negotiated during the handshake
    pub fn set_subprotocol(&mut self, protocol: Option<String>) {
        self.subprotocol = protocol;
    }

    /// Seed bytes that were read past the end of the HTTP exchange
    pub fn set_preread(&mut self, leftover: impl Into<Bytes>) {
        self.preread.extend_from_slice(&leftover.into());
    }

    /// Append a negotiated extension transform to the chain
    pub fn add_extension(&mut self, extension: Box<dyn Extension>) {
        self.extensions.push(extension);
    }

    /// The negotiated subprotocol, when any
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether normal sends are still possible
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Whether a ping is outstanding
    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// When the most recent pong arrived
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Whether the underlying stream is still usable
    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    /// Connection configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the connection and return the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn allowed_rsv(&self) -> u8 {
        claimed_rsv(&self.extensions)
    }

    fn require_masked(&self) -> bool {
        self.config.mode == Role::Server
    }

    fn terminal_reason(&self) -> CloseReason {
        self.closed_reason
            .clone()
            .unwrap_or_else(|| CloseReason::new(CloseCode::Abnormal, ""))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(Error::Closed(
                self.closed_reason
                    .clone()
                    .unwrap_or_else(|| CloseReason::new(CloseCode::Normal, "")),
            ))
        }
    }

    /// Send a text message as a single frame
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_data(Frame::text(Bytes::copy_from_slice(text.as_bytes())))
            .await
    }

    /// Send a binary message as a single frame
    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send_data(Frame::binary(data.into())).await
    }

    /// Send a ping and start awaiting the pong
    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > INLINE_LEN_MAX {
            return Err(Error::Protocol("control frame too large"));
        }
        self.ensure_open()?;
        self.dispatch_write(Frame::ping(payload)).await?;
        self.awaiting_pong = true;
        Ok(())
    }

    /// Send a pong
    pub async fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > INLINE_LEN_MAX {
            return Err(Error::Protocol("control frame too large"));
        }
        self.ensure_open()?;
        self.dispatch_write(Frame::pong(payload)).await
    }

    /// Send a data frame through the extension chain
    pub(crate) async fn send_data(&mut self, mut frame: Frame) -> Result<()> {
        self.ensure_open()?;
        for ext in self.extensions.iter_mut() {
            ext.on_outgoing(&mut frame)?;
        }
        self.dispatch_write(frame).await
    }

    async fn dispatch_write(&mut self, frame: Frame) -> Result<()> {
        match self.write_frame_raw(frame).await {
            Ok(()) => Ok(()),
            Err(Error::Io(e)) => {
                debug!("write failed, marking connection closed: {}", e);
                self.state = ConnectionState::Closed;
                let reason = CloseReason::new(CloseCode::Abnormal, "");
                self.closed_reason = Some(reason.clone());
                Err(Error::Closed(reason))
            }
            Err(other) => Err(other),
        }
    }

    async fn write_frame_raw(&mut self, mut frame: Frame) -> Result<()> {
        if self.config.mode == Role::Client {
            frame.set_mask(generate_mask());
        }
        self.write_buf.clear();
        let allowed_rsv = self.allowed_rsv();
        encode_into(&frame, &mut self.write_buf, allowed_rsv)?;
        trace!(
            "sending {:?} frame, {} payload bytes",
            frame.header.opcode,
            frame.payload.len()
        );
        self.stream.write(&self.write_buf).await?;
        self.stream.flush().await
    }

    /// Receive the next data message.
    ///
    /// Control frames are handled inline: pings are auto-answered (unless
    /// configured off), pongs update the heartbeat state, and a Close frame
    /// completes the close handshake and surfaces as `Error::Closed` with the
    /// peer's code and reason. Stream death surfaces as `Error::Closed` with
    /// the synthetic 1006 code.
    pub async fn receive(&mut self) -> Result<Message> {
        loop {
            if self.state == ConnectionState::Closed {
                return Err(Error::Closed(self.terminal_reason()));
            }

            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(err).await),
            };

            match frame.header.opcode {
                OpCode::Ping => {
                    if self.config.auto_reply_ping {
                        trace!("auto-replying to ping, {} bytes", frame.payload.len());
                        if let Err(err) = self.write_frame_raw(Frame::pong(frame.payload)).await {
                            return Err(self.fail(err).await);
                        }
                    } else {
                        return Ok(Message::Ping(frame.payload));
                    }
                }
                OpCode::Pong => {
                    trace!("pong received");
                    self.awaiting_pong = false;
                    self.last_pong = Some(Instant::now());
                }
                OpCode::Close => return Err(self.on_close_frame(frame).await),
                _ => {
                    let mut frame = frame;
                    for ext in self.extensions.iter_mut().rev() {
                        if let Err(err) = ext.on_incoming(&mut frame) {
                            return Err(self.fail(err).await);
                        }
                    }
                    match self.on_data_frame(frame) {
                        Ok(Some(message)) => return Ok(message),
                        Ok(None) => {}
                        Err(err) => return Err(self.fail(err).await),
                    }
                }
            }
        }
    }

    /// Read one frame: exact header reads, then the payload, then the codec
    async fn read_frame(&mut self) -> Result<Frame> {
        let mut head = [0u8; 2];
        fill_from(&mut self.stream, &mut self.preread, &mut head).await?;

        let len_code = head[1] & 0x7F;
        let extended = match len_code {
            126 => 2usize,
            127 => 8,
            _ => 0,
        };
        let mask_len = if head[1] & 0x80 != 0 { 4 } else { 0 };

        self.read_buf.clear();
        self.read_buf.extend_from_slice(&head);

        if extended + mask_len > 0 {
            let mut rest = [0u8; 12];
            fill_from(
                &mut self.stream,
                &mut self.preread,
                &mut rest[..extended + mask_len],
            )
            .await?;
            self.read_buf.extend_from_slice(&rest[..extended + mask_len]);
        }

        let payload_len = match extended {
            0 => len_code as u64,
            2 => u16::from_be_bytes([self.read_buf[2], self.read_buf[3]]) as u64,
            _ => u64::from_be_bytes([
                self.read_buf[2],
                self.read_buf[3],
                self.read_buf[4],
                self.read_buf[5],
                self.read_buf[6],
                self.read_buf[7],
                self.read_buf[8],
                self.read_buf[9],
            ]),
        };

        if payload_len > self.config.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let header_len = 2 + extended + mask_len;
        let total = header_len + payload_len as usize;
        self.read_buf.resize(total, 0);
        fill_from(
            &mut self.stream,
            &mut self.preread,
            &mut self.read_buf[header_len..],
        )
        .await?;

        let require_masked = self.require_masked();
        let allowed_rsv = self.allowed_rsv();
        match decode_in_place(&mut self.read_buf, require_masked, allowed_rsv)? {
            DecodeOutcome::Complete { frame, .. } => Ok(frame),
            DecodeOutcome::NeedMore(_) => Err(Error::Protocol("truncated frame")),
        }
    }

    fn on_data_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        let in_fragment = self.fragment_opcode.is_some();

        match frame.header.opcode {
            OpCode::Text | OpCode::Binary => {
                if in_fragment {
                    return Err(Error::Protocol("unexpected new data frame mid-fragment"));
                }
                if frame.payload.len() > self.config.max_message_size {
                    return Err(Error::MessageTooLarge);
                }

                if frame.header.fin {
                    if frame.header.opcode == OpCode::Text && !validate_utf8(&frame.payload) {
                        return Err(Error::InvalidUtf8);
                    }
                    let message = match frame.header.opcode {
                        OpCode::Text => Message::Text(frame.payload),
                        _ => Message::Binary(frame.payload),
                    };
                    Ok(Some(message))
                } else {
                    self.fragment_opcode = Some(frame.header.opcode);
                    self.fragment_buf.clear();
                    self.fragment_buf.extend_from_slice(&frame.payload);
                    Ok(None)
                }
            }
            OpCode::Continuation => {
                let opcode = self
                    .fragment_opcode
                    .ok_or(Error::Protocol("unexpected continuation frame"))?;

                if self.fragment_buf.len() + frame.payload.len() > self.config.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                self.fragment_buf.extend_from_slice(&frame.payload);

                if frame.header.fin {
                    self.fragment_opcode = None;
                    let data = self.fragment_buf.split().freeze();
                    if opcode == OpCode::Text {
                        if !validate_utf8(&data) {
                            return Err(Error::InvalidUtf8);
                        }
                        Ok(Some(Message::Text(data)))
                    } else {
                        Ok(Some(Message::Binary(data)))
                    }
                } else {
                    Ok(None)
                }
            }
            _ => Err(Error::Protocol("control opcode on data path")),
        }
    }

    async fn on_close_frame(&mut self, frame: Frame) -> Error {
        let reason = match parse_close_payload(&frame.payload) {
            Ok(reason) => reason,
            Err(err) => return self.fail(err).await,
        };

        debug!("close frame from peer: {:?}", reason);
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::ClosingRemote;
        }

        if !self.close_sent {
            let echo = Frame::new(OpCode::Close, frame.payload.clone(), true);
            let _ = self.write_frame_raw(echo).await;
            self.close_sent = true;
        }

        let _ = self.stream.close().await;
        self.state = ConnectionState::Closed;

        let observed = reason.unwrap_or_else(|| CloseReason::new(CloseCode::Status, ""));
        self.closed_reason = Some(observed.clone());
        Error::Closed(observed)
    }

    /// Translate a receive-path failure, issuing the close the policy demands
    async fn fail(&mut self, err: Error) -> Error {
        match err {
            Error::Io(e) => {
                debug!("stream failure: {}", e);
                self.state = ConnectionState::Closed;
                let reason = CloseReason::new(CloseCode::Abnormal, "");
                self.closed_reason = Some(reason.clone());
                Error::Closed(reason)
            }
            Error::InvalidUtf8 => {
                warn!("invalid utf-8 in text message, closing with 1007");
                let reason = CloseReason::new(CloseCode::Invalid, "Invalid UTF-8");
                self.abort(&reason).await;
                Error::Closed(reason)
            }
            Error::MessageTooLarge => {
                warn!("message exceeded limit, closing with 1009");
                let reason = CloseReason::new(CloseCode::Size, "Message too big");
                self.abort(&reason).await;
                Error::Closed(reason)
            }
            Error::FrameTooLarge => {
                warn!("frame exceeded limit, closing with 1002");
                self.abort(&CloseReason::new(CloseCode::Protocol, "Frame too big"))
                    .await;
                Error::FrameTooLarge
            }
            Error::Protocol(msg) => {
                warn!("protocol error, closing with 1002: {}", msg);
                self.abort(&CloseReason::new(CloseCode::Protocol, "")).await;
                Error::Protocol(msg)
            }
            Error::Extension(msg) => {
                warn!("extension failure, closing with 1002: {}", msg);
                self.abort(&CloseReason::new(CloseCode::Protocol, "")).await;
                Error::Extension(msg)
            }
            other => other,
        }
    }

    /// Best-effort close used on receive-path failures
    async fn abort(&mut self, reason: &CloseReason) {
        if !self.close_sent {
            let frame = Frame::close(u16::from(reason.code), &reason.reason);
            let _ = self.write_frame_raw(frame).await;
            self.close_sent = true;
        }
        let _ = self.stream.close().await;
        self.state = ConnectionState::Closed;
        self.closed_reason = Some(reason.clone());
    }

    /// Initiate (or complete) the close handshake. Idempotent; never fails.
    ///
    /// Sends exactly one Close frame, then only reads: incoming frames are
    /// drained until the peer's Close is observed or the budget (frame count
    /// or `close_timeout`) elapses. Errors are swallowed; the outcome is
    /// observable via [`connected`](Connection::connected).
    pub async fn close(&mut self, code: u16, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if !self.close_sent {
            let _ = self.write_frame_raw(Frame::close(code, reason)).await;
            self.close_sent = true;
            if self.state == ConnectionState::Open {
                self.state = ConnectionState::ClosingLocal;
            }
            debug!("close handshake started, code {}", code);
        }

        let deadline = Instant::now() + self.config.close_timeout;
        for _ in 0..CLOSE_WAIT_FRAMES {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.read_frame()).await {
                Err(_) => break,
                Ok(Err(_)) => break,
                Ok(Ok(frame)) => {
                    if frame.header.opcode == OpCode::Close {
                        if let Ok(observed) = parse_close_payload(&frame.payload) {
                            self.closed_reason = Some(
                                observed.unwrap_or_else(|| CloseReason::new(CloseCode::Status, "")),
                            );
                        }
                        break;
                    }
                }
            }
        }

        let _ = self.stream.close().await;
        self.state = ConnectionState::Closed;
        if self.closed_reason.is_none() {
            self.closed_reason = Some(CloseReason::new(code, reason));
        }
    }
}

/// Fill `dst` exactly, consuming handshake leftovers before the stream
async fn fill_from<S: WsStream>(
    stream: &mut S,
    preread: &mut BytesMut,
    dst: &mut [u8],
) -> Result<()> {
    let mut filled = 0;
    if !preread.is_empty() {
        let take = preread.len().min(dst.len());
        dst[..take].copy_from_slice(&preread[..take]);
        preread.advance(take);
        filled = take;
    }
    if filled < dst.len() {
        stream.read_exactly(&mut dst[filled..]).await?;
    }
    Ok(())
}

/// Parse a close-frame payload: empty, or a 2-byte code plus UTF-8 reason
fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("invalid close frame payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid_wire_code(code) {
                return Err(Error::Protocol("invalid close code"));
            }
            let text = &payload[2..];
            if !validate_utf8(text) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(CloseReason::new(
                code,
                String::from_utf8_lossy(text).into_owned(),
            )))
        }
    }
}
