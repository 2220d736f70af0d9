//! WebSocket frame encoding and streaming decode
//!
//! Implements the RFC 6455 frame layout: 2-byte base header, minimally-sized
//! extended length (0/2/8 bytes, big-endian), optional 4-byte mask key, and
//! the payload. The decoder is streaming: fed a partial buffer it reports the
//! minimum number of additional bytes it needs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{INLINE_LEN_MAX, U16_LEN_MAX};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control opcode
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data opcode
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// Bit for RSV1 in the packed reserved-bit mask
pub const RSV1: u8 = 0b100;
/// Bit for RSV2 in the packed reserved-bit mask
pub const RSV2: u8 = 0b010;
/// Bit for RSV3 in the packed reserved-bit mask
pub const RSV3: u8 = 0b001;

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (claimed by extensions)
    pub rsv1: bool,
    /// RSV2 (reserved)
    pub rsv2: bool,
    /// RSV3 (reserved)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length
    pub payload_len: u64,
    /// Masking key; `Some` exactly when the frame is masked
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Reserved bits packed as `RSV1 | RSV2 | RSV3`
    #[inline]
    pub fn rsv_bits(&self) -> u8 {
        (u8::from(self.rsv1) << 2) | (u8::from(self.rsv2) << 1) | u8::from(self.rsv3)
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data, true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Create a close frame with a status code and reason.
    ///
    /// Synthetic codes (1005/1006/1015) are serialized as an empty payload;
    /// they must never appear on the wire. The reason is truncated at a char
    /// boundary so the control payload stays within 125 bytes.
    pub fn close(code: u16, reason: &str) -> Self {
        let close_code = crate::error::CloseCode::from(code);
        if close_code.is_synthetic() {
            return Self::new(OpCode::Close, Bytes::new(), true);
        }

        let mut cut = reason.len().min(INLINE_LEN_MAX - 2);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..cut]);
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Mask this frame with the given key.
    ///
    /// Only the header is updated; the payload stays unmasked in memory and
    /// is XORed during encoding.
    #[inline]
    pub fn set_mask(&mut self, key: [u8; 4]) {
        self.header.mask = Some(key);
    }
}

/// Outcome of a streaming decode attempt
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete frame was decoded; `consumed` bytes of input were used
    Complete {
        /// The decoded frame, payload unmasked
        frame: Frame,
        /// Number of input bytes the frame occupied
        consumed: usize,
    },
    /// The input ends mid-frame; at least this many further bytes are needed
    NeedMore(usize),
}

/// Exact number of bytes `encode` produces for a payload of `payload_len`
#[inline]
pub fn encoded_size(payload_len: usize, masked: bool) -> usize {
    let extended = if payload_len > U16_LEN_MAX {
        8
    } else if payload_len > INLINE_LEN_MAX {
        2
    } else {
        0
    };

    2 + extended + if masked { 4 } else { 0 } + payload_len
}

fn validate_for_encode(frame: &Frame, allowed_rsv: u8) -> Result<()> {
    if frame.header.opcode.is_control() {
        if !frame.header.fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }
        if frame.payload.len() > INLINE_LEN_MAX {
            return Err(Error::Protocol("control frame too large"));
        }
    }

    if frame.header.rsv_bits() & !allowed_rsv != 0 {
        return Err(Error::Protocol("reserved bit set without negotiated extension"));
    }

    if frame.payload.len() as u64 >> 63 != 0 {
        return Err(Error::Protocol("payload length MSB must be 0"));
    }

    Ok(())
}

/// Encode a frame into a freshly allocated buffer
pub fn encode(frame: &Frame, allowed_rsv: u8) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(encoded_size(frame.payload.len(), frame.header.mask.is_some()));
    encode_into(frame, &mut buf, allowed_rsv)?;
    Ok(buf.freeze())
}

/// Encode a frame into a caller-provided buffer, returning the written slice.
///
/// The buffer is appended to, not cleared; together with `encoded_size` this
/// is the zero-allocation send path.
pub fn encode_into<'a>(frame: &Frame, buf: &'a mut BytesMut, allowed_rsv: u8) -> Result<&'a [u8]> {
    validate_for_encode(frame, allowed_rsv)?;

    let payload_len = frame.payload.len();
    let start = buf.len();
    buf.reserve(encoded_size(payload_len, frame.header.mask.is_some()));

    let mut b0 = frame.header.opcode as u8;
    if frame.header.fin {
        b0 |= 0x80;
    }
    if frame.header.rsv1 {
        b0 |= 0x40;
    }
    if frame.header.rsv2 {
        b0 |= 0x20;
    }
    if frame.header.rsv3 {
        b0 |= 0x10;
    }
    buf.put_u8(b0);

    let mask_bit = if frame.header.mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= INLINE_LEN_MAX {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= U16_LEN_MAX {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(key) = frame.header.mask {
        buf.put_slice(&key);
        let payload_start = buf.len();
        buf.put_slice(&frame.payload);
        apply_mask(&mut buf[payload_start..], key);
    } else {
        buf.put_slice(&frame.payload);
    }

    Ok(&buf[start..])
}

enum HeaderStatus {
    Parsed(FrameHeader, usize),
    Partial(usize),
}

fn parse_header(src: &[u8], require_masked: bool, allowed_rsv: u8) -> Result<HeaderStatus> {
    if src.len() < 2 {
        return Ok(HeaderStatus::Partial(2 - src.len()));
    }

    let b0 = src[0];
    let b1 = src[1];

    let fin = b0 & 0x80 != 0;
    let rsv = (b0 >> 4) & 0x07;
    if rsv & !allowed_rsv != 0 {
        trace!("rejecting frame with reserved bits {:03b}", rsv);
        return Err(Error::Protocol("reserved bit set without negotiated extension"));
    }

    let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("invalid opcode"))?;
    if opcode.is_control() && !fin {
        return Err(Error::Protocol("control frame must not be fragmented"));
    }

    let masked = b1 & 0x80 != 0;
    if require_masked && !masked {
        return Err(Error::Protocol("client frames must be masked"));
    }
    if !require_masked && masked {
        return Err(Error::Protocol("server frames must not be masked"));
    }

    let len_code = b1 & 0x7F;
    let (extended, base) = match len_code {
        126 => (2usize, 4usize),
        127 => (8, 10),
        _ => (0, 2),
    };
    let header_len = base + if masked { 4 } else { 0 };

    if src.len() < header_len {
        return Ok(HeaderStatus::Partial(header_len - src.len()));
    }

    let payload_len = match extended {
        0 => len_code as u64,
        2 => {
            let len = u16::from_be_bytes([src[2], src[3]]) as u64;
            if len <= INLINE_LEN_MAX as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            len
        }
        _ => {
            let len = u64::from_be_bytes([
                src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9],
            ]);
            if len <= U16_LEN_MAX as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            if len >> 63 != 0 {
                return Err(Error::Protocol("payload length MSB must be 0"));
            }
            len
        }
    };

    if opcode.is_control() && payload_len > INLINE_LEN_MAX as u64 {
        return Err(Error::Protocol("control frame too large"));
    }

    let mask = if masked {
        Some([src[base], src[base + 1], src[base + 2], src[base + 3]])
    } else {
        None
    };

    Ok(HeaderStatus::Parsed(
        FrameHeader {
            fin,
            rsv1: rsv & RSV1 != 0,
            rsv2: rsv & RSV2 != 0,
            rsv3: rsv & RSV3 != 0,
            opcode,
            payload_len,
            mask,
        },
        header_len,
    ))
}

/// Streaming decode from a byte slice.
///
/// Returns `NeedMore(n)` when the input ends mid-frame, with `n` derived from
/// the header seen so far (2 when nothing is known yet). On success the
/// payload is copied out and unmasked.
pub fn decode(src: &[u8], require_masked: bool, allowed_rsv: u8) -> Result<DecodeOutcome> {
    let (header, header_len) = match parse_header(src, require_masked, allowed_rsv)? {
        HeaderStatus::Partial(need) => return Ok(DecodeOutcome::NeedMore(need)),
        HeaderStatus::Parsed(header, header_len) => (header, header_len),
    };

    let payload_len =
        usize::try_from(header.payload_len).map_err(|_| Error::Protocol("frame too large for platform"))?;
    let total = header_len + payload_len;
    if src.len() < total {
        return Ok(DecodeOutcome::NeedMore(total - src.len()));
    }

    let mut payload = src[header_len..total].to_vec();
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    Ok(DecodeOutcome::Complete {
        frame: Frame {
            header,
            payload: Bytes::from(payload),
        },
        consumed: total,
    })
}

/// Streaming decode that unmasks inside the buffer.
///
/// On success the frame's bytes are consumed from `buf` and the payload is
/// split out without copying; the returned `Bytes` stays valid independently
/// of any further reuse of `buf`. This is the receive hot path.
pub fn decode_in_place(buf: &mut BytesMut, require_masked: bool, allowed_rsv: u8) -> Result<DecodeOutcome> {
    let (header, header_len) = match parse_header(buf, require_masked, allowed_rsv)? {
        HeaderStatus::Partial(need) => return Ok(DecodeOutcome::NeedMore(need)),
        HeaderStatus::Parsed(header, header_len) => (header, header_len),
    };

    let payload_len =
        usize::try_from(header.payload_len).map_err(|_| Error::Protocol("frame too large for platform"))?;
    let total = header_len + payload_len;
    if buf.len() < total {
        return Ok(DecodeOutcome::NeedMore(total - buf.len()));
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(payload_len);
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    Ok(DecodeOutcome::Complete {
        frame: Frame {
            header,
            payload: payload.freeze(),
        },
        consumed: total,
    })
}
