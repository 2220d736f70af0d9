//! Error types and the RFC 6455 close-code taxonomy

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying stream
    Io(io::Error),
    /// Protocol violation detected locally (wire format or invariant)
    Protocol(&'static str),
    /// Invalid UTF-8 in a text payload
    InvalidUtf8,
    /// A single frame exceeded the configured maximum
    FrameTooLarge,
    /// An assembled message exceeded the configured maximum
    MessageTooLarge,
    /// Upgrade request/response validation failed
    Handshake(String),
    /// URL parsing or client orchestration failed
    Client(String),
    /// A negotiated extension refused or mangled a frame
    Extension(String),
    /// The connection is no longer usable
    Closed(CloseReason),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            Error::Client(msg) => write!(f, "Client error: {}", msg),
            Error::Extension(msg) => write!(f, "Extension error: {}", msg),
            Error::Closed(reason) => {
                if reason.reason.is_empty() {
                    write!(f, "Connection closed: {}", u16::from(reason.code))
                } else {
                    write!(
                        f,
                        "Connection closed: {} ({})",
                        u16::from(reason.code),
                        reason.reason
                    )
                }
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Close status code per RFC 6455 section 7.4
///
/// The taxonomy is closed: registered codes get a named variant, the
/// reserved/IANA/private ranges carry the raw value. Conversion to and from
/// `u16` is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, normal closure
    Normal,
    /// 1001, endpoint going away
    Away,
    /// 1002, protocol error
    Protocol,
    /// 1003, unsupported data type
    Unsupported,
    /// 1005, no status present (synthetic, never on the wire)
    Status,
    /// 1006, abnormal closure (synthetic, never on the wire)
    Abnormal,
    /// 1007, invalid frame payload data
    Invalid,
    /// 1008, policy violation
    Policy,
    /// 1009, message too big
    Size,
    /// 1010, mandatory extension missing
    Extension,
    /// 1011, internal server error
    Error,
    /// 1012, service restart
    Restart,
    /// 1013, try again later
    Again,
    /// 1015, TLS handshake failure (synthetic, never on the wire)
    Tls,
    /// Other codes below 3000
    Reserved(u16),
    /// 3000-3999, registered with IANA
    Iana(u16),
    /// 4000-4999, private use
    Library(u16),
    /// Anything outside the registered close-code space
    Bad(u16),
}

impl CloseCode {
    /// True for the codes that must never appear on the wire (1005, 1006, 1015)
    #[inline]
    pub fn is_synthetic(self) -> bool {
        matches!(self, CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls)
    }

    /// Check whether a received close code is acceptable on the wire
    pub fn is_valid_wire_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(c) | CloseCode::Iana(c) | CloseCode::Library(c) | CloseCode::Bad(c) => c,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Close frame reason: status code plus optional human-readable text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: CloseCode,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Create a new close reason
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }
}
