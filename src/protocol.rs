//! Typed messages and endpoint roles

use bytes::Bytes;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (masks outgoing frames, rejects masked incoming)
    Client,
    /// Server (rejects unmasked incoming, sends unmasked)
    Server,
}

/// A complete WebSocket message, possibly reassembled from fragments
///
/// Text payloads are UTF-8 validated before a `Text` message is produced, so
/// `as_text` is infallible. Control traffic stays out of this enum: a peer
/// close surfaces from the connection as `Error::Closed`, and pongs only
/// update its heartbeat state. Pings appear here when auto-reply is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 validated on receive)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping (surfaced only when auto-reply is disabled)
    Ping(Bytes),
}

impl Message {
    /// Create a text message
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Check if this is a surfaced ping
    #[inline]
    pub fn is_ping(&self) -> bool {
        matches!(self, Message::Ping(_))
    }

    /// View a text message's payload as `&str`
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            // Payload was validated when the message was assembled
            Message::Text(b) => Some(unsafe { std::str::from_utf8_unchecked(b) }),
            _ => None,
        }
    }

    /// View the raw payload bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) => b,
        }
    }

    /// Consume the message, yielding its payload
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) => b,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_accessors() {
        let msg = Message::text("héllo");
        assert!(msg.is_text());
        assert_eq!(msg.as_text(), Some("héllo"));
        assert_eq!(msg.as_bytes(), "héllo".as_bytes());
    }

    #[test]
    fn binary_accessors() {
        let msg = Message::binary(vec![1u8, 2, 3]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_text(), None);
        assert_eq!(msg.into_bytes().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn ping_accessors() {
        let msg = Message::Ping(Bytes::from_static(&[0xDE, 0xAD]));
        assert!(msg.is_ping());
        assert_eq!(msg.as_text(), None);
        assert_eq!(msg.as_bytes(), &[0xDE, 0xAD]);
    }

    #[test]
    fn conversions() {
        assert!(Message::from("hi").is_text());
        assert!(Message::from(String::from("hi")).is_text());
        assert!(Message::from(vec![0u8]).is_binary());
        assert!(Message::from(Bytes::from_static(b"x")).is_binary());
    }
}
