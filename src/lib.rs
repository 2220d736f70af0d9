//! # wavesock: a transport-agnostic WebSocket protocol library
//!
//! Implements the RFC 6455 wire protocol over any already-connected byte
//! stream and exposes a bidirectional message channel:
//!
//! - **Framing codec**: bit-exact encode/decode with masking, minimal
//!   length-field selection, and streaming decode
//! - **Connection state machine**: fragment reassembly, interleaved control
//!   frames, the close handshake, and strict UTF-8 on text payloads
//! - **Opening handshake**: HTTP/1.1 upgrade validation, accept-key
//!   computation, subprotocol negotiation
//! - **Backpressure**: a priority send buffer with high/low water marks and
//!   slow-client handling
//!
//! Socket and TLS I/O stay outside the crate: anything implementing
//! [`WsStream`] (or wrapped in [`TokioStream`]) can carry a connection.
//!
//! ## Example
//!
//! ```ignore
//! use wavesock::{Config, Connection, Role, TokioStream};
//!
//! async fn serve(socket: tokio::net::TcpStream) -> wavesock::Result<()> {
//!     // ... perform the upgrade with wavesock::handshake ...
//!     let mut ws = Connection::new(TokioStream::new(socket), Config::default());
//!     loop {
//!         let msg = ws.receive().await?;
//!         ws.send_text(msg.as_text().unwrap_or_default()).await?;
//!     }
//! }
//! ```

pub mod backpressure;
pub mod client;
pub mod connection;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod stream;
pub mod utf8;

pub use backpressure::{
    BackpressureConfig, BackpressureStats, BufferedConnection, FlowState, MessageKind, Priority,
    QueueMode, SendBuffer, SlowClientPolicy,
};
pub use client::WsUrl;
pub use connection::{Connection, ConnectionState};
pub use error::{CloseCode, CloseReason, Error, Result};
pub use frame::{DecodeOutcome, Frame, FrameHeader, OpCode};
pub use protocol::{Message, Role};
pub use stream::{TokioStream, WsStream};

use std::time::Duration;

/// GUID appended to the client key when computing Sec-WebSocket-Accept
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload carried by the inline 7-bit length field
pub const INLINE_LEN_MAX: usize = 125;

/// Largest payload carried by the 16-bit extended length field
pub const U16_LEN_MAX: usize = 65535;

/// Maximum frame header size (2 base + 8 extended length + 4 mask key)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Configuration for a WebSocket connection
///
/// # Example
///
/// ```
/// use wavesock::{Config, Role};
///
/// let config = Config::builder()
///     .mode(Role::Server)
///     .max_frame_size(128 * 1024)
///     .auto_reply_ping(true)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest accepted single frame (default: 64 KiB)
    pub max_frame_size: usize,
    /// Largest accepted reassembled message (default: 16 MiB)
    pub max_message_size: usize,
    /// Answer pings automatically instead of surfacing them (default: true)
    pub auto_reply_ping: bool,
    /// Endpoint role; servers require masked input, clients mask output
    pub mode: Role,
    /// Subprotocols: offered list for a client, supported list for a server
    pub subprotocols: Vec<String>,
    /// Wall-clock bound on the close-handshake drain (default: 5 s)
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            auto_reply_ping: true,
            mode: Role::Server,
            subprotocols: Vec::new(),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Server-mode defaults
    pub fn server() -> Self {
        Self::default()
    }

    /// Client-mode defaults
    pub fn client() -> Self {
        Self {
            mode: Role::Client,
            ..Self::default()
        }
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the endpoint role
    pub fn mode(mut self, mode: Role) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the maximum single-frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the maximum reassembled-message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Enable or disable automatic pong replies
    pub fn auto_reply_ping(mut self, enabled: bool) -> Self {
        self.config.auto_reply_ping = enabled;
        self
    }

    /// Set the subprotocol list (ordered by preference)
    pub fn subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.config.subprotocols = subprotocols;
        self
    }

    /// Bound the close-handshake drain in wall-clock time
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backpressure::{BackpressureConfig, BufferedConnection, Priority};
    pub use crate::connection::Connection;
    pub use crate::error::{CloseCode, CloseReason, Error, Result};
    pub use crate::protocol::{Message, Role};
    pub use crate::stream::{TokioStream, WsStream};
    pub use crate::Config;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert!(config.auto_reply_ping);
        assert_eq!(config.mode, Role::Server);
        assert!(config.subprotocols.is_empty());
    }

    #[test]
    fn builder_overrides() {
        let config = Config::builder()
            .mode(Role::Client)
            .max_frame_size(1024)
            .max_message_size(2048)
            .auto_reply_ping(false)
            .subprotocols(vec!["chat".into()])
            .close_timeout(Duration::from_secs(1))
            .build();

        assert_eq!(config.mode, Role::Client);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.max_message_size, 2048);
        assert!(!config.auto_reply_ping);
        assert_eq!(config.subprotocols, vec!["chat".to_string()]);
        assert_eq!(config.close_timeout, Duration::from_secs(1));
    }

    #[test]
    fn mode_shorthands() {
        assert_eq!(Config::server().mode, Role::Server);
        assert_eq!(Config::client().mode, Role::Client);
    }
}
