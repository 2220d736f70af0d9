//! Client-side orchestration: URL parsing and the upgrade over a stream
//!
//! Socket dialing stays outside the crate; callers establish the transport
//! themselves and hand it in as a [`WsStream`].

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake;
use crate::protocol::Role;
use crate::stream::WsStream;
use crate::Config;

/// A parsed `ws://` or `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// True for `wss`
    pub secure: bool,
    /// Host name or address
    pub host: String,
    /// Port, defaulted from the scheme when absent
    pub port: u16,
    /// Request path, `/` when absent
    pub path: String,
}

impl WsUrl {
    /// Parse `ws://host[:port]/path` or `wss://host[:port]/path`
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Client("missing url scheme".into()))?;

        let secure = match scheme {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(Error::Client(format!(
                    "unsupported scheme: {} (expected ws or wss)",
                    other
                )))
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        if authority.is_empty() {
            return Err(Error::Client("missing host".into()));
        }

        let (host, port) = match authority.rfind(':') {
            Some(i) => {
                let port = authority[i + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::Client(format!("invalid port in {}", authority)))?;
                (&authority[..i], port)
            }
            None => (authority, if secure { 443 } else { 80 }),
        };

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// The scheme's default port (80 for `ws`, 443 for `wss`)
    pub fn default_port(&self) -> u16 {
        if self.secure {
            443
        } else {
            80
        }
    }

    /// Canonical `Host` header value; the port is elided when it equals the
    /// scheme default
    pub fn host_header(&self) -> String {
        if self.port == self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Perform the client handshake over an established stream.
///
/// Sends the upgrade request, validates the response (status, accept key,
/// subprotocol membership), and returns a client-mode connection with the
/// negotiated subprotocol recorded. Bytes the server sent past the end of the
/// HTTP response are preserved for the first frame reads.
pub async fn connect_on<S: WsStream>(
    mut stream: S,
    url: &WsUrl,
    mut config: Config,
    extra_headers: &[(String, String)],
) -> Result<Connection<S>> {
    config.mode = Role::Client;

    let key = handshake::generate_key();
    let request = handshake::build_upgrade_request(
        &url.host_header(),
        &url.path,
        &key,
        &config.subprotocols,
        extra_headers,
    );

    stream.write(&request).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let (response, consumed) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Client("connection closed during handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(done) = handshake::validate_upgrade_response(&buf, &key, &config.subprotocols)? {
            break done;
        }
    };

    debug!(
        "connected to {}{} (subprotocol {:?})",
        url.host_header(),
        url.path,
        response.protocol
    );

    let leftover = Bytes::copy_from_slice(&buf[consumed..]);
    let mut conn = Connection::new(stream, config);
    conn.set_subprotocol(response.protocol);
    if !leftover.is_empty() {
        conn.set_preread(leftover);
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::stream::TokioStream;

    #[test]
    fn parse_plain_url() {
        let url = WsUrl::parse("ws://example.com/chat").unwrap();
        assert!(!url.secure);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/chat");
        assert_eq!(url.host_header(), "example.com");
    }

    #[test]
    fn parse_secure_url_with_port() {
        let url = WsUrl::parse("wss://example.com:9443/api/ws").unwrap();
        assert!(url.secure);
        assert_eq!(url.port, 9443);
        assert_eq!(url.path, "/api/ws");
        assert_eq!(url.host_header(), "example.com:9443");
    }

    #[test]
    fn parse_defaults_path_and_ports() {
        let url = WsUrl::parse("ws://example.com").unwrap();
        assert_eq!(url.path, "/");
        assert_eq!(url.port, 80);

        let url = WsUrl::parse("wss://example.com").unwrap();
        assert_eq!(url.port, 443);
    }

    #[test]
    fn host_header_elides_default_port_only() {
        let url = WsUrl::parse("ws://example.com:80/x").unwrap();
        assert_eq!(url.host_header(), "example.com");

        let url = WsUrl::parse("wss://example.com:443/x").unwrap();
        assert_eq!(url.host_header(), "example.com");

        let url = WsUrl::parse("ws://example.com:443/x").unwrap();
        assert_eq!(url.host_header(), "example.com:443");
    }

    #[test]
    fn parse_rejects_bad_urls() {
        assert!(matches!(WsUrl::parse("http://example.com"), Err(Error::Client(_))));
        assert!(matches!(WsUrl::parse("example.com"), Err(Error::Client(_))));
        assert!(matches!(WsUrl::parse("ws:///path"), Err(Error::Client(_))));
        assert!(matches!(WsUrl::parse("ws://host:port/x"), Err(Error::Client(_))));
    }

    /// Serve one scripted upgrade on the far end of a duplex pipe
    async fn answer_upgrade(mut server: tokio::io::DuplexStream, protocol: Option<&str>, trailing: &[u8]) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let request = loop {
            let n = server.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some((request, _)) = handshake::parse_upgrade_request(&buf).unwrap() {
                break request;
            }
        };

        let accept = handshake::accept_key(&request.key);
        let response = handshake::build_accept_response(&accept, protocol, None);
        server.write_all(&response).await.unwrap();
        server.write_all(trailing).await.unwrap();

        // Echo the peer's close so its drain loop finishes promptly
        let _ = server.read(&mut chunk).await;
        let _ = server.write_all(&[0x88, 0x00]).await;
    }

    #[tokio::test]
    async fn connect_negotiates_subprotocol() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(answer_upgrade(server_io, Some("chat"), &[]));

        let url = WsUrl::parse("ws://example.com/ws").unwrap();
        let config = Config::builder()
            .mode(Role::Client)
            .subprotocols(vec!["chat".to_string()])
            .close_timeout(std::time::Duration::from_millis(200))
            .build();

        let mut conn = connect_on(TokioStream::new(client_io), &url, config, &[])
            .await
            .unwrap();
        assert_eq!(conn.subprotocol(), Some("chat"));
        assert!(conn.is_open());

        conn.close(1000, "").await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_preserves_leftover_frame_bytes() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        // An unmasked server Text frame rides along with the 101 response
        let early = [0x81, 0x05, b'e', b'a', b'r', b'l', b'y'];
        let server = tokio::spawn(async move {
            answer_upgrade(server_io, None, &early).await;
        });

        let url = WsUrl::parse("ws://example.com/ws").unwrap();
        let config = Config::builder()
            .mode(Role::Client)
            .close_timeout(std::time::Duration::from_millis(200))
            .build();

        let mut conn = connect_on(TokioStream::new(client_io), &url, config, &[])
            .await
            .unwrap();

        let msg = conn.receive().await.unwrap();
        assert_eq!(msg, crate::protocol::Message::text("early"));

        conn.close(1000, "").await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_rejects_bad_accept() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = server_io.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if handshake::parse_upgrade_request(&buf).unwrap().is_some() {
                    break;
                }
            }
            let response =
                handshake::build_accept_response("AAAAAAAAAAAAAAAAAAAAAAAAAAA=", None, None);
            server_io.write_all(&response).await.unwrap();
        });

        let url = WsUrl::parse("ws://example.com/ws").unwrap();
        let err = connect_on(TokioStream::new(client_io), &url, Config::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        server.await.unwrap();
    }
}
