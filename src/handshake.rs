//! HTTP/1.1 opening handshake
//!
//! Pure functions over the HTTP byte strings exchanged during the upgrade.
//! Parsing uses `httparse`; the accept key is Base64(SHA-1(key || GUID)).

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Maximum accepted size for the HTTP request/response head
const MAX_HEADER_SIZE: usize = 8192;

/// The only supported protocol version
pub const WS_VERSION: &str = "13";

/// A validated WebSocket upgrade request (server side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path
    pub path: String,
    /// Host header value
    pub host: String,
    /// Sec-WebSocket-Key, as sent (never normalized)
    pub key: String,
    /// Subprotocols offered by the client, in order
    pub subprotocols: Vec<String>,
    /// Extensions offered by the client, in order
    pub extensions: Vec<String>,
    /// Origin header, when present
    pub origin: Option<String>,
}

/// A validated WebSocket upgrade response (client side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    /// Subprotocol selected by the server, when any
    pub protocol: Option<String>,
    /// Extensions accepted by the server
    pub extensions: Vec<String>,
}

/// Compute the Sec-WebSocket-Accept value for a client key.
///
/// The key is hashed exactly as received; RFC 6455 forbids normalizing it.
#[inline]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a Sec-WebSocket-Key: 16 random bytes, base64-encoded
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn connection_has_upgrade(value: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Parse and validate a WebSocket upgrade request.
///
/// Returns `Ok(None)` while the request head is still incomplete, and the
/// parsed request plus the number of bytes it occupied once the terminating
/// CRLF CRLF has arrived. Validation failures carry the offending condition.
pub fn parse_upgrade_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::Handshake("request too large".into()));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::Handshake("malformed http request".into())),
    };

    if req.method != Some("GET") {
        return Err(Error::Handshake("method not allowed".into()));
    }

    let mut host = None;
    let mut key = None;
    let mut version = None;
    let mut protocols = Vec::new();
    let mut extensions = Vec::new();
    let mut origin = None;
    let mut upgrade_ok = false;
    let mut connection_ok = false;

    for header in req.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake("invalid header value".into()))?;

        match name.as_str() {
            "host" => host = Some(value.trim().to_string()),
            "sec-websocket-key" => key = Some(value.trim().to_string()),
            "sec-websocket-version" => version = Some(value.trim().to_string()),
            "sec-websocket-protocol" => protocols.extend(split_list(value)),
            "sec-websocket-extensions" => extensions.extend(split_list(value)),
            "origin" => origin = Some(value.trim().to_string()),
            "upgrade" => upgrade_ok = value.trim().eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = connection_has_upgrade(value),
            _ => {}
        }
    }

    let host = host.ok_or_else(|| Error::Handshake("missing host header".into()))?;
    if !upgrade_ok {
        return Err(Error::Handshake("bad upgrade header".into()));
    }
    if !connection_ok {
        return Err(Error::Handshake("bad connection header".into()));
    }

    let key = key.ok_or_else(|| Error::Handshake("bad websocket key".into()))?;
    // Sanity range for a base64-encoded 16-byte nonce
    if key.len() < 20 || key.len() > 30 {
        return Err(Error::Handshake("bad websocket key".into()));
    }

    match version.as_deref() {
        Some(WS_VERSION) => {}
        _ => return Err(Error::Handshake("unsupported websocket version".into())),
    }

    let path = req.path.unwrap_or("/").to_string();
    debug!("upgrade request for {} from host {}", path, host);

    Ok(Some((
        UpgradeRequest {
            path,
            host,
            key,
            subprotocols: protocols,
            extensions,
            origin,
        },
        len,
    )))
}

/// Build the 101 Switching Protocols response
pub fn build_accept_response(
    accept: &str,
    protocol: Option<&str>,
    extensions: Option<&str>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a 400 Bad Request rejection carrying the failure reason as its body
pub fn build_reject_response(reason: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + reason.len());

    buf.put_slice(b"HTTP/1.1 400 Bad Request\r\n");
    buf.put_slice(b"Content-Type: text/plain\r\n");
    buf.put_slice(b"Content-Length: ");
    buf.put_slice(reason.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"\r\n");
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

/// Pick a subprotocol in server preference order: the first entry of
/// `supported` that the client also offered.
pub fn select_subprotocol(supported: &[String], offered: &[String]) -> Option<String> {
    supported
        .iter()
        .find(|s| offered.iter().any(|o| o == *s))
        .cloned()
}

/// Build a WebSocket upgrade request (client side)
pub fn build_upgrade_request(
    host: &str,
    path: &str,
    key: &str,
    protocols: &[String],
    extra_headers: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if !protocols.is_empty() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocols.join(", ").as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (name, value) in extra_headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parse and validate the server's upgrade response (client side).
///
/// Returns `Ok(None)` while the response head is incomplete. Checks the
/// status line, the upgrade and connection headers, that the accept value
/// matches `sent_key`, and that any selected protocol was actually offered.
pub fn validate_upgrade_response(
    buf: &[u8],
    sent_key: &str,
    offered: &[String],
) -> Result<Option<(UpgradeResponse, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::Handshake("response too large".into()));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::Handshake("malformed http response".into())),
    };

    if res.code != Some(101) {
        return Err(Error::Handshake(format!(
            "expected 101 Switching Protocols, got {}",
            res.code.unwrap_or(0)
        )));
    }

    let mut accept = None;
    let mut protocol = None;
    let mut extensions = Vec::new();
    let mut upgrade_ok = false;
    let mut connection_ok = false;

    for header in res.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake("invalid header value".into()))?;

        match name.as_str() {
            "sec-websocket-accept" => accept = Some(value.trim().to_string()),
            "sec-websocket-protocol" => protocol = Some(value.trim().to_string()),
            "sec-websocket-extensions" => extensions.extend(split_list(value)),
            "upgrade" => upgrade_ok = value.trim().eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = connection_has_upgrade(value),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err(Error::Handshake("bad upgrade header".into()));
    }
    if !connection_ok {
        return Err(Error::Handshake("bad connection header".into()));
    }

    let accept = accept.ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Accept".into()))?;
    if accept != accept_key(sent_key) {
        return Err(Error::Handshake("incorrect Sec-WebSocket-Accept".into()));
    }

    if let Some(ref proto) = protocol {
        if !offered.iter().any(|o| o == proto) {
            return Err(Error::Handshake("server selected an unoffered subprotocol".into()));
        }
    }

    debug!("upgrade accepted, protocol {:?}", protocol);

    Ok(Some((UpgradeResponse { protocol, extensions }, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn sample_request() -> Vec<u8> {
        b"GET /chat HTTP/1.1\r\n\
          Host: example.com\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          \r\n"
            .to_vec()
    }

    #[test]
    fn accept_key_rfc_vector() {
        assert_eq!(accept_key(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn generated_keys_are_distinct_base64() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&a)
                .unwrap()
                .len(),
            16
        );
    }

    #[test]
    fn parse_valid_request() {
        let raw = sample_request();
        let (req, len) = parse_upgrade_request(&raw).unwrap().unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.key, SAMPLE_KEY);
        assert!(req.subprotocols.is_empty());
        assert_eq!(len, raw.len());
    }

    #[test]
    fn parse_partial_request() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: example.com\r\n";
        assert!(parse_upgrade_request(raw).unwrap().is_none());
    }

    #[test]
    fn parse_offered_lists() {
        let raw = b"GET / HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: WebSocket\r\n\
            Connection: keep-alive, Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Protocol: chat, superchat\r\n\
            Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits, foo\r\n\
            \r\n";

        let (req, _) = parse_upgrade_request(raw).unwrap().unwrap();
        assert_eq!(req.subprotocols, vec!["chat", "superchat"]);
        assert_eq!(
            req.extensions,
            vec!["permessage-deflate; client_max_window_bits", "foo"]
        );
    }

    fn expect_reason(raw: &[u8], reason: &str) {
        match parse_upgrade_request(raw) {
            Err(Error::Handshake(msg)) => assert_eq!(msg, reason),
            other => panic!("expected handshake failure {:?}, got {:?}", reason, other),
        }
    }

    #[test]
    fn reject_bad_method() {
        let raw = sample_request();
        let raw = [&b"POST"[..], &raw[3..]].concat();
        expect_reason(&raw, "method not allowed");
    }

    #[test]
    fn reject_missing_host() {
        let raw = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        expect_reason(raw, "missing host header");
    }

    #[test]
    fn reject_bad_upgrade() {
        let raw = String::from_utf8(sample_request())
            .unwrap()
            .replace("Upgrade: websocket", "Upgrade: h2c");
        expect_reason(raw.as_bytes(), "bad upgrade header");
    }

    #[test]
    fn reject_bad_connection() {
        let raw = String::from_utf8(sample_request())
            .unwrap()
            .replace("Connection: Upgrade", "Connection: keep-alive");
        expect_reason(raw.as_bytes(), "bad connection header");
    }

    #[test]
    fn reject_bad_key() {
        let raw = String::from_utf8(sample_request())
            .unwrap()
            .replace(SAMPLE_KEY, "short");
        expect_reason(raw.as_bytes(), "bad websocket key");
    }

    #[test]
    fn reject_bad_version() {
        let raw = String::from_utf8(sample_request())
            .unwrap()
            .replace("Version: 13", "Version: 8");
        expect_reason(raw.as_bytes(), "unsupported websocket version");
    }

    #[test]
    fn accept_response_layout() {
        let response = build_accept_response(SAMPLE_ACCEPT, Some("chat"), None);
        let text = std::str::from_utf8(&response).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn reject_response_content_length() {
        let response = build_reject_response("bad upgrade header");
        let text = std::str::from_utf8(&response).unwrap();

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body, "bad upgrade header");
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
    }

    #[test]
    fn subprotocol_server_preference_order() {
        let supported = vec!["graphql-ws".to_string(), "chat".to_string()];
        let offered = vec!["chat".to_string(), "graphql-ws".to_string()];
        // Server order wins, not client order
        assert_eq!(
            select_subprotocol(&supported, &offered),
            Some("graphql-ws".to_string())
        );
        assert_eq!(select_subprotocol(&supported, &[]), None);
        assert_eq!(
            select_subprotocol(&supported, &["other".to_string()]),
            None
        );
    }

    #[test]
    fn client_request_layout() {
        let request = build_upgrade_request(
            "example.com",
            "/ws",
            SAMPLE_KEY,
            &["chat".to_string()],
            &[("Authorization".to_string(), "Bearer t".to_string())],
        );
        let text = std::str::from_utf8(&request).unwrap();

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("Authorization: Bearer t\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn validate_good_response() {
        let raw = build_accept_response(SAMPLE_ACCEPT, Some("chat"), None);
        let offered = vec!["chat".to_string()];

        let (res, len) = validate_upgrade_response(&raw, SAMPLE_KEY, &offered)
            .unwrap()
            .unwrap();
        assert_eq!(res.protocol.as_deref(), Some("chat"));
        assert_eq!(len, raw.len());
    }

    #[test]
    fn validate_rejects_wrong_accept() {
        let raw = build_accept_response("AAAAAAAAAAAAAAAAAAAAAAAAAAA=", None, None);
        assert!(validate_upgrade_response(&raw, SAMPLE_KEY, &[]).is_err());
    }

    #[test]
    fn validate_rejects_unoffered_protocol() {
        let raw = build_accept_response(SAMPLE_ACCEPT, Some("surprise"), None);
        assert!(validate_upgrade_response(&raw, SAMPLE_KEY, &[]).is_err());
    }

    #[test]
    fn validate_rejects_non_101() {
        let raw = build_reject_response("nope");
        assert!(validate_upgrade_response(&raw, SAMPLE_KEY, &[]).is_err());
    }

    #[test]
    fn validate_partial_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n";
        assert!(validate_upgrade_response(raw, SAMPLE_KEY, &[])
            .unwrap()
            .is_none());
    }
}
