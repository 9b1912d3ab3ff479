//! Client side of the RFC 6455 opening handshake.
//!
//! The request is written as plain HTTP/1.1 on the caller's stream. The response header block
//! is read through the same `BufReader` the connection keeps afterwards, so any frame bytes the
//! server pipelined behind the `101` are not lost.

use std::sync::Arc;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use http::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::destination::Destination;
use super::extension::WsExtension;
use super::protocol::WsSubprotocol;
use crate::core::{DiagnosticBuilder, HandshakeError, WebSocketResult};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: &str = "13";

/// `Sec-WebSocket-Accept` value the server must answer for `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Fresh base64-encoded 16-byte nonce for `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Inputs of one handshake attempt.
pub struct HandshakeRequest<'a> {
    pub destination: &'a Destination,
    /// Caller headers, already merged from client defaults and per-call overrides.
    pub headers: &'a HeaderMap,
    pub extensions: &'a [Arc<dyn WsExtension>],
    pub subprotocols: &'a [Arc<dyn WsSubprotocol>],
    pub max_response_bytes: usize,
    pub read_buffer_bytes: usize,
}

/// Outcome of a successful handshake.
pub struct Negotiated<S> {
    pub stream: BufReader<S>,
    pub extension: Arc<dyn WsExtension>,
    pub subprotocol: Arc<dyn WsSubprotocol>,
    pub response_headers: HeaderMap,
}

/// Build the upgrade request headers. Protocol headers override caller headers of the same name.
pub fn request_headers(
    destination: &Destination,
    key: &str,
    headers: &HeaderMap,
    extensions: &[Arc<dyn WsExtension>],
    subprotocols: &[Arc<dyn WsSubprotocol>],
) -> Result<HeaderMap, HandshakeError> {
    let mut out = headers.clone();
    out.insert(HOST, header_value(&destination.host_header())?);
    out.insert(UPGRADE, HeaderValue::from_static("websocket"));
    out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    out.insert(SEC_WEBSOCKET_KEY, header_value(key)?);
    out.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WS_VERSION));

    let offered = join_offers(extensions.iter().map(|e| e.provided_extension_as_client()));
    if !offered.is_empty() {
        out.insert(SEC_WEBSOCKET_EXTENSIONS, header_value(&offered)?);
    }
    let offered = join_offers(subprotocols.iter().map(|p| p.provided_protocol()));
    if !offered.is_empty() {
        out.insert(SEC_WEBSOCKET_PROTOCOL, header_value(&offered)?);
    }
    Ok(out)
}

/// Serialize the request line and header block.
pub fn encode_request(destination: &Destination, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"GET ");
    out.extend_from_slice(destination.descriptor().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Run the handshake over `stream`, recording progress into `diag`.
pub async fn client_handshake<S>(
    stream: S,
    request: HandshakeRequest<'_>,
    diag: &mut DiagnosticBuilder,
) -> WebSocketResult<Negotiated<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let headers = request_headers(
        request.destination,
        &key,
        request.headers,
        request.extensions,
        request.subprotocols,
    )?;
    diag.headers(&headers);

    let mut stream = BufReader::with_capacity(request.read_buffer_bytes, stream);
    stream
        .write_all(&encode_request(request.destination, &headers))
        .await?;
    stream.flush().await?;
    diag.written();
    debug!(destination = %request.destination, "websocket upgrade request written");

    let limit = request.max_response_bytes;
    let mut budget = limit;
    let status_line = read_line(&mut stream, &mut budget, limit).await?;
    let (code, message) = parse_status_line(&status_line)?;
    diag.response_started(code, message);
    if code != 101 {
        return Err(HandshakeError::UnexpectedStatus {
            code,
            line: status_line,
        }
        .into());
    }

    let mut response_headers = HeaderMap::new();
    loop {
        let line = read_line(&mut stream, &mut budget, limit).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(&line)?;
        response_headers.append(name, value);
    }
    diag.response_done(&response_headers);

    let expected = accept_key(&key);
    let received = response_headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .ok_or(HandshakeError::MissingAccept)?
        .to_str()
        .unwrap_or_default();
    if received != expected {
        return Err(HandshakeError::AcceptMismatch {
            expected,
            received: received.to_string(),
        }
        .into());
    }

    let extension_header = header_str(&response_headers, &SEC_WEBSOCKET_EXTENSIONS);
    let extension = request
        .extensions
        .iter()
        .find(|ext| ext.accept_provided_extension_as_client(extension_header))
        .cloned()
        .ok_or_else(|| HandshakeError::NoAcceptableExtension(extension_header.to_string()))?;

    let protocol_header = header_str(&response_headers, &SEC_WEBSOCKET_PROTOCOL);
    let subprotocol = request
        .subprotocols
        .iter()
        .find(|proto| proto.accept_protocol(protocol_header))
        .cloned()
        .ok_or_else(|| HandshakeError::NoAcceptableSubprotocol(protocol_header.to_string()))?;

    debug!(
        destination = %request.destination,
        extension = extension.name(),
        subprotocol = %subprotocol.provided_protocol(),
        "websocket upgrade accepted"
    );
    Ok(Negotiated {
        stream,
        extension,
        subprotocol,
        response_headers,
    })
}

/// Split `HTTP/1.1 101 Switching Protocols` into code and reason. The reason may be absent.
pub fn parse_status_line(line: &str) -> Result<(u16, &str), HandshakeError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        if version.to_ascii_uppercase().starts_with("HTTP/") {
            return Err(HandshakeError::UnsupportedVersion(line.to_string()));
        }
        return Err(HandshakeError::MalformedStatusLine(line.to_string()));
    }
    let code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| HandshakeError::MalformedStatusLine(line.to_string()))?;
    Ok((code, parts.next().unwrap_or_default()))
}

/// Split `Name: value` on the first colon.
pub fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue), HandshakeError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| HandshakeError::MalformedHeader(line.to_string()))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| HandshakeError::MalformedHeader(line.to_string()))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|_| HandshakeError::MalformedHeader(line.to_string()))?;
    Ok((name, value))
}

/// Read one CRLF- or LF-terminated line, charging its length against `budget`.
async fn read_line<S>(
    stream: &mut BufReader<S>,
    budget: &mut usize,
    limit: usize,
) -> WebSocketResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *stream)
        .take(*budget as u64)
        .read_until(b'\n', &mut line)
        .await?;
    *budget -= read;

    if line.last() != Some(&b'\n') {
        return Err(if *budget == 0 {
            HandshakeError::ResponseTooLarge { limit }
        } else {
            HandshakeError::IncompleteResponse
        }
        .into());
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|err| HandshakeError::MalformedHeader(format!("non UTF-8 line: {err}")).into())
}

fn join_offers(offers: impl Iterator<Item = String>) -> String {
    offers
        .filter(|offer| !offer.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn header_value(value: &str) -> Result<HeaderValue, HandshakeError> {
    HeaderValue::from_str(value).map_err(|_| HandshakeError::InvalidRequestHeader(value.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::extension::DefaultExtension;
    use crate::ws::protocol::Subprotocol;

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_16_byte_nonces() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn request_carries_upgrade_headers_and_offers() {
        let dest: Destination = "ws://example.test:8080/chat?room=1".parse().unwrap();
        let mut caller = HeaderMap::new();
        caller.insert("x-client", HeaderValue::from_static("demo"));
        caller.insert(UPGRADE, HeaderValue::from_static("h2c"));
        let extensions: Vec<Arc<dyn WsExtension>> = vec![Arc::new(DefaultExtension)];
        let protocols: Vec<Arc<dyn WsSubprotocol>> = vec![
            Arc::new(Subprotocol::new("chat")),
            Arc::new(Subprotocol::new("")),
            Arc::new(Subprotocol::new("superchat")),
        ];

        let headers =
            request_headers(&dest, "a2V5", &caller, &extensions, &protocols).unwrap();
        assert_eq!(headers[HOST], "example.test:8080");
        assert_eq!(headers[UPGRADE], "websocket");
        assert_eq!(headers[CONNECTION], "Upgrade");
        assert_eq!(headers[SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(headers[SEC_WEBSOCKET_PROTOCOL], "chat, superchat");
        assert!(headers.get(SEC_WEBSOCKET_EXTENSIONS).is_none());
        assert_eq!(headers["x-client"], "demo");

        let wire = String::from_utf8(encode_request(&dest, &headers)).unwrap();
        assert!(wire.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(wire.contains("sec-websocket-key: a2V5\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(
            parse_status_line("HTTP/1.1 101 Switching Protocols").unwrap(),
            (101, "Switching Protocols")
        );
        assert_eq!(parse_status_line("http/1.1 101").unwrap(), (101, ""));
        assert!(matches!(
            parse_status_line("HTTP/1.0 101 Switching Protocols"),
            Err(HandshakeError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            parse_status_line("garbage"),
            Err(HandshakeError::MalformedStatusLine(_))
        ));
        assert!(matches!(
            parse_status_line("HTTP/1.1 abc"),
            Err(HandshakeError::MalformedStatusLine(_))
        ));
    }

    #[test]
    fn header_line_splits_on_first_colon() {
        let (name, value) = parse_header_line("Location: http://example.test/x").unwrap();
        assert_eq!(name, "location");
        assert_eq!(value, "http://example.test/x");
        assert!(matches!(
            parse_header_line("no separator here"),
            Err(HandshakeError::MalformedHeader(_))
        ));
    }
}
