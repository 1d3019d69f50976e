//! HTTP/1.1 upgrade handshake for the WebSocket transport.
//!
//! Only what a LAN peer needs: a `GET` with `Sec-WebSocket-Key` on the way
//! in, a `101` with the derived accept key on the way out. Extensions and
//! subprotocols are ignored.

use std::collections::HashMap;
use std::io::{BufRead, Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on header lines before the request is treated as malformed.
const MAX_HEADERS: usize = 64;

/// Longest request, status or header line accepted, terminator included.
const MAX_LINE: u64 = 8192;

/// The parts of an upgrade request we act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

/// Derive `Sec-WebSocket-Accept` from a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh random client key: 16 bytes, Base64-encoded.
pub fn generate_key() -> String {
    STANDARD.encode(uuid::Uuid::new_v4().as_bytes())
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut line = String::new();
    let n = reader.by_ref().take(MAX_LINE).read_line(&mut line)?;
    if n == 0 {
        return Err(HandshakeError::ConnectionClosed);
    }
    if !line.ends_with('\n') && n as u64 == MAX_LINE {
        return Err(HandshakeError::MalformedRequestLine(format!(
            "line exceeds {} bytes",
            MAX_LINE
        )));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, HandshakeError> {
    let mut headers = HashMap::new();
    for _ in 0..MAX_HEADERS {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Err(HandshakeError::MalformedRequestLine("too many header lines".into()))
}

/// Read an upgrade request up to and including the blank line.
///
/// The reader must be the same buffered reader later used for frames, or
/// bytes that arrived with the headers would be lost.
pub fn read_upgrade_request<R: BufRead>(reader: &mut R) -> Result<UpgradeRequest, HandshakeError> {
    let request_line = read_line(reader)?;
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) => (m, p, v),
        _ => return Err(HandshakeError::MalformedRequestLine(request_line)),
    };
    if method != "GET" || version != "HTTP/1.1" {
        return Err(HandshakeError::MalformedRequestLine(request_line));
    }
    let path = path.to_string();

    let headers = read_headers(reader)?;
    let key = headers
        .get("sec-websocket-key")
        .filter(|k| !k.is_empty())
        .cloned()
        .ok_or(HandshakeError::MissingKey)?;

    Ok(UpgradeRequest { path, key, headers })
}

pub fn write_upgrade_response<W: Write>(writer: &mut W, key: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    writer.write_all(response.as_bytes())?;
    writer.flush()
}

/// Server side of the handshake: read the request, answer `101`.
pub fn server_handshake<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> Result<UpgradeRequest, HandshakeError> {
    let request = read_upgrade_request(reader)?;
    write_upgrade_response(writer, &request.key)?;
    Ok(request)
}

pub fn write_upgrade_request<W: Write>(writer: &mut W, host: &str, path: &str, key: &str) -> std::io::Result<()> {
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, key
    );
    writer.write_all(request.as_bytes())?;
    writer.flush()
}

/// Read the server's answer and check it against the key we sent.
pub fn read_upgrade_response<R: BufRead>(reader: &mut R, key: &str) -> Result<(), HandshakeError> {
    let status_line = read_line(reader)?;
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some("101")) if version.starts_with("HTTP/1.") => {}
        _ => return Err(HandshakeError::UnexpectedStatus(status_line)),
    }

    let headers = read_headers(reader)?;
    match headers.get("sec-websocket-accept") {
        Some(accept) if *accept == accept_key(key) => Ok(()),
        _ => Err(HandshakeError::AcceptMismatch),
    }
}

/// Client side of the handshake.
pub fn client_handshake<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    host: &str,
) -> Result<(), HandshakeError> {
    let key = generate_key();
    write_upgrade_request(writer, host, "/", &key)?;
    read_upgrade_response(reader, &key)
}
