//! Error types for the podium network layer.

use std::io;

use thiserror::Error;

use podium_types::Role;

/// Errors surfaced to callers of the network layer.
///
/// Per-connection failures never show up here; they close the affected
/// connection and are reported as events instead.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("port {port} still unavailable after {attempts} attempts")]
    PortUnavailable {
        port: u16,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("operation requires the {expected} role")]
    WrongRole { expected: Role },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why an HTTP upgrade did not complete.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("unexpected status line: {0:?}")]
    UnexpectedStatus(String),

    #[error("Sec-WebSocket-Accept did not match the request key")]
    AcceptMismatch,

    #[error("connection closed during handshake")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
