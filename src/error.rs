use std::time::Duration;
use thiserror::Error;

/// Errors encoding or decoding a wire message. These are local and non-fatal for an established
///  connection: the offending datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("short buffer: {needed} bytes needed, {available} available")]
    ShortBuffer { needed: usize, available: usize },
    #[error("too many acks: {0} (at most 127 fit into a series)")]
    TooManyAcks(usize),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("decoding error: {0}")]
    Decoding(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("protocol version mismatch: expected {expected}, peer sent {actual}")]
    ProtocolVersion { expected: u32, actual: u32 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal or surfaced failure of an established connection. This is `Clone` because a single
///  failure is reported to every caller blocked on the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("connection timed out: no acknowledgment progress for {0:?}")]
    Timeout(Duration),
    #[error("i/o error: {0}")]
    Io(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::Io(value.to_string())
    }
}
