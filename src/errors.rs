//! Error types shared across the crate.

use std::fmt::{Display, Formatter};
use std::io;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the agent link.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Unknown or garbled authorization key during a handshake.
    ProtocolAuth(String),
    /// Peer connected but did not finish the handshake in time.
    HandshakeTimeout(String),
    /// Dialing the worker's callback address failed or timed out.
    Connect(String),
    /// A stream write did not complete within the write timeout.
    StreamTimeout(String),
    /// The peer is gone; the stream reached end-of-stream.
    StreamClosed(String),
    /// Operation violates an agent or connection lifecycle invariant.
    IllegalState(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or socket I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::ProtocolAuth(msg) => write!(f, "protocol auth: {msg}"),
            Self::HandshakeTimeout(msg) => write!(f, "handshake timeout: {msg}"),
            Self::Connect(msg) => write!(f, "connect: {msg}"),
            Self::StreamTimeout(msg) => write!(f, "stream timeout: {msg}"),
            Self::StreamClosed(msg) => write!(f, "stream closed: {msg}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::StreamTimeout(err.to_string()),
            kind if is_disconnect(kind) => Self::StreamClosed(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Whether an I/O error kind means the peer went away.
pub(crate) fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
