//! Worker handshake framing.
//!
//! A freshly started worker connects to its agent slot's listener and sends
//! exactly one frame:
//!
//! 1. **key** — a `u16` big-endian byte length followed by the UTF-8 bytes of
//!    the authorization key.
//! 2. **port** — a 4-byte big-endian signed integer naming the worker's own
//!    control listener, which the host dials back for every connection.
//!
//! Nothing past this frame is interpreted here; the rest of the socket
//! belongs to the upper-layer protocol.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::launch::key::AuthorizationKey;
use crate::{AppError, Result};

/// Longest key accepted on the wire.
pub const MAX_KEY_BYTES: usize = 1024;

/// A decoded handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Key the worker presented.
    pub key: AuthorizationKey,
    /// Port of the worker's control listener.
    pub port: u16,
}

/// Encode a handshake frame as the worker sends it.
///
/// # Errors
///
/// Returns `AppError::ProtocolAuth` if the key is empty or longer than
/// [`MAX_KEY_BYTES`], or if `port` is zero.
pub fn encode_handshake(key: &str, port: u16) -> Result<Vec<u8>> {
    let bytes = key.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_KEY_BYTES {
        return Err(AppError::ProtocolAuth(format!(
            "key length {} outside 1..={MAX_KEY_BYTES}",
            bytes.len()
        )));
    }
    if port == 0 {
        return Err(AppError::ProtocolAuth("port must not be zero".into()));
    }

    let len = u16::try_from(bytes.len())
        .map_err(|_| AppError::ProtocolAuth("key too long for frame".into()))?;

    let mut frame = Vec::with_capacity(2 + bytes.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(bytes);
    frame.extend_from_slice(&i32::from(port).to_be_bytes());
    Ok(frame)
}

/// Read one handshake frame from `reader`.
///
/// # Errors
///
/// - `AppError::ProtocolAuth` — empty/oversized/non-UTF-8 key or a port
///   outside `1..=65535`.
/// - `AppError::StreamClosed` — the peer closed before the frame completed.
/// - `AppError::Io` — any other socket failure.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let len = usize::from(reader.read_u16().await?);
    if len == 0 || len > MAX_KEY_BYTES {
        return Err(AppError::ProtocolAuth(format!(
            "key length {len} outside 1..={MAX_KEY_BYTES}"
        )));
    }

    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await?;
    let key = String::from_utf8(raw)
        .map_err(|_| AppError::ProtocolAuth("key is not valid utf-8".into()))?;

    let raw_port = reader.read_i32().await?;
    let port = u16::try_from(raw_port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| AppError::ProtocolAuth(format!("invalid callback port {raw_port}")))?;

    debug!(port, "handshake: frame decoded");
    Ok(Handshake {
        key: AuthorizationKey::from_wire(key),
        port,
    })
}

/// Read one handshake frame, failing if it does not arrive within `timeout`.
///
/// # Errors
///
/// `AppError::HandshakeTimeout` when the deadline elapses, otherwise the
/// errors of [`read_handshake`].
pub async fn read_handshake_within<R>(reader: &mut R, timeout: Duration) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_handshake(reader))
        .await
        .map_err(|_| {
            AppError::HandshakeTimeout(format!("handshake not received within {timeout:?}"))
        })?
}
