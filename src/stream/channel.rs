//! Shared state behind one blocking stream pair.
//!
//! A [`Channel`] owns a non-blocking [`TcpStream`] registered with the
//! service runtime, the read-ahead buffer shared by the consumer and the
//! close watcher, and the once-only close notification. Both
//! [`ChannelInput`] and [`ChannelOutput`] are thin handles over the same
//! `Arc<Channel>`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::is_disconnect;
use crate::stream::{ChannelInput, ChannelOutput};
use crate::{AppError, Result};

/// Bytes pulled from the socket per watcher peek.
const PEEK_CHUNK: usize = 8 * 1024;

/// Callback run when the peer is found to have gone away.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Runtime wiring and tuning for a new channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Runtime whose reactor drives the socket.
    pub runtime: Handle,
    /// Upper bound for a single blocked write attempt.
    pub write_timeout: Duration,
    /// Starting capacity of the read-ahead buffer.
    pub read_ahead_initial: usize,
    /// Buffered bytes at which the watcher stops reading ahead.
    pub read_ahead_limit: usize,
}

/// Once-only close notification.
///
/// `fired` is the single consuming flag: whichever path swaps it first (an
/// active read, an active write, or the watcher) runs the callback; every
/// later attempt is a no-op.
struct CloseHook {
    fired: AtomicBool,
    callback: Mutex<Option<CloseCallback>>,
}

impl CloseHook {
    fn new(callback: Option<CloseCallback>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(callback),
        }
    }

    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    fn disarm(&self) {
        self.fired.store(true, Ordering::Release);
        drop(
            self.callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Bytes read from the socket but not yet handed to the consumer.
pub(crate) struct ReadAhead {
    pub(crate) buf: BytesMut,
    pub(crate) eof: bool,
}

/// Result of one opportunistic watcher read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeekOutcome {
    /// Bytes were appended to the read-ahead buffer.
    Buffered(usize),
    /// Readiness was spurious; keep watching.
    Pending,
    /// The peer closed; the close callback has been fired.
    Eof,
    /// The channel was closed locally or already reached EOF.
    Closed,
}

/// One socket shared by a blocking input/output pair.
pub struct Channel {
    id: u64,
    peer: Option<SocketAddr>,
    socket: Mutex<Option<Arc<TcpStream>>>,
    read_ahead: Mutex<ReadAhead>,
    local_closed: AtomicBool,
    closed: CancellationToken,
    hook: CloseHook,
    // Signalled after the watcher moves bytes or EOF into `read_ahead`, which
    // may consume the socket readiness a parked reader is waiting on.
    arrived: Notify,
    // Signalled by the consumer after it takes bytes from `read_ahead`.
    drained: Notify,
    read_ahead_limit: usize,
    pub(crate) write_timeout: Duration,
    pub(crate) runtime: Handle,
}

impl Channel {
    /// Wrap a connected socket.
    ///
    /// The socket is switched to non-blocking mode and registered with the
    /// runtime in `options`. `on_close` runs at most once, and only when the
    /// peer is detected to have gone away; a local [`close`](Self::close)
    /// never runs it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the socket cannot be switched to
    /// non-blocking mode or registered with the runtime.
    pub fn new(
        id: u64,
        stream: std::net::TcpStream,
        options: &ChannelOptions,
        on_close: Option<CloseCallback>,
    ) -> Result<Arc<Self>> {
        stream
            .set_nonblocking(true)
            .map_err(|err| AppError::Io(format!("failed to set non-blocking mode: {err}")))?;
        let peer = stream.peer_addr().ok();

        let socket = {
            let _entered = options.runtime.enter();
            TcpStream::from_std(stream)
                .map_err(|err| AppError::Io(format!("failed to register socket: {err}")))?
        };

        Ok(Arc::new(Self {
            id,
            peer,
            socket: Mutex::new(Some(Arc::new(socket))),
            read_ahead: Mutex::new(ReadAhead {
                buf: BytesMut::with_capacity(options.read_ahead_initial),
                eof: false,
            }),
            local_closed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            hook: CloseHook::new(on_close),
            arrived: Notify::new(),
            drained: Notify::new(),
            read_ahead_limit: options.read_ahead_limit,
            write_timeout: options.write_timeout,
            runtime: options.runtime.clone(),
        }))
    }

    /// Blocking input/output handles over this channel.
    #[must_use]
    pub fn split(self: &Arc<Self>) -> (ChannelInput, ChannelOutput) {
        (
            ChannelInput::new(Arc::clone(self)),
            ChannelOutput::new(Arc::clone(self)),
        )
    }

    /// Identifier used in log fields.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address captured when the channel was created.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the channel can still carry bytes in both directions.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.is_closed() && !self.lock_read_ahead().eof && self.socket().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.local_closed.load(Ordering::Acquire)
    }

    /// Whether the remote-close notification has been used up, either by
    /// firing or by a local [`close`](Self::close) disarming it.
    #[must_use]
    pub fn close_notified(&self) -> bool {
        self.hook.has_fired()
    }

    /// Bytes currently held in the read-ahead buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lock_read_ahead().buf.len()
    }

    /// Close locally. Idempotent.
    ///
    /// Wakes every reader and writer parked on this channel and releases the
    /// socket once they let go of it. The remote-close callback is disarmed,
    /// not run.
    pub fn close(&self) {
        if self.local_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hook.disarm();
        self.closed.cancel();
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(socket);
        debug!(channel_id = self.id, "channel closed locally");
    }

    pub(crate) fn socket(&self) -> Option<Arc<TcpStream>> {
        if self.is_closed() {
            return None;
        }
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn lock_read_ahead(&self) -> MutexGuard<'_, ReadAhead> {
        self.read_ahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn arrived(&self) -> &Notify {
        &self.arrived
    }

    pub(crate) fn drained(&self) -> &Notify {
        &self.drained
    }

    /// Whether the read-ahead buffer has reached its limit.
    pub(crate) fn read_ahead_full(&self) -> bool {
        self.buffered() >= self.read_ahead_limit
    }

    /// Record that the peer is gone and run the close callback once.
    ///
    /// Must be called without holding the read-ahead lock.
    pub(crate) fn remote_closed(&self) {
        if self.hook.fire() {
            debug!(channel_id = self.id, peer = ?self.peer, "remote close detected");
        }
    }

    /// Pull whatever is readable into the read-ahead buffer without blocking.
    pub(crate) fn peek(&self) -> PeekOutcome {
        let Some(socket) = self.socket() else {
            return PeekOutcome::Closed;
        };

        let mut read_ahead = self.lock_read_ahead();
        if read_ahead.eof {
            return PeekOutcome::Closed;
        }

        let mut chunk = [0u8; PEEK_CHUNK];
        let outcome = match socket.try_read(&mut chunk) {
            Ok(0) => {
                read_ahead.eof = true;
                PeekOutcome::Eof
            }
            Ok(n) => {
                read_ahead.buf.extend_from_slice(&chunk[..n]);
                PeekOutcome::Buffered(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => PeekOutcome::Pending,
            Err(err) => {
                if !is_disconnect(err.kind()) {
                    warn!(channel_id = self.id, %err, "watcher read failed; treating as close");
                }
                read_ahead.eof = true;
                PeekOutcome::Eof
            }
        };
        drop(read_ahead);

        match outcome {
            PeekOutcome::Buffered(_) => self.arrived.notify_one(),
            PeekOutcome::Eof => {
                self.arrived.notify_one();
                self.remote_closed();
            }
            PeekOutcome::Pending | PeekOutcome::Closed => {}
        }
        outcome
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
