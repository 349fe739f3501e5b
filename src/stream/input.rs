//! Blocking read half.

use std::io::{self, Read};
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::errors::is_disconnect;
use crate::stream::Channel;

/// What a single non-blocking read attempt produced.
enum ReadStep {
    /// Deliver this many bytes (zero means end-of-stream).
    Done(usize),
    /// Nothing available yet; park on this socket.
    Park(Arc<TcpStream>),
    /// The peer is gone; report end-of-stream after notifying.
    RemoteClosed,
}

/// Blocking [`Read`] over a [`Channel`].
///
/// Bytes already pulled into the read-ahead buffer by the close watcher are
/// always returned before the socket is touched again, so the consumer sees
/// the peer's bytes in order with nothing lost or repeated. After EOF or a
/// local close every read returns `Ok(0)` immediately.
///
/// Reads have no deadline. A reader parked here is released by data, by
/// EOF, or by [`close`](Self::close) from any thread.
///
/// Must not be called from inside an async task: parking uses
/// [`Handle::block_on`](tokio::runtime::Handle::block_on).
#[derive(Debug, Clone)]
pub struct ChannelInput {
    channel: Arc<Channel>,
}

impl ChannelInput {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    /// Close the underlying channel. Idempotent.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Whether the underlying channel was closed locally.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Bytes buffered ahead of the consumer.
    #[must_use]
    pub fn available(&self) -> usize {
        self.channel.buffered()
    }

    fn step(&self, buf: &mut [u8]) -> io::Result<ReadStep> {
        let mut read_ahead = self.channel.lock_read_ahead();

        if !read_ahead.buf.is_empty() {
            let n = buf.len().min(read_ahead.buf.len());
            let head = read_ahead.buf.split_to(n);
            buf[..n].copy_from_slice(&head);
            drop(read_ahead);
            self.channel.drained().notify_one();
            return Ok(ReadStep::Done(n));
        }
        if read_ahead.eof {
            return Ok(ReadStep::Done(0));
        }
        let Some(socket) = self.channel.socket() else {
            return Ok(ReadStep::Done(0));
        };

        // The lock stays held across the attempt so a concurrent watcher
        // peek cannot slip bytes in ahead of this read.
        match socket.try_read(buf) {
            Ok(0) => {
                read_ahead.eof = true;
                Ok(ReadStep::RemoteClosed)
            }
            Ok(n) => Ok(ReadStep::Done(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::Park(socket)),
            Err(err) if is_disconnect(err.kind()) => {
                read_ahead.eof = true;
                Ok(ReadStep::RemoteClosed)
            }
            Err(err) => Err(err),
        }
    }

    fn park(&self, socket: &TcpStream) -> io::Result<()> {
        let closed = self.channel.closed_token();
        let arrived = self.channel.arrived();
        self.channel.runtime.block_on(async {
            tokio::select! {
                () = closed.cancelled() => Ok(()),
                () = arrived.notified() => Ok(()),
                ready = socket.readable() => ready,
            }
        })
    }
}

impl Read for ChannelInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.step(buf)? {
                ReadStep::Done(n) => return Ok(n),
                ReadStep::RemoteClosed => {
                    self.channel.remote_closed();
                    return Ok(0);
                }
                ReadStep::Park(socket) => self.park(&socket)?,
            }
        }
    }
}
