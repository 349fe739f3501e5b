//! Blocking write half.

use std::io::{self, Write};
use std::sync::Arc;

use crate::errors::is_disconnect;
use crate::stream::Channel;

enum WriteWait {
    Ready,
    Closed,
    TimedOut,
    Failed(io::Error),
}

/// Blocking [`Write`] over a [`Channel`].
///
/// Each attempt that finds the socket full parks for at most the channel's
/// write timeout; if nothing could be written in that window the call fails
/// with [`io::ErrorKind::TimedOut`] and the channel stays open. A peer that
/// has gone away yields [`io::ErrorKind::UnexpectedEof`] and fires the
/// channel's close notification; writing after a local close yields
/// [`io::ErrorKind::BrokenPipe`].
///
/// Must not be called from inside an async task.
#[derive(Debug, Clone)]
pub struct ChannelOutput {
    channel: Arc<Channel>,
}

impl ChannelOutput {
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

    fn gone(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection gone (channel {})", self.channel.id()),
        )
    }

    fn closed(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("channel {} is closed", self.channel.id()),
        )
    }
}

impl Write for ChannelOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // A peer that went away reports as gone even once the close
            // notification has released the socket.
            if self.channel.lock_read_ahead().eof {
                return Err(self.gone());
            }
            let Some(socket) = self.channel.socket() else {
                return Err(self.closed());
            };

            match socket.try_write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if is_disconnect(err.kind()) => {
                    self.channel.lock_read_ahead().eof = true;
                    self.channel.remote_closed();
                    return Err(self.gone());
                }
                Err(err) => return Err(err),
            }

            let timeout = self.channel.write_timeout;
            let closed = self.channel.closed_token();
            let wait = self.channel.runtime.block_on(async {
                tokio::select! {
                    () = closed.cancelled() => WriteWait::Closed,
                    ready = tokio::time::timeout(timeout, socket.writable()) => match ready {
                        Ok(Ok(())) => WriteWait::Ready,
                        Ok(Err(err)) => WriteWait::Failed(err),
                        Err(_) => WriteWait::TimedOut,
                    },
                }
            });

            match wait {
                WriteWait::Ready => {}
                WriteWait::Closed => {
                    if self.channel.lock_read_ahead().eof {
                        return Err(self.gone());
                    }
                    return Err(self.closed());
                }
                WriteWait::TimedOut => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write stalled for {timeout:?}"),
                    ));
                }
                WriteWait::Failed(err) => return Err(err),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
