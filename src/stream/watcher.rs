//! Shared close watcher.
//!
//! A single background task watches every registered [`Channel`] for
//! readability. When one becomes readable while nobody is reading, the
//! watcher pulls the available bytes into the channel's read-ahead buffer
//! (where the next `read` will find them) and, on genuine EOF, fires the
//! channel's close notification and stops watching it. This is how a
//! connection learns its worker died even when the consumer is idle.
//!
//! A channel whose read-ahead buffer is full is not peeked again until its
//! consumer drains it, so an idle consumer still applies TCP backpressure.
//!
//! Channels are handed over through an unbounded queue so registration never
//! blocks the caller; the task wakes as soon as something is queued.

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::stream::channel::PeekOutcome;
use crate::stream::Channel;

/// Handle for registering channels with the running watcher task.
#[derive(Debug, Clone)]
pub struct CloseWatcher {
    registrations: mpsc::UnboundedSender<Arc<Channel>>,
}

impl CloseWatcher {
    /// Spawn the watcher task on `runtime`.
    ///
    /// The task runs until `cancel` fires or every handle is dropped.
    #[must_use]
    pub fn spawn(runtime: &Handle, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (registrations, queue) = mpsc::unbounded_channel();
        let task = runtime.spawn(run(queue, cancel).instrument(info_span!("close_watcher")));
        (Self { registrations }, task)
    }

    /// Start watching `channel`.
    ///
    /// Returns `false` if the watcher task has already stopped.
    pub fn watch(&self, channel: Arc<Channel>) -> bool {
        self.registrations.send(channel).is_ok()
    }
}

async fn run(mut queue: mpsc::UnboundedReceiver<Arc<Channel>>, cancel: CancellationToken) {
    let mut watched = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                info!(watched = watched.len(), "close watcher shutting down");
                break;
            }

            registration = queue.recv() => {
                let Some(channel) = registration else {
                    debug!("close watcher queue closed");
                    break;
                };
                trace!(channel_id = channel.id(), "watching channel");
                watched.push(watch_once(channel));
            }

            Some((channel, outcome)) = watched.next(), if !watched.is_empty() => {
                match outcome {
                    PeekOutcome::Buffered(n) => {
                        trace!(channel_id = channel.id(), bytes = n, "buffered ahead of reader");
                        watched.push(watch_once(channel));
                    }
                    PeekOutcome::Pending => watched.push(watch_once(channel)),
                    PeekOutcome::Eof => {
                        debug!(channel_id = channel.id(), "watched channel reached EOF");
                    }
                    PeekOutcome::Closed => {
                        trace!(channel_id = channel.id(), "watched channel closed locally");
                    }
                }
            }
        }
    }
}

async fn watch_once(channel: Arc<Channel>) -> (Arc<Channel>, PeekOutcome) {
    while channel.read_ahead_full() {
        tokio::select! {
            () = channel.closed_token().cancelled() => return (channel, PeekOutcome::Closed),
            () = channel.drained().notified() => {}
        }
    }

    let Some(socket) = channel.socket() else {
        return (channel, PeekOutcome::Closed);
    };

    let readable = tokio::select! {
        () = channel.closed_token().cancelled() => false,
        _ = socket.readable() => true,
    };
    drop(socket);

    let outcome = if readable {
        channel.peek()
    } else {
        PeekOutcome::Closed
    };
    (channel, outcome)
}
