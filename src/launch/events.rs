//! Lifecycle event fan-out.
//!
//! Listeners are kept in a copy-on-write list: registration swaps in a new
//! snapshot, and dispatch iterates whatever snapshot was current when it
//! started without holding any lock. A panicking listener is logged and the
//! remaining listeners still run.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::warn;

use crate::launch::key::AuthorizationKey;

/// Events emitted over an agent's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LaunchEvent {
    /// A control connection to the worker was opened.
    ConnectionInitiated {
        /// Owning agent.
        key: AuthorizationKey,
        /// Connection identifier.
        connection_id: u64,
        /// Worker address the connection is bound to.
        peer: Option<SocketAddr>,
    },
    /// The worker called back and presented this agent's key.
    HandshakeCompleted {
        /// Agent that received the handshake.
        key: AuthorizationKey,
        /// Address the host dials for control connections.
        callback: SocketAddr,
    },
    /// A control connection closed.
    ConnectionClosed {
        /// Owning agent.
        key: AuthorizationKey,
        /// Connection identifier.
        connection_id: u64,
        /// `true` when the worker side went away first.
        remote: bool,
    },
    /// The agent was torn down.
    AgentDestroyed {
        /// Destroyed agent.
        key: AuthorizationKey,
    },
}

impl LaunchEvent {
    /// Agent the event belongs to.
    #[must_use]
    pub fn key(&self) -> &AuthorizationKey {
        match self {
            Self::ConnectionInitiated { key, .. }
            | Self::HandshakeCompleted { key, .. }
            | Self::ConnectionClosed { key, .. }
            | Self::AgentDestroyed { key } => key,
        }
    }
}

/// Receiver of [`LaunchEvent`]s.
///
/// Called synchronously on whichever thread produced the event (the accept
/// loop, the close watcher, or a caller), so implementations must return
/// quickly and must not call blocking stream operations.
pub trait LaunchListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &LaunchEvent);
}

impl<F> LaunchListener for F
where
    F: Fn(&LaunchEvent) + Send + Sync,
{
    fn on_event(&self, event: &LaunchEvent) {
        self(event);
    }
}

/// Token returned by [`ListenerSet::add`] for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Snapshot = Arc<Vec<(ListenerId, Arc<dyn LaunchListener>)>>;

/// Copy-on-write listener list.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Snapshot>,
}

impl ListenerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn LaunchListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Deliver `event` to every listener in the current snapshot.
    pub fn dispatch(&self, event: &LaunchEvent) {
        let snapshot = self.snapshot();
        for (id, listener) in snapshot.iter() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if delivered.is_err() {
                warn!(listener = id.0, key = %event.key(), "launch listener panicked");
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        Arc::clone(
            &self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}
