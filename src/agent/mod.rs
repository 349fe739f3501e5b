//! Agent slots: one per launched worker.
//!
//! An [`Agent`] is created by the launch manager before the worker starts.
//! It carries the authorization key the worker must present, becomes `Ready`
//! once every readiness event for its mode has fired, and owns the control
//! [`Connection`]s opened to the worker afterwards.

pub mod connection;
pub mod debugger;
pub mod state;

use std::net::{SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use connection::Connection;
pub use debugger::DebuggerSession;
pub use state::{AgentState, Readiness};

use crate::launch::args::{ClassLoadingPolicy, LaunchArgs};
use crate::launch::events::LaunchEvent;
use crate::launch::key::AuthorizationKey;
use crate::launch::{LinkContext, ManagerInner};
use crate::{AppError, Result};

struct AgentInner {
    state: AgentState,
    readiness: Readiness,
    callback: Option<SocketAddr>,
    debugger: Option<Arc<dyn DebuggerSession>>,
    connections: Vec<Arc<Connection>>,
    handshake_socket: Option<TcpStream>,
}

/// Host-side representative of one launched worker.
pub struct Agent {
    key: AuthorizationKey,
    identity: String,
    expect_debugger: bool,
    allocated_at: DateTime<Utc>,
    listen_address: SocketAddr,
    listener_token: CancellationToken,
    inner: Mutex<AgentInner>,
    ready: Condvar,
    context: Arc<LinkContext>,
    manager: Weak<ManagerInner>,
}

impl Agent {
    pub(crate) fn new(
        key: AuthorizationKey,
        identity: String,
        expect_debugger: bool,
        listen_address: SocketAddr,
        listener_token: CancellationToken,
        context: Arc<LinkContext>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            key,
            identity,
            expect_debugger,
            allocated_at: Utc::now(),
            listen_address,
            listener_token,
            inner: Mutex::new(AgentInner {
                state: AgentState::Allocated,
                readiness: Readiness::new(expect_debugger),
                callback: None,
                debugger: None,
                connections: Vec::new(),
                handshake_socket: None,
            }),
            ready: Condvar::new(),
            context,
            manager,
        }
    }

    /// Authorization key the worker must present.
    #[must_use]
    pub fn key(&self) -> &AuthorizationKey {
        &self.key
    }

    /// Project or run configuration this agent was opened for.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether a debugger attach is required before the agent is ready.
    #[must_use]
    pub fn expect_debugger(&self) -> bool {
        self.expect_debugger
    }

    /// When the slot was allocated.
    #[must_use]
    pub fn allocated_at(&self) -> DateTime<Utc> {
        self.allocated_at
    }

    /// Host address the worker calls back to with its handshake.
    #[must_use]
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AgentState {
        self.lock_inner().state
    }

    /// Whether connections can be opened.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == AgentState::Ready
    }

    /// Whether the handshake listener is still waiting for the worker.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.listener_token.is_cancelled()
    }

    /// Worker address learned from the handshake.
    #[must_use]
    pub fn callback_address(&self) -> Option<SocketAddr> {
        self.lock_inner().callback
    }

    /// Attached debugger session, if any.
    #[must_use]
    pub fn debugger(&self) -> Option<Arc<dyn DebuggerSession>> {
        self.lock_inner().debugger.clone()
    }

    /// Number of open control connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock_inner().connections.len()
    }

    /// Snapshot of the open control connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock_inner().connections.clone()
    }

    /// Command-line arguments for the worker, using the configured
    /// class-loading policy.
    #[must_use]
    pub fn launch_args(&self) -> LaunchArgs {
        self.launch_args_with(self.context.config.launch.class_loading)
    }

    /// Command-line arguments for the worker with an explicit policy.
    #[must_use]
    pub fn launch_args_with(&self, class_loading: ClassLoadingPolicy) -> LaunchArgs {
        LaunchArgs {
            address: self.listen_address,
            key: self.key.clone(),
            class_loading,
        }
    }

    /// Record the worker's callback address (the handshake event).
    ///
    /// # Errors
    ///
    /// Returns `AppError::IllegalState` if the agent is destroyed or the
    /// handshake was already accepted.
    pub fn target(&self, callback: SocketAddr) -> Result<()> {
        self.accept_handshake(callback, None)
    }

    pub(crate) fn accept_handshake(
        &self,
        callback: SocketAddr,
        socket: Option<TcpStream>,
    ) -> Result<()> {
        let state = {
            let mut inner = self.lock_inner();
            if inner.state == AgentState::Destroyed {
                return Err(AppError::IllegalState(format!(
                    "agent {} is destroyed",
                    self.key
                )));
            }
            if !inner.readiness.fire_handshake() {
                return Err(AppError::IllegalState(format!(
                    "agent {} already completed its handshake",
                    self.key
                )));
            }
            inner.callback = Some(callback);
            inner.handshake_socket = socket;
            inner.state = inner.state.advance(&inner.readiness);
            inner.state
        };

        self.listener_token.cancel();
        self.ready.notify_all();
        info!(key = %self.key, %callback, ?state, "worker handshake accepted");
        self.context.emit(&LaunchEvent::HandshakeCompleted {
            key: self.key.clone(),
            callback,
        });
        Ok(())
    }

    /// Record a debugger attach (the debugger event).
    ///
    /// Attaching the same session again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::IllegalState` if the agent is destroyed or a
    /// different session is already attached.
    pub fn attach_debugger(&self, session: Arc<dyn DebuggerSession>) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.state == AgentState::Destroyed {
                return Err(AppError::IllegalState(format!(
                    "agent {} is destroyed",
                    self.key
                )));
            }
            if let Some(existing) = &inner.debugger {
                if existing.session_id() == session.session_id() {
                    return Ok(());
                }
                return Err(AppError::IllegalState(format!(
                    "agent {} already has debugger session {}",
                    self.key,
                    existing.session_id()
                )));
            }
            inner.readiness.fire_debugger();
            inner.state = inner.state.advance(&inner.readiness);
            info!(key = %self.key, session = session.session_id(), state = ?inner.state, "debugger attached");
            inner.debugger = Some(session);
        }

        self.ready.notify_all();
        Ok(())
    }

    /// Open a new control connection to the worker.
    ///
    /// # Errors
    ///
    /// - `AppError::IllegalState` if the agent is not `Ready`.
    /// - `AppError::Connect` if the worker cannot be reached.
    pub fn create_connection(self: &Arc<Self>) -> Result<Arc<Connection>> {
        let reused = {
            let mut inner = self.lock_inner();
            if inner.state != AgentState::Ready {
                return Err(not_ready(&self.key, inner.state));
            }
            inner.handshake_socket.take()
        };

        match reused {
            Some(socket) => Connection::adopt(self, socket),
            None => Connection::open(self),
        }
    }

    /// Block until the agent is `Ready` or destroyed, or `timeout` elapses.
    ///
    /// Returns `true` only if the agent is `Ready`. Must not be called from
    /// inside the service runtime.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let inner = self.lock_inner();
        let (inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |inner| {
                !matches!(inner.state, AgentState::Ready | AgentState::Destroyed)
            })
            .unwrap_or_else(PoisonError::into_inner);
        inner.state == AgentState::Ready
    }

    /// Tear the agent down. Idempotent; returns `false` if already destroyed.
    ///
    /// Closes every connection (a failure closing one does not stop the
    /// rest), stops the handshake listener, and wakes anyone in
    /// [`wait_ready`](Self::wait_ready).
    pub fn destroy(&self) -> bool {
        let (connections, socket) = {
            let mut inner = self.lock_inner();
            if inner.state == AgentState::Destroyed {
                return false;
            }
            inner.state = AgentState::Destroyed;
            inner.debugger = None;
            (
                std::mem::take(&mut inner.connections),
                inner.handshake_socket.take(),
            )
        };
        drop(socket);

        if let Some(manager) = self.manager.upgrade() {
            manager.forget(&self.key);
        }
        self.ready.notify_all();
        self.listener_token.cancel();

        for connection in &connections {
            let closed = panic::catch_unwind(AssertUnwindSafe(|| connection.close()));
            if closed.is_err() {
                warn!(key = %self.key, connection_id = connection.id(), "closing connection panicked");
            }
        }

        info!(key = %self.key, connections = connections.len(), "agent destroyed");
        self.context.emit(&LaunchEvent::AgentDestroyed {
            key: self.key.clone(),
        });
        true
    }

    pub(crate) fn context(&self) -> &Arc<LinkContext> {
        &self.context
    }

    pub(crate) fn listener_token(&self) -> &CancellationToken {
        &self.listener_token
    }

    /// Handshake listener is armed and waiting.
    pub(crate) fn mark_listening(&self) {
        let mut inner = self.lock_inner();
        if inner.state == AgentState::Allocated {
            inner.state = AgentState::AwaitingReadiness;
        }
    }

    pub(crate) fn dial_address(&self) -> Result<SocketAddr> {
        let inner = self.lock_inner();
        match (inner.state, inner.callback) {
            (AgentState::Ready, Some(callback)) => Ok(callback),
            (state, _) => Err(not_ready(&self.key, state)),
        }
    }

    pub(crate) fn register_connection(&self, connection: Arc<Connection>) -> Result<()> {
        let peer = connection.peer_addr();
        let id = connection.id();
        {
            let mut inner = self.lock_inner();
            if !inner.state.is_live() {
                return Err(AppError::IllegalState(format!(
                    "agent {} was destroyed while connecting",
                    self.key
                )));
            }
            // `shutdown` flips the flag before it takes this lock, so a
            // connection accepted here is always found by `disconnect`.
            if connection.is_closed() {
                return Err(AppError::IllegalState(format!(
                    "connection {id} closed before it was registered"
                )));
            }
            inner.connections.push(connection);
        }

        self.context.emit(&LaunchEvent::ConnectionInitiated {
            key: self.key.clone(),
            connection_id: id,
            peer,
        });
        Ok(())
    }

    /// Forget a closed connection. The agent is destroyed when its last
    /// connection goes away after the handshake listener has finished.
    pub(crate) fn disconnect(&self, connection: &Connection, remote: bool) {
        // Connections taken by `destroy` are already gone from the live set;
        // their close is still reported, but never escalates.
        let escalate = {
            let mut inner = self.lock_inner();
            let before = inner.connections.len();
            inner.connections.retain(|c| c.id() != connection.id());
            inner.connections.len() < before
                && inner.state != AgentState::Destroyed
                && inner.connections.is_empty()
                && self.listener_token.is_cancelled()
        };

        self.context.emit(&LaunchEvent::ConnectionClosed {
            key: self.key.clone(),
            connection_id: connection.id(),
            remote,
        });

        if escalate {
            debug!(key = %self.key, "last connection gone; destroying agent");
            let removed = self
                .manager
                .upgrade()
                .is_some_and(|manager| manager.destroy_agent(&self.key));
            if !removed {
                self.destroy();
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, AgentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_ready(key: &AuthorizationKey, state: AgentState) -> AppError {
    AppError::IllegalState(format!("agent {key} is not ready (state: {state:?})"))
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("key", &self.key)
            .field("identity", &self.identity)
            .field("expect_debugger", &self.expect_debugger)
            .field("listen_address", &self.listen_address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
