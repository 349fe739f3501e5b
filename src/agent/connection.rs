//! One control connection to a ready agent's worker.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::launch::key::AuthorizationKey;
use crate::launch::LinkContext;
use crate::stream::{Channel, ChannelInput, ChannelOutput};
use crate::{AppError, Result};

/// A duplex byte channel to one worker, owned by exactly one [`Agent`].
///
/// The socket is absent only during the short dial phase. `closed` only ever
/// goes from `false` to `true`; once it is set the socket and both streams
/// have been released and the owning agent has been told exactly once.
pub struct Connection {
    id: u64,
    agent_key: AuthorizationKey,
    agent: Weak<Agent>,
    channel: Mutex<Option<Arc<Channel>>>,
    closed: AtomicBool,
    context: Arc<LinkContext>,
}

impl Connection {
    /// Dial the worker behind `agent` and register the new connection.
    ///
    /// # Errors
    ///
    /// - `AppError::IllegalState` if the agent is not `Ready` or is destroyed
    ///   before the connection could be registered.
    /// - `AppError::Connect` if the worker cannot be reached within the
    ///   configured connect timeout.
    /// - `AppError::Io` if the socket cannot be wrapped.
    pub fn open(agent: &Arc<Agent>) -> Result<Arc<Self>> {
        let callback = agent.dial_address()?;
        let connection = Self::unbound(agent);

        let timeout = connection.context.config.timeouts.connect();
        let stream = TcpStream::connect_timeout(&callback, timeout).map_err(|err| {
            AppError::Connect(format!(
                "failed to reach worker of agent {} at {callback}: {err}",
                agent.key()
            ))
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(connection_id = connection.id, %err, "could not disable nagle");
        }

        connection.bind(stream)?;
        connection.register(agent)?;
        connection.watch();
        info!(connection_id = connection.id, key = %agent.key(), %callback, "connection opened");
        Ok(connection)
    }

    /// Wrap a socket the worker already opened (its handshake socket).
    pub(crate) fn adopt(agent: &Arc<Agent>, stream: TcpStream) -> Result<Arc<Self>> {
        let connection = Self::unbound(agent);
        connection.bind(stream)?;
        connection.register(agent)?;
        connection.watch();
        info!(connection_id = connection.id, key = %agent.key(), "handshake socket adopted as connection");
        Ok(connection)
    }

    fn unbound(agent: &Arc<Agent>) -> Arc<Self> {
        let context = Arc::clone(agent.context());
        Arc::new(Self {
            id: context.next_connection_id(),
            agent_key: agent.key().clone(),
            agent: Arc::downgrade(agent),
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
            context,
        })
    }

    fn register(self: &Arc<Self>, agent: &Arc<Agent>) -> Result<()> {
        agent.register_connection(Arc::clone(self)).inspect_err(|_| {
            self.abandon();
        })
    }

    /// Bind this connection to an already-connected socket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::IllegalState` if the connection is closed or
    /// already bound, and `AppError::Io` if the socket cannot be wrapped.
    pub fn rebind(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        self.bind(stream)?;
        self.watch();
        Ok(())
    }

    // The watcher is armed separately, after the agent knows about this
    // connection, so a remote close can never overtake registration.
    fn bind(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut slot = self.lock_channel();
        if self.is_closed() {
            return Err(AppError::IllegalState(format!(
                "connection {} is closed",
                self.id
            )));
        }
        if slot.is_some() {
            return Err(AppError::IllegalState(format!(
                "connection {} is already bound",
                self.id
            )));
        }

        let weak = Arc::downgrade(self);
        let channel = Channel::new(
            self.id,
            stream,
            &self.context.channel_options(),
            Some(Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.remote_close();
                }
            })),
        )?;
        *slot = Some(channel);
        Ok(())
    }

    fn watch(&self) {
        if !self.context.config.streams.watch_idle {
            return;
        }
        let Some(channel) = self.lock_channel().clone() else {
            return;
        };
        if !self.context.watcher.watch(channel) {
            warn!(connection_id = self.id, "close watcher is stopped; remote close is only seen by readers");
        }
    }

    /// Connection identifier, unique per launch manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the owning agent.
    #[must_use]
    pub fn agent_key(&self) -> &AuthorizationKey {
        &self.agent_key
    }

    /// Owning agent, while it is still alive.
    #[must_use]
    pub fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.upgrade()
    }

    /// Worker address this connection talks to.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock_channel().as_deref().and_then(Channel::peer_addr)
    }

    /// Blocking input stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::IllegalState` if the connection was never bound or
    /// has been closed.
    pub fn input(&self) -> Result<ChannelInput> {
        self.bound_channel().map(|c| c.split().0)
    }

    /// Blocking output stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::IllegalState` if the connection was never bound or
    /// has been closed.
    pub fn output(&self) -> Result<ChannelOutput> {
        self.bound_channel().map(|c| c.split().1)
    }

    /// Open, bound, and the socket still usable.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.is_closed() && self.lock_channel().as_deref().is_some_and(Channel::is_open)
    }

    /// Whether [`close`](Self::close) or a remote close has happened.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection locally. Idempotent and safe from any thread.
    pub fn close(&self) {
        self.shutdown(false);
    }

    fn remote_close(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, remote: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = self.lock_channel().take();
        if let Some(channel) = channel {
            channel.close();
        }
        debug!(connection_id = self.id, key = %self.agent_key, remote, "connection closed");

        if let Some(agent) = self.agent.upgrade() {
            agent.disconnect(self, remote);
        }
    }

    /// Release the socket without telling the agent; used when registration
    /// failed and the agent never knew about this connection.
    fn abandon(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(channel) = self.lock_channel().take() {
            channel.close();
        }
    }

    fn bound_channel(&self) -> Result<Arc<Channel>> {
        self.lock_channel().clone().ok_or_else(|| {
            AppError::IllegalState(format!("connection {} is unavailable", self.id))
        })
    }

    fn lock_channel(&self) -> MutexGuard<'_, Option<Arc<Channel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("agent_key", &self.agent_key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
