//! Launch manager: allocates agent slots and accepts worker handshakes.

pub mod accept;
pub mod args;
pub mod events;
pub mod handshake;
pub mod key;

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::agent::{Agent, DebuggerSession};
use crate::config::TetherConfig;
use crate::stream::{ChannelOptions, CloseWatcher};
use crate::{AppError, Result};

use self::accept::{run_accept_loop, PendingListener};
use self::events::{LaunchEvent, LaunchListener, ListenerId, ListenerSet};
use self::key::AuthorizationKey;

/// State shared by the manager, its agents, and their connections.
pub(crate) struct LinkContext {
    pub(crate) runtime: Handle,
    pub(crate) config: TetherConfig,
    pub(crate) watcher: CloseWatcher,
    pub(crate) listeners: ListenerSet,
    next_connection_id: AtomicU64,
}

impl LinkContext {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: &LaunchEvent) {
        self.listeners.dispatch(event);
    }

    pub(crate) fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            runtime: self.runtime.clone(),
            write_timeout: self.config.timeouts.write(),
            read_ahead_initial: self.config.streams.read_ahead_initial_bytes,
            read_ahead_limit: self.config.streams.read_ahead_limit_bytes,
        }
    }
}

pub(crate) struct ManagerInner {
    context: Arc<LinkContext>,
    agents: Mutex<HashMap<AuthorizationKey, Arc<Agent>>>,
    registrations: mpsc::UnboundedSender<PendingListener>,
    shutdown: CancellationToken,
}

impl ManagerInner {
    pub(crate) fn find(&self, key: &AuthorizationKey) -> Option<Arc<Agent>> {
        self.lock_agents().get(key).cloned()
    }

    /// Remove `key` from the registry and destroy it outside the lock.
    pub(crate) fn destroy_agent(&self, key: &AuthorizationKey) -> bool {
        let removed = self.lock_agents().remove(key);
        if let Some(agent) = removed {
            agent.destroy();
            true
        } else {
            false
        }
    }

    /// Drop `key` from the registry without destroying it.
    pub(crate) fn forget(&self, key: &AuthorizationKey) {
        self.lock_agents().remove(key);
    }

    fn lock_agents(&self) -> MutexGuard<'_, HashMap<AuthorizationKey, Arc<Agent>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of every agent slot and the background loops that serve them.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct LaunchManager {
    inner: Arc<ManagerInner>,
}

impl LaunchManager {
    /// Validate `config` and start the accept loop and close watcher on
    /// `runtime`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `config` fails validation.
    pub fn start(config: TetherConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (watcher, _watcher_task) = CloseWatcher::spawn(&runtime, shutdown.child_token());
        let (registrations, queue) = mpsc::unbounded_channel();
        let handshake_timeout = config.timeouts.handshake();

        let context = Arc::new(LinkContext {
            runtime,
            config,
            watcher,
            listeners: ListenerSet::new(),
            next_connection_id: AtomicU64::new(1),
        });

        let inner = Arc::new(ManagerInner {
            context,
            agents: Mutex::new(HashMap::new()),
            registrations,
            shutdown: shutdown.clone(),
        });

        inner.context.runtime.spawn(
            run_accept_loop(queue, Arc::downgrade(&inner), handshake_timeout, shutdown)
                .instrument(info_span!("accept_loop")),
        );

        info!(
            bind_address = %inner.context.config.bind_address,
            reuse_handshake_socket = inner.context.config.reuse_handshake_socket,
            "launch manager started"
        );
        Ok(Self { inner })
    }

    /// Allocate an agent slot for a worker about to be launched.
    ///
    /// The returned agent already has a fresh key and a listening endpoint;
    /// pass its [`launch_args`](Agent::launch_args) to the worker.
    ///
    /// # Errors
    ///
    /// - `AppError::IllegalState` if the manager has been stopped.
    /// - `AppError::Io` if no listening endpoint can be bound.
    pub fn open_for_project(&self, identity: &str, expect_debugger: bool) -> Result<Arc<Agent>> {
        if !self.is_running() {
            return Err(AppError::IllegalState("launch manager is stopped".into()));
        }

        let context = &self.inner.context;
        let listener = TcpListener::bind((context.config.bind_ip()?, 0))
            .map_err(|err| AppError::Io(format!("failed to bind handshake listener: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| AppError::Io(format!("failed to set non-blocking mode: {err}")))?;
        let listen_address = listener
            .local_addr()
            .map_err(|err| AppError::Io(format!("failed to read listener address: {err}")))?;

        let agent = {
            let mut agents = self.inner.lock_agents();
            let mut key = AuthorizationKey::generate();
            while agents.contains_key(&key) {
                key = AuthorizationKey::generate();
            }
            let agent = Arc::new(Agent::new(
                key.clone(),
                identity.to_owned(),
                expect_debugger,
                listen_address,
                self.inner.shutdown.child_token(),
                Arc::clone(context),
                Arc::downgrade(&self.inner),
            ));
            agents.insert(key, Arc::clone(&agent));
            agent
        };

        let pending = PendingListener {
            agent: Arc::downgrade(&agent),
            listener,
        };
        if self.inner.registrations.send(pending).is_err() {
            self.inner.destroy_agent(agent.key());
            return Err(AppError::IllegalState("accept loop is not running".into()));
        }

        info!(key = %agent.key(), identity, expect_debugger, %listen_address, "agent allocated");
        Ok(agent)
    }

    /// Look up an agent by key.
    #[must_use]
    pub fn agent(&self, key: &AuthorizationKey) -> Option<Arc<Agent>> {
        self.inner.find(key)
    }

    /// Every registered agent.
    #[must_use]
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.inner.lock_agents().values().cloned().collect()
    }

    /// Remove and destroy an agent. Returns `false` for an unknown key.
    pub fn destroy_agent(&self, key: &AuthorizationKey) -> bool {
        self.inner.destroy_agent(key)
    }

    /// Pair a debugger session with the agent whose key it reports.
    ///
    /// # Errors
    ///
    /// - `AppError::ProtocolAuth` if the key cannot be read from the session.
    /// - `AppError::NotFound` if no agent holds that key.
    /// - `AppError::IllegalState` from [`Agent::attach_debugger`].
    pub fn attach_debugger(&self, session: Arc<dyn DebuggerSession>) -> Result<Arc<Agent>> {
        let raw = session
            .authorization_key()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                AppError::ProtocolAuth(format!(
                    "debugger session {} did not report an authorization key",
                    session.session_id()
                ))
            })?;
        let key = AuthorizationKey::from_wire(raw);
        let agent = self
            .inner
            .find(&key)
            .ok_or_else(|| AppError::NotFound(format!("no agent with key {key}")))?;
        agent.attach_debugger(session)?;
        Ok(agent)
    }

    /// Destroy whichever agent is paired with `session_id`.
    ///
    /// Returns `false` if no agent had that session attached.
    pub fn debugger_detached(&self, session_id: &str) -> bool {
        let paired = self
            .agents()
            .into_iter()
            .find(|agent| agent.debugger().is_some_and(|s| s.session_id() == session_id));
        let Some(agent) = paired else {
            return false;
        };
        debug!(key = %agent.key(), session_id, "debugger detached; tearing agent down");
        self.inner.destroy_agent(agent.key())
    }

    /// Subscribe to lifecycle events.
    pub fn add_listener(&self, listener: Arc<dyn LaunchListener>) -> ListenerId {
        self.inner.context.listeners.add(listener)
    }

    /// Unsubscribe. Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.context.listeners.remove(id)
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &TetherConfig {
        &self.inner.context.config
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stop both background loops and destroy every agent. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<Arc<Agent>> = self.inner.lock_agents().drain().map(|(_, a)| a).collect();
        if !drained.is_empty() {
            info!(agents = drained.len(), "destroying agents on shutdown");
        }
        for agent in drained {
            agent.destroy();
        }
        info!("launch manager stopped");
    }
}

impl std::fmt::Debug for LaunchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchManager")
            .field("agents", &self.inner.lock_agents().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
