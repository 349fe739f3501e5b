#![forbid(unsafe_code)]

//! Host-side link to out-of-process code-execution workers.
//!
//! A [`LaunchManager`] allocates an [`Agent`] slot with a fresh
//! authorization key before the worker starts, accepts the worker's callback
//! handshake, pairs it with an optional debugger attach, and then hands out
//! [`Connection`]s whose streams are plain blocking `Read`/`Write`.

pub mod agent;
pub mod config;
pub mod errors;
pub mod launch;
pub mod stream;

pub use agent::{Agent, AgentState, Connection, DebuggerSession};
pub use config::TetherConfig;
pub use errors::{AppError, Result};
pub use launch::args::{ClassLoadingPolicy, LaunchArgs};
pub use launch::events::{LaunchEvent, LaunchListener, ListenerId};
pub use launch::key::AuthorizationKey;
pub use launch::LaunchManager;
