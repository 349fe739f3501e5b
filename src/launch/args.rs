//! Command-line fragment handed to a worker process at launch.
//!
//! The core never spawns the worker itself. Callers append
//! [`LaunchArgs::to_args`] to whatever command they build; the bundled
//! `agent-tether-worker` binary parses exactly these flags.

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::launch::key::AuthorizationKey;
use crate::AppError;

/// Flag carrying the handshake endpoint (`host:port`).
pub const ADDRESS_FLAG: &str = "--agent-address";
/// Flag carrying the authorization key.
pub const KEY_FLAG: &str = "--agent-key";
/// Flag carrying the class-loading policy.
pub const CLASS_LOADING_FLAG: &str = "--class-loading";

/// How the worker loads user code.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassLoadingPolicy {
    /// Load user code through the worker's system loader.
    System,
    /// Load user code through a dedicated, replaceable loader.
    #[default]
    Isolated,
}

impl ClassLoadingPolicy {
    /// Wire spelling used on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Isolated => "isolated",
        }
    }
}

impl Display for ClassLoadingPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassLoadingPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "isolated" => Ok(Self::Isolated),
            other => Err(AppError::Config(format!(
                "unknown class loading policy '{other}'"
            ))),
        }
    }
}

/// Everything a worker needs to call back into its agent slot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Handshake listener address of the agent slot.
    pub address: SocketAddr,
    /// Authorization key the worker must present.
    pub key: AuthorizationKey,
    /// Class-loading policy for user code.
    pub class_loading: ClassLoadingPolicy,
}

impl LaunchArgs {
    /// Render the fragment as separate argv entries.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        vec![
            ADDRESS_FLAG.to_owned(),
            self.address.to_string(),
            KEY_FLAG.to_owned(),
            self.key.to_string(),
            CLASS_LOADING_FLAG.to_owned(),
            self.class_loading.to_string(),
        ]
    }
}

impl Display for LaunchArgs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}
