//! Per-launch authorization keys.

use std::fmt::{Display, Formatter};

use serde::Serialize;
use uuid::Uuid;

/// Shared secret correlating a worker process to its agent slot.
///
/// Generated from a random v4 UUID and rendered as 32 lowercase hex digits,
/// so it is safe to pass through command lines and the handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AuthorizationKey(String);

impl AuthorizationKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap a key received from the wire or from a debuggee.
    #[must_use]
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AuthorizationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AuthorizationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
