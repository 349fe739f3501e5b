//! Debugger collaborator seam.

/// A debugger session attached to a worker's virtual machine.
///
/// The debugger subsystem owns the real session; the agent link only needs
/// a stable identity and the one lookup that pairs the session with an
/// agent slot.
pub trait DebuggerSession: Send + Sync {
    /// Stable identifier of the session.
    fn session_id(&self) -> &str;

    /// Read the worker's authorization key out of the debuggee.
    ///
    /// Returns `None` (or an empty string) when the key cannot be read, for
    /// example because the worker has not initialised it yet.
    fn authorization_key(&self) -> Option<String>;
}
