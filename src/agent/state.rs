//! Agent lifecycle state and readiness bookkeeping.
//!
//! The worker's socket handshake and the debugger attach arrive from two
//! unrelated subsystems in either order. [`Readiness`] records each as a
//! fired-once flag and [`AgentState::advance`] turns them into a single
//! `Ready` predicate, so the outcome does not depend on arrival order.

use serde::Serialize;

/// Lifecycle state of an agent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Slot created; handshake listener not yet armed.
    Allocated,
    /// Listener armed; waiting for the required readiness events.
    AwaitingReadiness,
    /// Every required event fired; connections may be opened.
    Ready,
    /// Torn down; terminal.
    Destroyed,
}

impl AgentState {
    /// State after re-evaluating `readiness`.
    ///
    /// Only the two pre-ready states can move to `Ready`; `Ready` and
    /// `Destroyed` are left as they are.
    #[must_use]
    pub fn advance(self, readiness: &Readiness) -> Self {
        match self {
            Self::Allocated | Self::AwaitingReadiness if readiness.is_satisfied() => Self::Ready,
            other => other,
        }
    }

    /// Whether the slot can still change state.
    #[must_use]
    pub fn is_live(self) -> bool {
        self != Self::Destroyed
    }
}

/// Which readiness events have fired for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    expect_debugger: bool,
    handshake: bool,
    debugger: bool,
}

impl Readiness {
    /// Fresh record; `expect_debugger` makes the debugger event mandatory.
    #[must_use]
    pub fn new(expect_debugger: bool) -> Self {
        Self {
            expect_debugger,
            handshake: false,
            debugger: false,
        }
    }

    /// Record the handshake. Returns `false` if it had already fired.
    pub fn fire_handshake(&mut self) -> bool {
        !std::mem::replace(&mut self.handshake, true)
    }

    /// Record the debugger attach. Returns `false` if it had already fired.
    pub fn fire_debugger(&mut self) -> bool {
        !std::mem::replace(&mut self.debugger, true)
    }

    /// Whether the handshake has fired.
    #[must_use]
    pub fn handshake_fired(&self) -> bool {
        self.handshake
    }

    /// Whether the debugger attach has fired.
    #[must_use]
    pub fn debugger_fired(&self) -> bool {
        self.debugger
    }

    /// All events this agent's mode requires have fired.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.handshake && (!self.expect_debugger || self.debugger)
    }
}
