//! Lifecycle state machine of the recognition session.

use std::fmt;

/// Lifecycle of the engine wrapped by the controller.
///
/// `Terminated` is final for a session: the next request builds a new one starting from
/// `Initializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Recognizing,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized | Terminated, Initializing)
                | (Initializing, Ready)
                | (Ready, Recognizing)
                | (Recognizing, Ready)
                // Failed initialization leaves no engine behind.
                | (Initializing, Uninitialized)
                // Teardown is allowed from anywhere.
                | (_, Terminated)
        )
    }

    /// A request arriving in this state must wait its turn.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::Recognizing)
    }

    /// Whether a request needs a fresh engine first.
    pub fn needs_engine(self) -> bool {
        matches!(self, SessionState::Uninitialized | SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Recognizing => "recognizing",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
