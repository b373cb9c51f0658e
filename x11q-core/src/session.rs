//! Session state machine. Pure transitions; the async controller feeds it
//! events and publishes the resulting state.

use std::fmt;

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailReason {
    InvalidFormat,
    UnknownWord,
    RendezvousTimeout,
    RendezvousNotFound,
    ConnectTimeout,
    AuthFailed,
    ProtocolViolation,
    IdentityStorage,
    /// The serving side is already paired with someone else.
    Rejected,
    /// Peer runs a different service or authentication mode.
    Unsupported,
    /// Connection lost after it was ready.
    Disconnected,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailReason::InvalidFormat => "code is not of the form N-word-word",
            FailReason::UnknownWord => "code contains a word outside the dictionary",
            FailReason::RendezvousTimeout => "rendezvous directory did not answer in time",
            FailReason::RendezvousNotFound => "no peer published under this code",
            FailReason::ConnectTimeout => "could not reach the peer on any path",
            FailReason::AuthFailed => "authentication failed (wrong code?)",
            FailReason::ProtocolViolation => "peer violated the protocol",
            FailReason::IdentityStorage => "node identity store is unreadable",
            FailReason::Rejected => "peer is already in a session",
            FailReason::Unsupported => "peer does not offer this service or mode",
            FailReason::Disconnected => "connection lost",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connecting,
    Authenticating,
    Ready,
    Relaying,
    Closed,
    Failed(FailReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start publishing (serving) or looking up (joining).
    Discover,
    /// Target already known: skip discovery.
    Dial,
    /// A candidate peer was found or an inbound attempt arrived.
    Resolved,
    /// Secure channel up; `auth_required` is false in node-id mode.
    Secured { auth_required: bool },
    Authenticated,
    /// A serving-side attempt failed; go back to waiting for the next one.
    /// Only `AuthFailed` (a wrong confirmation) counts against the code.
    AttemptAbandoned(FailReason),
    RelayStarted,
    Closed,
    /// Operator cancellation, from any live state.
    Cancel,
    Fail(FailReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event {event:?} is not valid in state {from:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub event: SessionEvent,
}

/// Default number of wrong-code attempts a serving session tolerates.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    failed_attempts: u32,
    max_failed_attempts: u32,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::with_max_failed_attempts(DEFAULT_MAX_FAILED_ATTEMPTS)
    }

    pub fn with_max_failed_attempts(max: u32) -> Self {
        Self {
            state: SessionState::Idle,
            failed_attempts: 0,
            max_failed_attempts: max.max(1),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn step(&mut self, event: SessionEvent) -> Result<SessionState, TransitionError> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self.state, event) {
            (S::Closed | S::Failed(_), _) => None,
            (_, E::Fail(reason)) => Some(S::Failed(reason)),
            (_, E::Cancel) => Some(S::Closed),
            (S::Idle, E::Discover) => Some(S::Discovering),
            (S::Idle, E::Dial) => Some(S::Connecting),
            (S::Discovering, E::Resolved) => Some(S::Connecting),
            (S::Connecting, E::Secured { auth_required: true }) => Some(S::Authenticating),
            (S::Connecting, E::Secured { auth_required: false }) => Some(S::Ready),
            (S::Authenticating, E::Authenticated) => Some(S::Ready),
            // Only wrong guesses burn the code; anything else just frees the
            // slot for the next attempt.
            (S::Connecting | S::Authenticating, E::AttemptAbandoned(FailReason::AuthFailed)) => {
                self.failed_attempts += 1;
                if self.failed_attempts >= self.max_failed_attempts {
                    Some(S::Failed(FailReason::AuthFailed))
                } else {
                    Some(S::Discovering)
                }
            }
            (S::Connecting | S::Authenticating, E::AttemptAbandoned(_)) => Some(S::Discovering),
            (S::Ready, E::RelayStarted) => Some(S::Relaying),
            (S::Ready | S::Relaying, E::Closed) => Some(S::Closed),
            _ => None,
        };
        match next {
            Some(state) => {
                self.state = state;
                Ok(state)
            }
            None => Err(TransitionError {
                from: self.state,
                event,
            }),
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}
