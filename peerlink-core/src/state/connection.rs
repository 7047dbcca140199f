//! Lifecycle phases of one peer session.
//!
//! `ConnectionState` is a plain value with validated transitions that
//! return `Result` instead of panicking. The async driver lives in
//! [`machine`](super::machine).

use std::fmt;

use crate::error::PeerError;

// ── ConnectionState ──────────────────────────────────────────────

/// ```text
///  Disconnected ──► Connecting ──► Waiting ──► Connected
///       ▲               │             │            │
///       └───────────────┴─────────────┴────────────┘
///
///  any ──dispose──► Disposed   (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport session. Initial state.
    #[default]
    Disconnected,

    /// Transport setup requested, waiting for it to open.
    Connecting,

    /// Transport open and sub-channels bound, media path not yet up.
    Waiting,

    /// Fully established.
    Connected,

    /// Terminal. No further transitions.
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Waiting => "waiting",
            Self::Connected => "connected",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    /// A transport session exists (or is being set up).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Waiting | Self::Connected)
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_disposed(self) -> bool {
        self == Self::Disposed
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            Self::Disposed => Err(PeerError::InvalidState("cannot connect: disposed")),
            _ => Err(PeerError::InvalidState("cannot connect: already connecting or connected")),
        }
    }

    /// Transport opened. Valid from: `Connecting`.
    pub fn open(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Connecting => {
                *self = Self::Waiting;
                Ok(())
            }
            _ => Err(PeerError::InvalidState("cannot open: not connecting")),
        }
    }

    /// Media path up. Valid from: `Waiting`, `Connecting`.
    pub fn establish(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Waiting | Self::Connecting => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(PeerError::InvalidState("cannot establish: not waiting")),
        }
    }

    /// Back to `Disconnected`. Returns `false` when nothing changed
    /// (already disconnected, or disposed).
    pub fn finish_disconnect(&mut self) -> bool {
        if self.is_active() {
            *self = Self::Disconnected;
            true
        } else {
            false
        }
    }

    /// Enter the terminal state. Returns `false` if already there.
    pub fn dispose(&mut self) -> bool {
        if self.is_disposed() {
            false
        } else {
            *self = Self::Disposed;
            true
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = ConnectionState::default();
        state.begin_connect().unwrap();
        assert_eq!(state, ConnectionState::Connecting);
        state.open().unwrap();
        assert_eq!(state, ConnectionState::Waiting);
        state.establish().unwrap();
        assert!(state.is_connected());
        assert!(state.finish_disconnect());
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn connect_twice_is_invalid() {
        let mut state = ConnectionState::Connected;
        assert!(matches!(state.begin_connect(), Err(PeerError::InvalidState(_))));
        let mut state = ConnectionState::Connecting;
        assert!(state.begin_connect().is_err());
    }

    #[test]
    fn connected_never_reached_from_disconnected() {
        let mut state = ConnectionState::Disconnected;
        assert!(state.establish().is_err());
        assert!(state.open().is_err());
    }

    #[test]
    fn disposed_is_terminal() {
        let mut state = ConnectionState::Waiting;
        assert!(state.dispose());
        assert!(!state.dispose());
        assert!(state.begin_connect().is_err());
        assert!(!state.finish_disconnect());
        assert!(state.establish().is_err());
        assert_eq!(state, ConnectionState::Disposed);
    }

    #[test]
    fn disconnect_when_idle_is_a_no_op() {
        let mut state = ConnectionState::Disconnected;
        assert!(!state.finish_disconnect());
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionState::Waiting.to_string(), "waiting");
        assert_eq!(ConnectionState::Disposed.to_string(), "disposed");
    }
}
