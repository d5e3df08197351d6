//! Connection lifecycle state machine.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──opened──▶ Open ──close──▶ Closing
//!                      │  ▲                  │                │
//!                   failed│ reconnect       lost            closed
//!                      ▼  │                  ▼                ▼
//!                     Closed ◀────────────────┴────────────────┘
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether the state machine permits `self -> to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle | Self::Closed, Self::Connecting)
                | (Self::Connecting, Self::Open | Self::Closed)
                | (Self::Open, Self::Closing | Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal connection transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Current state plus change notification.
#[derive(Debug)]
pub struct Connection {
    state: watch::Sender<ConnectionState>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Idle),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// First connection attempt. A no-op (`Ok(false)`) while Connecting or Open.
    ///
    /// # Errors
    /// Returns error from Closing or Closed; those restart via [`Self::reconnect`].
    pub fn connect(&self) -> Result<bool, TransitionError> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => Ok(false),
            ConnectionState::Idle => self.transition(ConnectionState::Connecting).map(|()| true),
            from @ (ConnectionState::Closing | ConnectionState::Closed) => Err(TransitionError {
                from,
                to: ConnectionState::Connecting,
            }),
        }
    }

    /// Restart after a close. Only legal from Closed.
    ///
    /// # Errors
    /// Returns error from any other state.
    pub fn reconnect(&self) -> Result<(), TransitionError> {
        let from = self.state();
        if from != ConnectionState::Closed {
            return Err(TransitionError {
                from,
                to: ConnectionState::Connecting,
            });
        }
        self.transition(ConnectionState::Connecting)
    }

    /// Move to `to` if the state machine allows it.
    ///
    /// # Errors
    /// Returns error on an illegal transition; the state is left unchanged.
    pub fn transition(&self, to: ConnectionState) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                tracing::debug!(from = %state, to = %to, "Connection state change");
                *state = to;
                true
            } else {
                result = Err(TransitionError { from: *state, to });
                false
            }
        });
        result
    }
}
