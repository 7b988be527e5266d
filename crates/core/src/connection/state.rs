use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{MocapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle input driving [`ConnectionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    /// A session was started and the connect loop is about to run.
    Start,
    /// The backend connected and negotiation finished.
    Established,
    /// The session was stopped or gave up.
    Stop,
}

impl ConnectionState {
    pub(crate) fn apply(self, event: ConnectionEvent) -> Result<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Disconnected, Start) => Ok(Connecting),
            (Connecting, Established) => Ok(Connected),
            (_, Stop) => Ok(Disconnected),
            (state, Start) => Err(MocapError::InvalidState {
                state,
                action: "start",
            }),
            (state, Established) => Err(MocapError::InvalidState {
                state,
                action: "establish",
            }),
        }
    }
}

/// Thread-safe read accessor over the current connection state.
///
/// Cloned handles observe the same state. Only the connection manager and its
/// worker drive transitions. Every `Start` opens a new session number, so a
/// handle can tell whether the connection it sees is still the one it was
/// created for.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    inner: Arc<Mutex<StatusInner>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct StatusInner {
    state: ConnectionState,
    session: u64,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of the latest session; `0` before the first start.
    pub fn session(&self) -> u64 {
        self.snapshot().session
    }

    /// Whether `session` is the latest session and it is connected.
    pub fn is_session_connected(&self, session: u64) -> bool {
        let inner = self.snapshot();
        inner.session == session && inner.state == ConnectionState::Connected
    }

    /// Applies `event`, returning the previous state on success.
    pub(crate) fn transition(&self, event: ConnectionEvent) -> Result<ConnectionState> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = inner.state;
        inner.state = previous.apply(event)?;
        if event == ConnectionEvent::Start {
            inner.session = inner.session.wrapping_add(1);
        }
        Ok(previous)
    }

    fn snapshot(&self) -> StatusInner {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
