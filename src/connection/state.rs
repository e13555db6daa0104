/// Connection state machine
///
/// `Connecting -> Open -> Closing -> Closed`. `Connecting` and `Open` may also
/// jump straight to `Closed` on IO failure. The state cell is shared between the
/// connection task and its reactor (same thread) so the reactor can scan for
/// idle connections without messaging every connection on every tick.

use serde::Serialize;
use std::cell::Cell;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::RpcError;

/// Which side of the call protocol this connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sends requests, reads responses
    Client,
    /// Reads requests, sends responses
    Server,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Client => f.write_str("client"),
            Direction::Server => f.write_str("server"),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Socket being established / handshake in progress
    Connecting,
    /// Frames flow both ways
    Open,
    /// Draining pending calls, no new work accepted
    Closing,
    /// Socket released, pending calls failed
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }

    /// Closing or closed connections ignore new work
    pub fn is_terminating(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// State shared between a connection task and its reactor
#[derive(Debug)]
pub struct ConnectionShared {
    state: Cell<ConnectionState>,
    last_activity: Cell<Instant>,
    outstanding: Cell<usize>,
}

impl ConnectionShared {
    pub fn new() -> Self {
        Self {
            state: Cell::new(ConnectionState::Connecting),
            last_activity: Cell::new(Instant::now()),
            outstanding: Cell::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Move to `next`.
    ///
    /// Illegal transitions assert in debug builds and are reported as
    /// `IllegalState` otherwise, leaving the state untouched.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, RpcError> {
        let current = self.state.get();
        if !current.can_transition_to(next) {
            debug_assert!(false, "illegal connection transition {:?} -> {:?}", current, next);
            return Err(RpcError::illegal_state(format!(
                "illegal connection transition {:?} -> {:?}",
                current, next
            )));
        }
        self.state.set(next);
        Ok(current)
    }

    /// Record traffic
    pub fn touch(&self) {
        self.last_activity.set(Instant::now());
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity.get())
    }

    /// Pending outbound plus in-flight inbound calls
    pub fn set_outstanding(&self, count: usize) {
        self.outstanding.set(count);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Open, nothing outstanding and silent for at least `keepalive`
    pub fn is_idle(&self, now: Instant, keepalive: Duration) -> bool {
        self.state.get() == ConnectionState::Open
            && self.outstanding.get() == 0
            && self.idle_for(now) >= keepalive
    }
}

impl Default for ConnectionShared {
    fn default() -> Self {
        Self::new()
    }
}
