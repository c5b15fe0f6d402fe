//!
//! Connection Monitor (C4): tracks transport reachability so the sync
//! orchestrator knows when it is safe to push, and gives callers a way to
//! block until connectivity is restored.

use std::time::{Duration, Instant};

/// The connection lifecycle. A host notifies transitions via
/// [`ConnectionMonitor::on_online`]/`on_offline`/`on_connected`/`on_failed`;
/// the orchestrator reads [`ConnectionMonitor::state`] before each push.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { since: Instant },
    Reconnecting { attempt: u32, last_error: Option<String> },
    Failed { error: String, next_retry_at: Instant },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Tracks the current connection state and notifies a waiting caller once
/// connectivity is established.
pub struct ConnectionMonitor {
    state: ConnectionState,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// The host's network layer reports it has begun connecting.
    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The host's network layer reports a live connection.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected { since: Instant::now() };
    }

    /// The host's network layer reports the connection dropped and is
    /// retrying.
    pub fn on_reconnecting(&mut self, attempt: u32, last_error: Option<String>) {
        self.state = ConnectionState::Reconnecting { attempt, last_error };
    }

    /// The host's network layer gave up, with a retry scheduled at
    /// `next_retry_at`.
    pub fn on_failed(&mut self, error: impl Into<String>, next_retry_at: Instant) {
        self.state = ConnectionState::Failed {
            error: error.into(),
            next_retry_at,
        };
    }

    /// The host reports the connection was deliberately closed (e.g. the
    /// tab went offline per the browser `navigator.onLine` signal).
    pub fn on_offline(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Blocks the calling thread, polling [`Self::state`] via `poll`, until
    /// connected or `timeout` elapses. `poll` lets the caller pump any
    /// underlying event loop between checks; it is called at least once.
    ///
    /// Returns `true` if connected before the deadline, `false` on timeout.
    pub fn wait_for_connected(
        &self,
        timeout: Duration,
        mut poll: impl FnMut() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !poll() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
