//! Reconnect bookkeeping for the resilient client, kept free of any I/O so
//! every transition can be exercised without a socket.

use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Where the client's logical connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection attempt is in flight.
    Connecting,
    Open,
    /// Waiting `delay` before retry number `attempt`.
    Retrying { attempt: u32, delay: Duration },
    /// Gave up after running out of attempts.
    Exhausted,
    /// Torn down by its owner.
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Closed)
    }
}

/// What the driver should do after the connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    state: ConnectionState,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// The handshake succeeded.
    pub fn on_open(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.attempts = 0;
        self.state = ConnectionState::Open;
    }

    /// A connection attempt failed or an open connection dropped.
    pub fn on_closed(&mut self) -> Transition {
        if self.state.is_terminal() {
            return Transition::GiveUp;
        }

        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Exhausted;
            return Transition::GiveUp;
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        self.state = ConnectionState::Retrying {
            attempt: self.attempts,
            delay,
        };
        Transition::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// The backoff timer fired; the next attempt starts now.
    pub fn on_retry_elapsed(&mut self) {
        if matches!(self.state, ConnectionState::Retrying { .. }) {
            self.state = ConnectionState::Connecting;
        }
    }

    /// The owner no longer wants the connection. Nothing is retried afterwards.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}
