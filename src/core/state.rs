//! Connection lifecycle state machine.
//!
//! Every pooled transport owns one [`StateMachine`]. Transitions are
//! validated against the lifecycle graph and each one emits a
//! `ConnectionStateChanged` event.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::events::{Event, EventBus};

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected to the target.
    #[default]
    Disconnected,

    /// Attempting to connect.
    Connecting,

    /// Connected and operational.
    Connected,

    /// Recovering after a wire error.
    Reconnecting,

    /// Connect or reconnect gave up.
    Failed,
}

impl ConnectionState {
    /// Check if currently connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check whether a transition to `to` is legal.
    ///
    /// Self-transitions are tolerated as no-ops; they are filtered out before
    /// this check.
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
                | (Failed, Disconnected)
        )
    }

    /// Name as used in event payloads.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exponential backoff policy for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of reconnect attempts before giving up.
    pub attempts: u32,

    /// Delay before the first attempt.
    pub initial_delay: Duration,

    /// Multiplier applied per attempt.
    pub multiplier: f64,

    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Iterator over the backoff delays, one per attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let initial = self.initial_delay;
        let multiplier = self.multiplier;
        let max = self.max_delay;
        (0..self.attempts).map(move |n| {
            let scaled = initial.as_secs_f64() * multiplier.powi(n as i32);
            Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
        })
    }
}

/// Validated, event-emitting holder of a transport's connection state.
#[derive(Clone)]
pub struct StateMachine {
    state: Arc<Mutex<ConnectionState>>,
    source: String,
    bus: Arc<EventBus>,
}

impl StateMachine {
    /// Create a machine in the `Disconnected` state.
    pub fn new(source: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            source: source.into(),
            bus,
        }
    }

    /// Current state (copy).
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// The source id used for emitted events.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Transition to `to`, validating legality and emitting an event.
    ///
    /// A self-transition is a no-op. An illegal transition leaves the state
    /// untouched and fails with `Internal`.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState> {
        let old = {
            let mut guard = self.state.lock().expect("state lock poisoned");
            let old = *guard;
            if old == to {
                return Ok(old);
            }
            if !old.can_transition(to) {
                return Err(GatewayError::internal(format!(
                    "illegal connection state transition {old} -> {to} ({})",
                    self.source
                )));
            }
            *guard = to;
            old
        };
        tracing::debug!(source = %self.source, from = %old, to = %to, "connection state changed");
        self.bus.emit(Event::state_changed(&self.source, old, to));
        Ok(old)
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("source", &self.source)
            .field("state", &self.state())
            .finish()
    }
}
