use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{ExhaustionPolicy, StreamConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Bidirectional websocket.
    #[default]
    PrimarySocket,
    /// Receive-only server-sent events.
    PushStream,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::PrimarySocket => "primary_socket",
            TransportMode::PushStream => "push_stream",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before retry number `attempt` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * attempt`.
    Linear { base: Duration },
    /// Doubles per attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear { base } => base.saturating_mul(attempt.max(1)),
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Retry counter for one transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u32,
    limit: u32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { attempts: 0, limit }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.limit
    }

    /// Takes one retry if any are left and returns its 1-based number.
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn exhaust(&mut self) {
        self.attempts = self.limit;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttempt {
    /// Try the same mode again after `delay`.
    Retry {
        mode: TransportMode,
        attempt: u32,
        delay: Duration,
    },
    /// Budget spent; the selector already switched and the attempt is immediate.
    SwitchMode { to: TransportMode },
    /// Both budgets spent and the policy says stop.
    GiveUp,
}

/// Chooses which transport to try next.
///
/// Each mode owns an independent [`RetryBudget`]; the selector only decides
/// which one is active and what happens when the active one runs out.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    mode: TransportMode,
    socket: RetryBudget,
    push_stream: RetryBudget,
    backoff: Backoff,
    policy: ExhaustionPolicy,
}

impl TransportSelector {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            mode: TransportMode::PrimarySocket,
            socket: RetryBudget::new(config.reconnect_attempts),
            push_stream: RetryBudget::new(config.push_stream_attempts()),
            backoff: config.backoff,
            policy: config.exhaustion_policy,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn budget(&self, mode: TransportMode) -> &RetryBudget {
        match mode {
            TransportMode::PrimarySocket => &self.socket,
            TransportMode::PushStream => &self.push_stream,
        }
    }

    fn budget_mut(&mut self, mode: TransportMode) -> &mut RetryBudget {
        match mode {
            TransportMode::PrimarySocket => &mut self.socket,
            TransportMode::PushStream => &mut self.push_stream,
        }
    }

    pub fn on_open(&mut self) {
        let mode = self.mode;
        self.budget_mut(mode).reset();
    }

    pub fn on_failure(&mut self) -> NextAttempt {
        let mode = self.mode;
        if let Some(attempt) = self.budget_mut(mode).try_consume() {
            return NextAttempt::Retry {
                mode,
                attempt,
                delay: self.backoff.delay(attempt),
            };
        }
        match mode {
            TransportMode::PrimarySocket => self.switch_to(TransportMode::PushStream),
            TransportMode::PushStream => match self.policy {
                ExhaustionPolicy::Cycle => self.switch_to(TransportMode::PrimarySocket),
                ExhaustionPolicy::GiveUp => NextAttempt::GiveUp,
            },
        }
    }

    /// Explicit connect or session activation: primary socket, fresh budgets.
    pub fn reset(&mut self) {
        self.mode = TransportMode::PrimarySocket;
        self.socket.reset();
        self.push_stream.reset();
    }

    /// Explicit disconnect: nothing left to retry in either mode.
    pub fn exhaust(&mut self) {
        self.socket.exhaust();
        self.push_stream.exhaust();
    }

    fn switch_to(&mut self, mode: TransportMode) -> NextAttempt {
        self.mode = mode;
        self.socket.reset();
        self.push_stream.reset();
        NextAttempt::SwitchMode { to: mode }
    }
}
