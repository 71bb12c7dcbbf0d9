//! Plugin server lifecycle state machine
//!
//! ```text
//! Unstarted → Starting → Ready ⇄ Degraded → Stopping → Stopped
//!                ↑         │         │
//!                │         └─────────┴──→ Crashed ──(backoff)──┐
//!                └─────────────────────────────────────────────┘
//!                                     Crashed ──(too many)──→ Failed
//! ```
//!
//! [`Lifecycle`] is a pure transition function. Time comes in as explicit
//! instants and backoff goes out as a duration, so the supervision task owns
//! every side effect and tests can drive the machine with a paused clock.

use crate::config::RestartPolicy;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Unstarted,
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Unstarted => "unstarted",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Degraded => "degraded",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Crashed => "crashed",
            ProcessState::Failed => "failed",
        }
    }

    /// The process is up and accepting connections
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Ready | ProcessState::Degraded)
    }

    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the supervision task must do after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Exit was expected; nothing to do
    None,
    /// Start again once `after` has elapsed
    Restart { after: Duration, attempt: u32 },
    /// Restart budget exhausted; the process stays down
    GiveUp { restarts: u32 },
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    policy: RestartPolicy,
    state: ProcessState,
    restarts: u32,
    ready_since: Option<Instant>,
}

impl Lifecycle {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: ProcessState::Unstarted,
            restarts: 0,
            ready_since: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Restarts counted against `max_restarts`
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Last instant the process became ready
    pub fn ready_since(&self) -> Option<Instant> {
        self.ready_since
    }

    pub fn on_spawn(&mut self) {
        if matches!(self.state, ProcessState::Unstarted | ProcessState::Crashed) {
            self.state = ProcessState::Starting;
        }
    }

    pub fn on_ready(&mut self, now: Instant) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Ready;
            self.ready_since = Some(now);
        }
    }

    /// Apply a health probe result. Returns true when the state changed.
    pub fn on_probe(&mut self, healthy: bool) -> bool {
        let next = match (self.state, healthy) {
            (ProcessState::Ready, false) => ProcessState::Degraded,
            (ProcessState::Degraded, true) => ProcessState::Ready,
            _ => return false,
        };
        self.state = next;
        true
    }

    /// The process exited (or a restart attempt failed to come up).
    pub fn on_exit(&mut self, now: Instant) -> RestartDecision {
        match self.state {
            ProcessState::Stopping => {
                self.state = ProcessState::Stopped;
                return RestartDecision::None;
            }
            ProcessState::Starting | ProcessState::Ready | ProcessState::Degraded => {}
            _ => return RestartDecision::None,
        }

        // A process that stayed up long enough earns a fresh budget
        if let Some(since) = self.ready_since.take() {
            if now.saturating_duration_since(since) >= self.policy.stable_after() {
                self.restarts = 0;
            }
        }

        self.restarts += 1;
        if self.restarts > self.policy.max_restarts {
            self.state = ProcessState::Failed;
            RestartDecision::GiveUp {
                restarts: self.restarts - 1,
            }
        } else {
            self.state = ProcessState::Crashed;
            RestartDecision::Restart {
                after: self.policy.backoff_for(self.restarts),
                attempt: self.restarts,
            }
        }
    }

    pub fn on_stop_requested(&mut self) {
        if !self.state.is_terminal() {
            self.state = ProcessState::Stopping;
        }
    }

    pub fn on_stopped(&mut self) {
        if self.state != ProcessState::Failed {
            self.state = ProcessState::Stopped;
        }
    }
}
