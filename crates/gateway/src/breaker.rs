//! Per-upstream circuit breaker.
//!
//! An explicit state machine with a single mutator. Half-open is not
//! modelled separately: once the cooldown elapses the breaker reads as
//! closed and the next probe provides the trial.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct Breaker {
    enabled: bool,
    threshold: u32,
    cooldown: Duration,
    consecutive_fails: u32,
    state: BreakerState,
}

impl Breaker {
    pub fn new(enabled: bool, threshold: u32, cooldown: Duration) -> Self {
        Self {
            enabled,
            threshold,
            cooldown,
            consecutive_fails: 0,
            state: BreakerState::Closed,
        }
    }

    /// Feed one probe or proxied-request outcome through the machine.
    pub fn on_outcome(&mut self, outcome: Outcome, now: Instant) {
        if !self.enabled {
            return;
        }
        match outcome {
            Outcome::Success => {
                self.consecutive_fails = 0;
                self.state = BreakerState::Closed;
            }
            Outcome::Failure => {
                self.consecutive_fails += 1;
                if self.consecutive_fails >= self.threshold {
                    self.state = BreakerState::Open {
                        until: now + self.cooldown,
                    };
                }
            }
        }
    }

    /// Whether routing must withhold this upstream right now.
    pub fn is_open(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => false,
            BreakerState::Open { until } => now < until,
        }
    }

    #[allow(dead_code)]
    pub fn consecutive_fails(&self) -> u32 {
        self.consecutive_fails
    }

    /// Introspection label for the admin surface.
    pub fn describe(&self, now: Instant) -> serde_json::Value {
        match self.state {
            BreakerState::Open { until } if now < until => serde_json::json!({
                "state": "open",
                "reopens_in_secs": (until - now).as_secs(),
                "consecutive_fails": self.consecutive_fails,
            }),
            _ => serde_json::json!({
                "state": "closed",
                "consecutive_fails": self.consecutive_fails,
            }),
        }
    }
}
