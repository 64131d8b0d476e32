//! Retry delay computation and the circuit-breaker state machine.
//!
//! Both are pure: callers pass the current [`Instant`] so transitions are
//! deterministic under test.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Retry policy for outbound calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after attempt `attempt` (0-based) failed.
    ///
    /// `min(max_delay, base_delay * multiplier^attempt)`, no jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// CLOSED -> OPEN after `failure_threshold` consecutive failures,
/// OPEN -> HALF_OPEN once `reset_timeout` has elapsed,
/// HALF_OPEN -> CLOSED on success or back to OPEN on failure.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a call may proceed at `now`, moving OPEN -> HALF_OPEN when due.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = self.opened_at.is_some_and(|opened| {
                    now.saturating_duration_since(opened) >= self.reset_timeout
                });
                if due {
                    self.state = CircuitState::HalfOpen;
                }
                due
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trip = self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= self.failure_threshold;
        if trip {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }
}
