//! Circuit breaker guarding the function-cache sync loop.
//!
//! Three consecutive failures open the circuit for five minutes; the first
//! call after the window closes is a half-open probe.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

use crate::state::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until_ms: i64 },
    HalfOpen,
}

pub struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Default policy: 3 failures, 5 minute hold.
    pub fn new() -> Self {
        Self::with_policy(3, Duration::minutes(5))
    }

    pub fn with_policy(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold,
            open_for,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed now. Transitions Open → HalfOpen once the
    /// hold expires; the probe call must then report success or failure.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open { until_ms } => {
                if now.timestamp_millis() >= until_ms {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self, clock: &dyn Clock) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let failures = match *state {
            BreakerState::Closed { failures } => failures + 1,
            // A failed half-open probe reopens immediately.
            BreakerState::HalfOpen => self.threshold,
            BreakerState::Open { .. } => return,
        };
        if failures >= self.threshold {
            let until = clock.now() + self.open_for;
            *state = BreakerState::Open {
                until_ms: until.timestamp_millis(),
            };
        } else {
            *state = BreakerState::Closed { failures };
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
