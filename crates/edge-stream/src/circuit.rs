//! Per-destination circuit breaker (§4.6), grounded on the `CircuitBreaker`
//! class paired with `ZeroBusClient` in the original implementation:
//! closed → open after `failure_threshold` consecutive failures, open →
//! half-open after `cooldown` has elapsed, half-open → closed after
//! `half_open_required_successes` consecutive probe successes, half-open →
//! open on any probe failure.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use edge_model::{CircuitBreakerState, CircuitState};

/// Tunables for one destination's circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing probes.
    pub cooldown: Duration,
    /// Concurrent probes permitted while half-open.
    pub half_open_max_probes: u32,
    /// Consecutive probe successes required to close the circuit.
    pub half_open_required_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 3,
            half_open_required_successes: 3,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Whether a call may proceed, and what the caller must do with the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed; the circuit is closed.
    Allowed,
    /// Proceed as a bounded probe; report the outcome via `record_*`.
    Probe,
    /// Do not attempt the call; the circuit is open.
    Rejected,
}

/// Thread-safe circuit breaker for one destination.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker with `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, state: Mutex::new(CircuitBreakerState::default()) }
    }

    /// Current externally-visible state, for diagnostics (§4.7).
    pub fn snapshot(&self) -> CircuitBreakerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decides whether a send attempt may proceed, transitioning open → half
    /// open if the cooldown has elapsed.
    pub fn admit(&self) -> Admission {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = state.opened_at_ms.map(|opened| now_ms().saturating_sub(opened)).unwrap_or(0);
                if elapsed >= self.config.cooldown.as_millis() as i64 {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_probes_in_flight = 1;
                    state.half_open_successes = 0;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_probes_in_flight < self.config.half_open_max_probes {
                    state.half_open_probes_in_flight += 1;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Records a successful send. In `HalfOpen`, closes the circuit once
    /// enough consecutive probes have succeeded.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.half_open_probes_in_flight = state.half_open_probes_in_flight.saturating_sub(1);
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_required_successes {
                    *state = CircuitBreakerState::default();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed send. Opens the circuit from `Closed` once
    /// `failure_threshold` consecutive failures accumulate, or immediately
    /// from any failed `HalfOpen` probe.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at_ms = Some(now_ms());
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at_ms = Some(now_ms());
                state.half_open_probes_in_flight = 0;
                state.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(0),
            half_open_max_probes: 1,
            half_open_required_successes: 2,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker();
        assert_eq!(cb.admit(), Admission::Allowed);
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Open);
    }

    #[test]
    fn half_open_closes_after_required_successes() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.admit(), Admission::Probe);
        cb.record_success();
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
        assert_eq!(cb.admit(), Admission::Probe);
        cb.record_success();
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.admit(), Admission::Probe);
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Open);
    }

    #[test]
    fn rejects_while_open_and_cooldown_not_elapsed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(300),
            half_open_max_probes: 1,
            half_open_required_successes: 1,
        });
        cb.record_failure();
        assert_eq!(cb.admit(), Admission::Rejected);
    }
}
