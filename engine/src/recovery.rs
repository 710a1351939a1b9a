//! Retry, circuit breaking and graceful degradation.
//!
//! These are the shared failure-handling primitives used by the job store
//! (transient I/O), the transfer engines (restart backoff) and the monitor
//! (non-critical health checks).

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", deserialize_with = "millis::deserialize")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", deserialize_with = "millis::deserialize")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Only errors for which `is_transient` returns true are retried. The
/// operation receives the 1-based attempt number.
pub fn retry_with_backoff<T, E, C, F>(
    component: &str,
    policy: &RetryPolicy,
    is_transient: C,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    C: Fn(&E) -> bool,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_transient(&err) {
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    tracing::error!(component, attempt, error = %err, "retries exhausted");
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    component,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Run a non-critical operation, returning `fallback` instead of failing.
pub fn degrade<T, E, F>(component: &str, fallback: T, operation: F) -> T
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    match operation() {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(component, error = %err, "non-critical operation failed, using fallback");
            fallback
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

/// Result of a call routed through a `CircuitBreaker`.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it
    Open,
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Stops calling a persistently failing dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask permission to make a call. Moves OPEN to HALF_OPEN once the
    /// cooldown has elapsed and admits exactly one trial.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if cooled {
                    tracing::info!(breaker = %self.name, "circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `operation` if the breaker allows it and record the outcome.
    pub fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }
        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }
}

/// Serde helper for `Duration` fields configured as milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_recovers_from_transient_errors() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            "test",
            &fast_policy(5),
            |e: &String| e == "busy",
            |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 3 {
                    Err("busy".to_string())
                } else {
                    Ok(attempt)
                }
            },
        );
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_with_backoff(
            "test",
            &fast_policy(5),
            |e: &String| e == "busy",
            |_| {
                calls.set(calls.get() + 1);
                Err("denied".to_string())
            },
        );
        assert_eq!(result, Err("denied".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_with_backoff(
            "test",
            &fast_policy(4),
            |_| true,
            |_| {
                calls.set(calls.get() + 1);
                Err("busy".to_string())
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_breaker_trips_and_recovers() {
        let breaker = CircuitBreaker::new("disk", 2, Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker.call(|| Err::<(), _>("boom"));
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.call(|| Err::<(), _>("boom"));
        assert_eq!(breaker.state(), CircuitState::Open);

        // Short-circuits while open
        let ran = Cell::new(false);
        let result = breaker.call(|| {
            ran.set(true);
            Ok::<(), &str>(())
        });
        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!ran.get());

        thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire(), "trial call allowed after cooldown");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.try_acquire(), "only one trial at a time");
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_reopens_when_trial_fails() {
        let breaker = CircuitBreaker::new("disk", 1, Duration::from_millis(10));
        let _ = breaker.call(|| Err::<(), _>("boom"));
        assert_eq!(breaker.state(), CircuitState::Open);

        thread::sleep(Duration::from_millis(20));
        let result = breaker.call(|| Err::<(), _>("still broken"));
        assert!(matches!(result, Err(BreakerError::Inner("still broken"))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_degrade_returns_fallback() {
        let value = degrade("health", 7, || Err::<i32, _>("unavailable"));
        assert_eq!(value, 7);
        let value = degrade("health", 7, || Ok::<i32, String>(42));
        assert_eq!(value, 42);
    }
}
