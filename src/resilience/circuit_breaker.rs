//! Circuit breaker guarding a shared dependency.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use serde::Serialize;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Calls flow through
    Closed = 0,
    /// Calls are rejected without touching the dependency
    Open = 1,
    /// A limited number of probe calls are let through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Successes in half-open before closing again
    pub success_threshold: u32,
    /// Time spent open before probing (ms)
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 10_000,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// ms since epoch
    last_state_change: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_state_change: AtomicI64::new(current_time_ms()),
            config,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> CircuitState {
        self.maybe_half_open();
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match CircuitState::from(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => self.failure_count.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                    tracing::info!(breaker = self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match CircuitState::from(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                    tracing::warn!(
                        breaker = self.name,
                        failures = failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
                tracing::warn!(breaker = self.name, "Circuit breaker reopened during probe");
            }
            CircuitState::Open => {
                self.last_state_change
                    .store(current_time_ms(), Ordering::Release);
            }
        }
    }

    /// Runs `operation` unless the breaker is open, recording the outcome.
    /// Returns `None` when the call was rejected.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Option<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            return None;
        }
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        Some(result)
    }

    fn maybe_half_open(&self) {
        if CircuitState::from(self.state.load(Ordering::Acquire)) != CircuitState::Open {
            return;
        }
        let elapsed = current_time_ms() - self.last_state_change.load(Ordering::Acquire);
        if elapsed < self.config.reset_timeout_ms as i64 {
            return;
        }
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.success_count.store(0, Ordering::Release);
            self.last_state_change
                .store(current_time_ms(), Ordering::Release);
            tracing::info!(breaker = self.name, "Circuit breaker half-open");
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        self.state.store(new_state as u8, Ordering::Release);
        self.last_state_change
            .store(current_time_ms(), Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        if new_state == CircuitState::Closed {
            self.failure_count.store(0, Ordering::Release);
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            last_state_change_ms: self.last_state_change.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_state_change_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: 2,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_then_closed() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(
            CircuitState::from(cb.state.load(Ordering::Acquire)),
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_call_rejected_while_open() {
        let cb = breaker(1, 60_000);
        let first: Option<Result<(), &str>> = cb.call(|| async { Err("boom") }).await;
        assert!(matches!(first, Some(Err(_))));

        let second: Option<Result<(), &str>> = cb.call(|| async { Ok(()) }).await;
        assert!(second.is_none());
    }
}
