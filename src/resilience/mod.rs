//! Failure containment shared by the server and the client side.
//!
//! - `CircuitBreaker`: stops hammering the database while it is down
//! - `ExponentialBackoff`: spaces out client reconnection attempts

mod backoff;
mod circuit_breaker;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};

/// Current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
