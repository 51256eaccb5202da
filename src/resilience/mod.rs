//! Reliability primitives wrapped around every backend call

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use retry::{RetryPolicy, with_retry};
