//! Admission control against the remote API
//!
//! This module provides:
//! - [`AdaptiveRateLimiter`] - Token bucket with adaptive fill rate, pauses and a circuit breaker
//! - [`CircuitBreakerConfig`] - Circuit breaker configuration
//! - [`parse_retry_after`] - `Retry-After` header parsing

mod circuit_breaker;
mod rate_limiter;
mod retry_after;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{
    AdaptiveRateLimiter, BoostPolicy, LimiterConfig, LimiterSnapshot, PenaltySchedule,
};
pub use retry_after::{parse_retry_after, QuotaHeaders};
