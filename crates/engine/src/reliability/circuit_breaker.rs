//! Circuit breaker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - permits are handed out by the token bucket
    Closed,

    /// Throttle threshold exceeded - every acquire blocks until cooldown ends
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Circuit breaker configuration
///
/// The breaker trips when the limiter has seen `threshold` consecutive
/// throttling responses, and hard-blocks all acquires for `cooldown`.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  consecutive throttles >= threshold  ┌─────────┐
/// │ Closed  │ ───────────────────────────────────► │  Open   │
/// └─────────┘                                      └─────────┘
///      ▲                cooldown elapsed                │
///      └────────────────────────────────────────────────┘
/// ```
///
/// Leaving `Open` does not clear the throttle streak unless
/// `reset_on_cooldown` is set; by default only an observed success does.
/// A streak that is still at or above the threshold re-trips the breaker on
/// the next throttle.
///
/// # Example
///
/// ```
/// use bulkmut_engine::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_threshold(10)
///     .with_cooldown(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive throttles required to open the circuit
    pub threshold: u32,

    /// How long the circuit stays open
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,

    /// Clear the throttle streak when the cooldown expires
    pub reset_on_cooldown: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            cooldown: Duration::from_secs(1),
            reset_on_cooldown: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-throttle threshold
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Set the open-circuit cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Clear the throttle streak when the cooldown expires
    pub fn with_reset_on_cooldown(mut self, reset: bool) -> Self {
        self.reset_on_cooldown = reset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.threshold, 20);
        assert_eq!(config.cooldown, Duration::from_secs(1));
        assert!(!config.reset_on_cooldown);
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_threshold(0)
            .with_cooldown(Duration::from_secs(60))
            .with_reset_on_cooldown(true);

        assert_eq!(config.threshold, 1);
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert!(config.reset_on_cooldown);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
