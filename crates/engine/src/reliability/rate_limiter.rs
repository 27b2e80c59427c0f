//! Adaptive token-bucket rate limiter
//!
//! One limiter is shared by every worker talking to the same remote account.
//! All state lives behind a single mutex; blocked acquirers park on a
//! [`Notify`] and are woken whenever a pause, penalty or rate change lands.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use super::retry_after::QuotaHeaders;
use crate::config::duration_millis;
use crate::error::ConfigError;

/// Refill ticks that adjust the rate happen at most this often
const ADJUST_INTERVAL: Duration = Duration::from_secs(1);

/// Throttles younger than this hold the rate steady
const HOLD_WINDOW: Duration = Duration::from_millis(200);

/// Throttles older than this unlock fast recovery
const FAST_RECOVERY_AFTER: Duration = Duration::from_secs(1);

const MODEST_RECOVERY_CAP: f64 = 1.4;
const FAST_RECOVERY_CAP: f64 = 2.2;

/// Upper bound accepted for `max_pause`
const PAUSE_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Graduated penalty applied on throttling responses
///
/// The multiplier used is `max(requested_factor, floor)` where the floor
/// depends on how long the current throttle streak is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PenaltySchedule {
    /// Streak length (inclusive) that still gets the mild floor
    pub mild_until: u32,
    /// Streak length (inclusive) that still gets the moderate floor
    pub moderate_until: u32,
    pub mild_floor: f64,
    pub moderate_floor: f64,
    pub severe_floor: f64,
    /// Factor workers ask for; the floors above dominate it
    pub requested_factor: f64,
}

impl Default for PenaltySchedule {
    fn default() -> Self {
        Self {
            mild_until: 5,
            moderate_until: 10,
            mild_floor: 0.9,
            moderate_floor: 0.8,
            severe_floor: 0.7,
            requested_factor: 0.1,
        }
    }
}

impl PenaltySchedule {
    /// Multiplier floor for a given streak length
    pub fn floor_for(&self, consecutive_throttles: u32) -> f64 {
        if consecutive_throttles <= self.mild_until {
            self.mild_floor
        } else if consecutive_throttles <= self.moderate_until {
            self.moderate_floor
        } else {
            self.severe_floor
        }
    }
}

/// Multiplicative boost applied while the bucket runs throttle-free
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoostPolicy {
    pub max_boost: f64,
    pub step: f64,
    pub decay: f64,
    /// Throttle-free window required before the boost grows
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for BoostPolicy {
    fn default() -> Self {
        Self {
            max_boost: 1.6,
            step: 0.1,
            decay: 0.05,
            window: Duration::from_secs(5),
        }
    }
}

/// Rate limiter configuration
///
/// # Example
///
/// ```
/// use bulkmut_engine::LimiterConfig;
///
/// let config = LimiterConfig::default()
///     .with_init_rate(10.0)
///     .with_bounds(2.0, 50.0)
///     .with_ramp_step(5.0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Starting fill rate (ops/sec), clamped into `[min_rate, max_rate]`
    pub init_rate: f64,
    pub max_rate: f64,
    pub min_rate: f64,
    /// Additive increase per adjustment tick while throttle-free
    pub ramp_step: f64,
    pub penalty: PenaltySchedule,
    pub boost: BoostPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// `X-RateLimit-Remaining` below this triggers a preventive pause
    pub low_quota_threshold: u32,
    #[serde(with = "duration_millis")]
    pub low_quota_pause: Duration,
    /// Shortest pause applied by `pause_for`
    #[serde(with = "duration_millis")]
    pub min_pause: Duration,
    /// Longest pause applied by `pause_for`; larger server hints are capped
    #[serde(with = "duration_millis")]
    pub max_pause: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            init_rate: 20.0,
            max_rate: 100.0,
            min_rate: 5.0,
            ramp_step: 10.0,
            penalty: PenaltySchedule::default(),
            boost: BoostPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            low_quota_threshold: 5,
            low_quota_pause: Duration::from_secs(10),
            min_pause: Duration::from_secs(1),
            max_pause: Duration::from_secs(300),
        }
    }
}

impl LimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial rate
    pub fn with_init_rate(mut self, rate: f64) -> Self {
        self.init_rate = rate;
        self
    }

    /// Set the rate bounds
    pub fn with_bounds(mut self, min_rate: f64, max_rate: f64) -> Self {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self
    }

    /// Set the additive ramp step
    pub fn with_ramp_step(mut self, step: f64) -> Self {
        self.ramp_step = step;
        self
    }

    /// Set the penalty schedule
    pub fn with_penalty(mut self, penalty: PenaltySchedule) -> Self {
        self.penalty = penalty;
        self
    }

    /// Set the boost policy
    pub fn with_boost(mut self, boost: BoostPolicy) -> Self {
        self.boost = boost;
        self
    }

    /// Set the circuit breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set the low-quota pause behavior
    pub fn with_low_quota(mut self, threshold: u32, pause: Duration) -> Self {
        self.low_quota_threshold = threshold;
        self.low_quota_pause = pause;
        self
    }

    /// Set the bounds applied to every pause window
    pub fn with_pause_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_pause = min;
        self.max_pause = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_rate > 0.0 && self.min_rate.is_finite()) {
            return Err(ConfigError::Invalid("min_rate must be positive".into()));
        }
        if !(self.max_rate >= self.min_rate && self.max_rate.is_finite()) {
            return Err(ConfigError::Invalid(
                "max_rate must be finite and at least min_rate".into(),
            ));
        }
        if self.ramp_step < 0.0 {
            return Err(ConfigError::Invalid("ramp_step must not be negative".into()));
        }
        let p = &self.penalty;
        if p.mild_until > p.moderate_until {
            return Err(ConfigError::Invalid(
                "penalty.mild_until must not exceed penalty.moderate_until".into(),
            ));
        }
        let floors = [p.mild_floor, p.moderate_floor, p.severe_floor];
        if floors.iter().any(|f| !(*f > 0.0 && *f <= 1.0)) {
            return Err(ConfigError::Invalid("penalty floors must be in (0, 1]".into()));
        }
        if !(p.mild_floor >= p.moderate_floor && p.moderate_floor >= p.severe_floor) {
            return Err(ConfigError::Invalid(
                "penalty floors must not increase with streak length".into(),
            ));
        }
        if self.boost.max_boost < 1.0 {
            return Err(ConfigError::Invalid("boost.max_boost must be at least 1.0".into()));
        }
        if self.min_pause > self.max_pause {
            return Err(ConfigError::Invalid("min_pause must not exceed max_pause".into()));
        }
        if self.max_pause > PAUSE_LIMIT {
            return Err(ConfigError::Invalid("max_pause must be at most one day".into()));
        }
        Ok(())
    }

    fn clamp_rate(&self, rate: f64, ceiling: f64) -> f64 {
        if rate.is_nan() {
            return self.min_rate;
        }
        rate.clamp(self.min_rate, ceiling.max(self.min_rate))
    }

    fn clamp_pause(&self, pause: Duration) -> Duration {
        pause.min(self.max_pause).max(self.min_pause.min(self.max_pause))
    }
}

/// Point-in-time view of the limiter, for progress reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterSnapshot {
    pub current_rate: f64,
    pub max_rate: f64,
    pub capacity: u32,
    pub available_tokens: u32,
    pub consecutive_throttles: u32,
    pub boost: f64,
    pub circuit: CircuitState,
}

/// Mutable limiter state; every field is guarded by the limiter mutex
#[derive(Debug)]
struct RateState {
    current_rate: f64,
    /// Effective ceiling; starts at `max_rate` and can be lowered by quota headers
    max_rate: f64,
    capacity: u32,
    tokens: f64,
    last_refill: Instant,
    last_adjust: Instant,
    paused_until: Option<Instant>,
    circuit_open_until: Option<Instant>,
    consecutive_throttles: u32,
    last_throttle_at: Option<Instant>,
    last_success_at: Option<Instant>,
    boost: f64,
}

impl RateState {
    fn new(config: &LimiterConfig, now: Instant) -> Self {
        let current_rate = config.clamp_rate(config.init_rate, config.max_rate);
        let capacity = capacity_for(current_rate);
        Self {
            current_rate,
            max_rate: config.max_rate,
            capacity,
            tokens: capacity as f64,
            last_refill: now,
            last_adjust: now,
            paused_until: None,
            circuit_open_until: None,
            consecutive_throttles: 0,
            last_throttle_at: None,
            last_success_at: None,
            boost: 1.0,
        }
    }

    /// Try to take one permit; on failure return the instant worth re-checking at
    fn admit(&mut self, now: Instant, config: &LimiterConfig) -> Result<(), Instant> {
        if let Some(until) = self.circuit_open_until {
            if now < until {
                return Err(until);
            }
            self.circuit_open_until = None;
            if config.circuit_breaker.reset_on_cooldown {
                self.consecutive_throttles = 0;
            }
            info!(
                consecutive_throttles = self.consecutive_throttles,
                "Circuit breaker cooldown elapsed"
            );
        }

        if let Some(until) = self.paused_until {
            if now < until {
                return Err(until);
            }
            self.paused_until = None;
        }

        self.refill(now, config);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - self.tokens;
        let wait = Duration::from_secs_f64(deficit / self.current_rate);
        Err(now + wait.max(Duration::from_millis(1)))
    }

    fn refill(&mut self, now: Instant, config: &LimiterConfig) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.current_rate).min(self.capacity as f64);
        self.last_refill = now;

        if now.saturating_duration_since(self.last_adjust) >= ADJUST_INTERVAL {
            self.adjust(now, config);
            self.last_adjust = now;
        }
    }

    fn adjust(&mut self, now: Instant, config: &LimiterConfig) {
        let before = self.current_rate;

        if self.consecutive_throttles == 0 {
            let window = config.boost.window;
            let throttle_free = self
                .last_throttle_at
                .map_or(true, |at| now.saturating_duration_since(at) >= window);
            let recent_success = self
                .last_success_at
                .is_some_and(|at| now.saturating_duration_since(at) < window);

            if throttle_free && recent_success {
                self.boost = (self.boost + config.boost.step).min(config.boost.max_boost);
            } else {
                self.boost = (self.boost - config.boost.decay).max(1.0);
            }
            self.current_rate = (self.current_rate + config.ramp_step) * self.boost;
        } else if let Some(at) = self.last_throttle_at {
            let age = now.saturating_duration_since(at);
            let age_secs = age.as_secs_f64();
            if age > FAST_RECOVERY_AFTER {
                self.current_rate *= (1.0 + age_secs / 2.0).min(FAST_RECOVERY_CAP);
            } else if age > HOLD_WINDOW {
                self.current_rate *= (1.0 + age_secs / 5.0).min(MODEST_RECOVERY_CAP);
            }
        }

        self.set_rate_clamped(self.current_rate, config);
        if (self.current_rate - before).abs() > f64::EPSILON {
            debug!(from = before, to = self.current_rate, boost = self.boost, "Rate adjusted");
        }
    }

    fn set_rate_clamped(&mut self, rate: f64, config: &LimiterConfig) {
        self.current_rate = config.clamp_rate(rate, self.max_rate);
        self.capacity = capacity_for(self.current_rate);
        self.tokens = self.tokens.clamp(0.0, self.capacity as f64);
    }

    fn extend_pause(&mut self, now: Instant, pause: Duration) {
        let Some(until) = now.checked_add(pause) else {
            warn!(pause_ms = pause.as_millis() as u64, "Pause out of range, ignored");
            return;
        };
        self.paused_until = Some(self.paused_until.map_or(until, |p| p.max(until)));
    }

    fn circuit(&self, now: Instant) -> CircuitState {
        match self.circuit_open_until {
            Some(until) if now < until => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }
}

fn capacity_for(rate: f64) -> u32 {
    (rate.floor() as u32).max(1)
}

/// Cooperative token-bucket admission gate with adaptive fill rate
///
/// # Example
///
/// ```ignore
/// let limiter = Arc::new(AdaptiveRateLimiter::new(LimiterConfig::default()));
///
/// limiter.acquire().await;
/// match send().await.status() {
///     429 => {
///         limiter.penalize(0.1);
///         limiter.pause_for(Duration::from_secs(1));
///     }
///     _ => limiter.reset_consecutive_throttles(),
/// }
/// ```
pub struct AdaptiveRateLimiter {
    config: LimiterConfig,
    state: Mutex<RateState>,
    notify: Notify,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Create a limiter with a full bucket at the initial rate
    pub fn new(config: LimiterConfig) -> Self {
        let state = RateState::new(&config, Instant::now());
        Self {
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Wait until one permit is available and consume it
    ///
    /// Honors the circuit-breaker window first, then any pause window, then
    /// the token bucket.
    pub async fn acquire(&self) {
        loop {
            // Register interest before inspecting state so a wakeup between
            // the check and the wait is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_at = match self.state.lock().admit(Instant::now(), &self.config) {
                Ok(()) => return,
                Err(at) => at,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(retry_at) => {}
            }
        }
    }

    /// Take a permit only if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.state
            .lock()
            .admit(Instant::now(), &self.config)
            .is_ok()
    }

    /// Record a throttling response and shrink the rate
    ///
    /// Returns the multiplier that was applied.
    pub fn penalize(&self, factor: f64) -> f64 {
        let applied = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.consecutive_throttles = state.consecutive_throttles.saturating_add(1);
            state.last_throttle_at = Some(now);

            let breaker = &self.config.circuit_breaker;
            if state.consecutive_throttles >= breaker.threshold {
                let until = now.checked_add(breaker.cooldown).unwrap_or(now);
                state.circuit_open_until =
                    Some(state.circuit_open_until.map_or(until, |u| u.max(until)));
                warn!(
                    consecutive_throttles = state.consecutive_throttles,
                    cooldown_ms = breaker.cooldown.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }

            let floor = self.config.penalty.floor_for(state.consecutive_throttles);
            let applied = factor.clamp(floor, 1.0);
            let target = state.current_rate * applied;
            state.set_rate_clamped(target, &self.config);
            state.tokens = 0.0;

            debug!(
                consecutive_throttles = state.consecutive_throttles,
                multiplier = applied,
                rate = state.current_rate,
                "Rate penalized"
            );
            applied
        };
        self.notify.notify_waiters();
        applied
    }

    /// Block all acquires for at least `pause`; pauses never shrink
    ///
    /// The pause is clamped into `[min_pause, max_pause]`.
    pub fn pause_for(&self, pause: Duration) {
        let pause = self.config.clamp_pause(pause);
        {
            let mut state = self.state.lock();
            state.extend_pause(Instant::now(), pause);
        }
        self.notify.notify_waiters();
    }

    /// Clear the throttle streak after an observed success
    pub fn reset_consecutive_throttles(&self) {
        let mut state = self.state.lock();
        if state.consecutive_throttles > 0 {
            debug!(
                consecutive_throttles = state.consecutive_throttles,
                "Throttle streak reset"
            );
        }
        state.consecutive_throttles = 0;
        state.last_success_at = Some(Instant::now());
    }

    /// Feed quota headers observed on a response
    pub fn observe_quota(&self, quota: QuotaHeaders) {
        if quota.is_empty() {
            return;
        }
        let mut paused = false;
        {
            let mut state = self.state.lock();
            if let Some(limit) = quota.limit.filter(|l| *l > 0) {
                let limit = f64::from(limit).max(self.config.min_rate);
                if limit < state.max_rate {
                    info!(limit, previous = state.max_rate, "Lowering rate ceiling from quota header");
                    state.max_rate = limit;
                    let rate = state.current_rate;
                    state.set_rate_clamped(rate, &self.config);
                }
            }
            if let Some(remaining) = quota.remaining {
                if remaining < self.config.low_quota_threshold {
                    let pause = self.config.clamp_pause(self.config.low_quota_pause);
                    state.extend_pause(Instant::now(), pause);
                    paused = true;
                }
            }
        }
        if paused {
            debug!(remaining = ?quota.remaining, "Low remaining quota, pausing");
            self.notify.notify_waiters();
        }
    }

    /// Force the fill rate (clamped) and refill the bucket to the new capacity
    pub fn set_rate(&self, rate: f64) {
        {
            let mut state = self.state.lock();
            state.set_rate_clamped(rate, &self.config);
            state.tokens = state.capacity as f64;
            state.last_refill = Instant::now();
        }
        self.notify.notify_waiters();
    }

    pub fn current_rate(&self) -> f64 {
        self.state.lock().current_rate
    }

    pub fn consecutive_throttles(&self) -> u32 {
        self.state.lock().consecutive_throttles
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().circuit(Instant::now())
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock();
        LimiterSnapshot {
            current_rate: state.current_rate,
            max_rate: state.max_rate,
            capacity: state.capacity,
            available_tokens: state.tokens.floor() as u32,
            consecutive_throttles: state.consecutive_throttles,
            boost: state.boost,
            circuit: state.circuit(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn limiter(init: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(
            LimiterConfig::default()
                .with_init_rate(init)
                .with_bounds(5.0, 100.0),
        )
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(LimiterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(LimiterConfig::new().with_bounds(0.0, 10.0).validate().is_err());
        assert!(LimiterConfig::new().with_bounds(10.0, 5.0).validate().is_err());

        let mut penalty = PenaltySchedule::default();
        penalty.severe_floor = 0.95;
        assert!(LimiterConfig::new().with_penalty(penalty).validate().is_err());
    }

    #[test]
    fn test_penalty_floors_by_streak() {
        let schedule = PenaltySchedule::default();
        assert_eq!(schedule.floor_for(3), 0.9);
        assert_eq!(schedule.floor_for(5), 0.9);
        assert_eq!(schedule.floor_for(8), 0.8);
        assert_eq!(schedule.floor_for(10), 0.8);
        assert_eq!(schedule.floor_for(15), 0.7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_rate_is_clamped() {
        assert_eq!(limiter(500.0).current_rate(), 100.0);
        assert_eq!(limiter(1.0).current_rate(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_then_wait_for_refill() {
        let limiter = limiter(10.0);
        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(99), "waited {waited:?}");
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_graduation() {
        let limiter = limiter(100.0);
        let mut multipliers = Vec::new();
        for _ in 0..15 {
            multipliers.push(limiter.penalize(0.1));
        }
        // Streak lengths 3, 8 and 15
        assert_eq!(multipliers[2], 0.9);
        assert_eq!(multipliers[7], 0.8);
        assert_eq!(multipliers[14], 0.7);
        assert!(limiter.current_rate() >= 5.0);
        assert_eq!(limiter.snapshot().available_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_never_below_min_rate() {
        let limiter = limiter(6.0);
        for _ in 0..12 {
            limiter.penalize(0.1);
        }
        assert_eq!(limiter.current_rate(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalize_empties_bucket() {
        let limiter = limiter(50.0);
        limiter.penalize(0.5);
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_never_shrinks() {
        let limiter = limiter(50.0);
        limiter.pause_for(Duration::from_secs(3));
        limiter.pause_for(Duration::from_secs(1));

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_floored_at_min_pause() {
        let limiter = limiter(50.0);
        limiter.pause_for(Duration::ZERO);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_pause_is_capped_at_max_pause() {
        let limiter = AdaptiveRateLimiter::new(
            LimiterConfig::default()
                .with_init_rate(50.0)
                .with_pause_bounds(Duration::ZERO, Duration::from_secs(30)),
        );
        limiter.pause_for(Duration::MAX);

        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(30), "waited {waited:?}");
        assert!(waited < Duration::from_secs(31), "waited {waited:?}");
    }

    #[test]
    fn test_pause_bounds_validation() {
        let inverted = LimiterConfig::new()
            .with_pause_bounds(Duration::from_secs(10), Duration::from_secs(5));
        assert!(inverted.validate().is_err());

        let unbounded = LimiterConfig::new().with_pause_bounds(Duration::ZERO, Duration::MAX);
        assert!(unbounded.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_blocks_and_keeps_streak() {
        let config = LimiterConfig::default()
            .with_init_rate(50.0)
            .with_circuit_breaker(
                CircuitBreakerConfig::new()
                    .with_threshold(3)
                    .with_cooldown(Duration::from_secs(2)),
            );
        let limiter = AdaptiveRateLimiter::new(config);
        for _ in 0..3 {
            limiter.penalize(0.1);
        }
        assert_eq!(limiter.circuit_state(), CircuitState::Open);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(limiter.circuit_state(), CircuitState::Closed);
        // Streak survives the cooldown until a success clears it
        assert_eq!(limiter.consecutive_throttles(), 3);

        limiter.reset_consecutive_throttles();
        assert_eq!(limiter.consecutive_throttles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_reset_on_cooldown() {
        let config = LimiterConfig::default().with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_threshold(2)
                .with_cooldown(Duration::from_millis(500))
                .with_reset_on_cooldown(true),
        );
        let limiter = AdaptiveRateLimiter::new(config);
        limiter.penalize(0.1);
        limiter.penalize(0.1);
        limiter.acquire().await;
        assert_eq!(limiter.consecutive_throttles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_when_throttle_free() {
        let limiter = limiter(20.0);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.try_acquire());
        // One tick: +ramp step, no boost without recent successes
        assert_eq!(limiter.current_rate(), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_grows_with_success_streak() {
        let limiter = limiter(10.0);
        limiter.reset_consecutive_throttles();
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.try_acquire());
        let snapshot = limiter.snapshot();
        assert!((snapshot.boost - 1.1).abs() < 1e-9);
        assert!((snapshot.current_rate - 22.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_then_recover_after_throttle() {
        let limiter = limiter(40.0);
        tokio::time::advance(Duration::from_millis(1100)).await;
        limiter.penalize(0.1);
        let penalized = limiter.current_rate();

        // Throttle is fresh: the next tick holds the rate
        tokio::time::advance(Duration::from_millis(100)).await;
        limiter.try_acquire();
        assert_eq!(limiter.current_rate(), penalized);

        // More than a second later the fast recovery kicks in
        tokio::time::advance(Duration::from_millis(1400)).await;
        limiter.try_acquire();
        assert!(limiter.current_rate() > penalized);
        assert!(limiter.current_rate() <= penalized * FAST_RECOVERY_CAP + 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_headers_lower_ceiling_and_pause() {
        let limiter = limiter(80.0);
        limiter.observe_quota(QuotaHeaders {
            limit: Some(30),
            remaining: Some(2),
        });
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.max_rate, 30.0);
        assert_eq!(snapshot.current_rate, 30.0);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_refills_bucket() {
        let limiter = limiter(50.0);
        limiter.penalize(0.5);
        limiter.set_rate(12.7);
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.capacity, 12);
        assert_eq!(snapshot.available_tokens, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_woken_by_set_rate() {
        let limiter = std::sync::Arc::new(limiter(5.0));
        while limiter.try_acquire() {}

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        limiter.set_rate(50.0);
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("waiter should be released by set_rate")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_hold_for_random_sequences() {
        let limiter = limiter(20.0);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..2_000 {
            match rng.gen_range(0..6) {
                0 => {
                    limiter.penalize(rng.gen_range(0.0..1.5));
                }
                1 => limiter.reset_consecutive_throttles(),
                2 => limiter.set_rate(rng.gen_range(-10.0..500.0)),
                3 => {
                    tokio::time::advance(Duration::from_millis(rng.gen_range(0..1500))).await;
                }
                _ => {
                    limiter.try_acquire();
                }
            }

            let s = limiter.snapshot();
            assert!(s.available_tokens <= s.capacity);
            assert!(s.current_rate >= 5.0 && s.current_rate <= 100.0, "rate {}", s.current_rate);
            assert!(s.boost >= 1.0 && s.boost <= 1.6);
        }
    }
}
