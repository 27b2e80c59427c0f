//! Engine configuration
//!
//! All tunables of a run live in [`EngineConfig`]. Values can be built in code
//! with the `with_*` builders or loaded from a TOML file with
//! [`load_engine_config`]; durations are expressed in milliseconds on the wire.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reliability::LimiterConfig;

/// Configuration for one bulk mutation run
///
/// # Example
///
/// ```
/// use bulkmut_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_max_concurrency(20)
///     .with_max_drain_iterations(5)
///     .with_request_timeout(Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of in-flight mutations
    pub max_concurrency: usize,

    /// Rate limiter tunables
    pub limiter: LimiterConfig,

    /// Multiplier applied to the Phase-1 rate for each drain iteration
    pub queue_reduction_factor: f64,

    /// Maximum number of retry-queue drain iterations after Phase 1
    pub max_drain_iterations: u32,

    /// Pause between drain iterations
    #[serde(with = "duration_millis")]
    pub drain_pause: Duration,

    /// Number of successes buffered before the ledger is appended
    pub checkpoint_batch_size: usize,

    /// Per-request HTTP timeout
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Pause applied on 429 when the server sends no usable Retry-After
    #[serde(with = "duration_millis")]
    pub default_throttle_pause: Duration,

    /// Interval between progress snapshots
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,

    /// How long in-flight work may run after cancellation
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Randomize Phase-1 submission order
    pub shuffle: bool,

    /// Keep transient (5xx/network) failures in the queue during drain phases
    pub requeue_transient_in_drain: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 40,
            limiter: LimiterConfig::default(),
            queue_reduction_factor: 0.8,
            max_drain_iterations: 10,
            drain_pause: Duration::from_secs(2),
            checkpoint_batch_size: 1000,
            request_timeout: Duration::from_secs(15),
            default_throttle_pause: Duration::from_secs(1),
            progress_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            shuffle: true,
            requeue_transient_in_drain: false,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the rate limiter configuration
    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    /// Set the per-iteration rate reduction factor for drain phases
    pub fn with_queue_reduction_factor(mut self, factor: f64) -> Self {
        self.queue_reduction_factor = factor;
        self
    }

    /// Set the drain iteration cap
    pub fn with_max_drain_iterations(mut self, iterations: u32) -> Self {
        self.max_drain_iterations = iterations;
        self
    }

    /// Set the pause between drain iterations
    pub fn with_drain_pause(mut self, pause: Duration) -> Self {
        self.drain_pause = pause;
        self
    }

    /// Set the checkpoint batch size
    pub fn with_checkpoint_batch_size(mut self, size: usize) -> Self {
        self.checkpoint_batch_size = size.max(1);
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the fallback pause for 429 responses without Retry-After
    pub fn with_default_throttle_pause(mut self, pause: Duration) -> Self {
        self.default_throttle_pause = pause;
        self
    }

    /// Set the progress snapshot interval
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Set the shutdown drain timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable Phase-1 shuffling
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Keep transient failures queued during drain phases
    pub fn with_requeue_transient_in_drain(mut self, requeue: bool) -> Self {
        self.requeue_transient_in_drain = requeue;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if !(self.queue_reduction_factor > 0.0 && self.queue_reduction_factor <= 1.0) {
            return Err(ConfigError::Invalid(
                "queue_reduction_factor must be in (0, 1]".into(),
            ));
        }
        if self.checkpoint_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_batch_size must be at least 1".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request_timeout must be non-zero".into()));
        }
        if self.progress_interval.is_zero() {
            return Err(ConfigError::Invalid("progress_interval must be non-zero".into()));
        }
        self.limiter.validate()
    }
}

/// Load engine configuration from a TOML file or fall back to defaults
///
/// A missing path or a path that does not exist yields the defaults.
pub fn load_engine_config(config_path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let Some(path) = config_path else {
        tracing::info!("No config path specified, using built-in defaults");
        return Ok(EngineConfig::default());
    };

    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using built-in defaults");
        return Ok(EngineConfig::default());
    }

    tracing::info!("Loading engine config from: {}", path.display());
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let config: EngineConfig = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
