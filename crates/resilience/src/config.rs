//! Configuration for retries, bulk runs, worker pools and health probing.
//!
//! Every section has a validating [`bon`] builder and can be deserialized
//! from a config file with human-readable durations:
//!
//! ```
//! use monstera_resilience::ResilienceConfig;
//!
//! let config: ResilienceConfig = serde_json::from_str(r#"{
//!     "retry": { "max_retries": 5, "base_delay": "50ms", "max_delay": "2s" },
//!     "bulk": { "chunk_size": 500 },
//!     "concurrency": { "max_workers": 8 }
//! }"#)?;
//! config.validate()?;
//! assert_eq!(config.retry.max_retries(), 5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default maximum number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default upper bound on any single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Default exponential growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default jitter as a fraction of the computed delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default number of items per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default time limit for one chunk, including its retries.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of the concurrent worker pool.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default minimum interval between two health probes.
pub const DEFAULT_HEALTH_CHECK_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Default time limit for one health probe.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

fn default_true() -> bool {
    true
}

/// Retry policy for transactional operations.
///
/// Immutable once built. The delay before retry `n` (0-based) is
/// `base_delay * multiplier^n`, capped at `max_delay`, optionally perturbed
/// by `±jitter_factor` and clamped back into `[0, max_delay]`.
///
/// # Validation
///
/// - `base_delay` must be positive
/// - `max_delay` must be `>= base_delay`
/// - `multiplier` must be finite and `>= 1.0`
/// - `jitter_factor` must be within `0.0..=1.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub(crate) max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub(crate) base_delay: Duration,

    /// Cap on any single delay.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub(crate) max_delay: Duration,

    /// Exponential growth factor.
    #[serde(default = "default_multiplier")]
    pub(crate) multiplier: f64,

    /// Jitter amplitude as a fraction of the delay.
    #[serde(default = "default_jitter_factor")]
    pub(crate) jitter_factor: f64,

    /// Whether jitter is applied at all.
    #[serde(default = "default_true")]
    pub(crate) jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            jitter_enabled: true,
        }
    }
}

#[bon::bon]
impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any field violates the rules listed on
    /// [`RetryPolicy`].
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_BASE_DELAY)] base_delay: Duration,
        #[builder(default = DEFAULT_MAX_DELAY)] max_delay: Duration,
        #[builder(default = DEFAULT_MULTIPLIER)] multiplier: f64,
        #[builder(default = DEFAULT_JITTER_FACTOR)] jitter_factor: f64,
        #[builder(default = true)] jitter_enabled: bool,
    ) -> Result<Self, ConfigError> {
        let policy =
            Self { max_retries, base_delay, max_delay, multiplier, jitter_factor, jitter_enabled };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Checks the invariants listed on [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::MustBePositive { field: "base_delay", value: "0s".into() });
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Inconsistent {
                field: "base_delay",
                value: format!("{:?}", self.base_delay),
                other: "max_delay",
                other_value: format!("{:?}", self.max_delay),
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::BelowMinimum {
                field: "multiplier",
                min: "1.0".into(),
                value: self.multiplier.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::AboveMaximum {
                field: "jitter_factor",
                max: "1.0".into(),
                value: self.jitter_factor.to_string(),
            });
        }
        Ok(())
    }

    /// Returns the number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the total number of attempts this policy permits.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Returns the delay before the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the cap on any single delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns the exponential growth factor.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the jitter amplitude.
    #[must_use]
    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Returns whether jitter is applied.
    #[must_use]
    pub fn jitter_enabled(&self) -> bool {
        self.jitter_enabled
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_timeout() -> Duration {
    DEFAULT_CHUNK_TIMEOUT
}

/// Configuration for the [chunked bulk runner](crate::bulk::ChunkedRunner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkConfig {
    /// Items per chunk when the caller does not pass one.
    #[serde(default = "default_chunk_size")]
    pub(crate) chunk_size: usize,

    /// Time limit for one chunk including its retries.
    #[serde(with = "humantime_serde", default = "default_chunk_timeout")]
    pub(crate) chunk_timeout: Duration,

    /// Report progress each time this many more items complete.
    /// `None` reports after every chunk.
    #[serde(default)]
    pub(crate) progress_interval: Option<usize>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            progress_interval: None,
        }
    }
}

#[bon::bon]
impl BulkConfig {
    /// Creates a bulk configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `chunk_size` is zero, `chunk_timeout` is
    /// zero, or `progress_interval` is `Some(0)`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CHUNK_SIZE)] chunk_size: usize,
        #[builder(default = DEFAULT_CHUNK_TIMEOUT)] chunk_timeout: Duration,
        progress_interval: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let config = Self { chunk_size, chunk_timeout, progress_interval };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants listed on [`BulkConfig::new`].
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "chunk_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.chunk_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "chunk_timeout", value: "0s".into() });
        }
        if self.progress_interval == Some(0) {
            return Err(ConfigError::BelowMinimum {
                field: "progress_interval",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Returns the default chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the per-chunk time limit.
    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        self.chunk_timeout
    }

    /// Returns the progress reporting interval in items.
    #[must_use]
    pub fn progress_interval(&self) -> Option<usize> {
        self.progress_interval
    }
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

/// Configuration for the [concurrent transaction manager](crate::concurrent).
///
/// `max_workers` is the admission-control knob: it bounds how many
/// transactions are open against the store at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Number of workers draining the operation queue.
    #[serde(default = "default_max_workers")]
    pub(crate) max_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: DEFAULT_MAX_WORKERS }
    }
}

#[bon::bon]
impl ConcurrencyConfig {
    /// Creates a concurrency configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_workers` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_WORKERS)] max_workers: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_workers };
        config.validate()?;
        Ok(config)
    }

    /// Checks that `max_workers` is at least one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for zero workers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_workers",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Returns the worker pool size.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

fn default_health_min_interval() -> Duration {
    DEFAULT_HEALTH_CHECK_MIN_INTERVAL
}

fn default_health_timeout() -> Duration {
    DEFAULT_HEALTH_CHECK_TIMEOUT
}

/// Configuration for the [health prober](crate::health::HealthProber).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Probes closer together than this are skipped.
    #[serde(with = "humantime_serde", default = "default_health_min_interval")]
    pub(crate) min_interval: Duration,

    /// Time limit for one probe round-trip.
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub(crate) timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_HEALTH_CHECK_MIN_INTERVAL,
            timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }
}

#[bon::bon]
impl HealthConfig {
    /// Creates a health probe configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `timeout` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_HEALTH_CHECK_MIN_INTERVAL)] min_interval: Duration,
        #[builder(default = DEFAULT_HEALTH_CHECK_TIMEOUT)] timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { min_interval, timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the probe timeout is positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] for a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "health_check_timeout",
                value: "0s".into(),
            });
        }
        Ok(())
    }

    /// Returns the minimum interval between probes.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns the probe time limit.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// All sections together, as loaded from a service's config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Chunked bulk runs.
    #[serde(default)]
    pub bulk: BulkConfig,
    /// Concurrent worker pool.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Health probing.
    #[serde(default)]
    pub health: HealthConfig,
}

impl ResilienceConfig {
    /// Validates every section. Deserialization alone does not validate.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule across all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.bulk.validate()?;
        self.concurrency.validate()?;
        self.health.validate()
    }
}
