//! Store readiness and the throttled prober.
//!
//! Backends answer [`StorageBackend::health_check`] with a [`Readiness`].
//! [`HealthProber`] asks at most once per configured interval, times the
//! round trip, and caches the outcome in a [`HealthState`] that request
//! handlers can read cheaply. The retry path never consults it.

use std::{fmt, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{backend::StorageBackend, config::HealthConfig, error::StorageError};

/// A store's answer to a readiness probe.
///
/// [`Degraded`](Self::Degraded) still passes: the store serves transactions,
/// for example from a primary whose replicas lag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Transactions can be opened and committed.
    Ready,
    /// Transactions succeed with reduced capability.
    Degraded {
        /// What is degraded.
        reason: String,
    },
    /// The store cannot run transactions.
    NotReady {
        /// Why the store refused.
        reason: String,
    },
}

impl Readiness {
    /// Returns `true` for [`Ready`](Self::Ready) and [`Degraded`](Self::Degraded).
    #[must_use]
    pub fn passes(&self) -> bool {
        !matches!(self, Self::NotReady { .. })
    }

    /// The degradation or refusal reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::Degraded { reason } | Self::NotReady { reason } => Some(reason),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Degraded { reason } => write!(f, "degraded: {reason}"),
            Self::NotReady { reason } => write!(f, "not ready: {reason}"),
        }
    }
}

/// A failed health probe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HealthError {
    /// The store answered but reported itself unhealthy.
    #[error("store reported unhealthy: {reason}")]
    Unhealthy {
        /// Reason given by the store.
        reason: String,
    },

    /// The probe call itself failed.
    #[error("health probe failed: {0}")]
    Probe(#[source] StorageError),

    /// The store did not answer within the probe timeout.
    #[error("health probe timed out after {limit:?}")]
    Timeout {
        /// The configured probe timeout.
        limit: Duration,
    },

    /// The probe was cancelled before the store answered.
    #[error("health probe cancelled")]
    Cancelled,
}

/// Cached result of the most recent health probe.
///
/// Starts out healthy with no recorded check.
#[derive(Debug, Clone)]
pub struct HealthState {
    last_check: Option<Instant>,
    healthy: bool,
    last_readiness: Option<Readiness>,
    last_round_trip: Option<Duration>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            last_check: None,
            healthy: true,
            last_readiness: None,
            last_round_trip: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

impl HealthState {
    /// When the last completed probe started, if any.
    #[must_use]
    pub fn last_check(&self) -> Option<Instant> {
        self.last_check
    }

    /// Whether the last completed probe passed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// The readiness the store last reported, if it answered.
    #[must_use]
    pub fn last_readiness(&self) -> Option<&Readiness> {
        self.last_readiness.as_ref()
    }

    /// How long the store took to answer the last completed probe.
    #[must_use]
    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    /// Description of the last failure, cleared by the next passing probe.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of failed probes since the last passing one.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn record_pass(&mut self, at: Instant, round_trip: Duration, readiness: Readiness) {
        self.last_check = Some(at);
        self.healthy = true;
        self.last_readiness = Some(readiness);
        self.last_round_trip = Some(round_trip);
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    fn record_failure(
        &mut self,
        at: Instant,
        round_trip: Option<Duration>,
        readiness: Option<Readiness>,
        error: &HealthError,
    ) {
        self.last_check = Some(at);
        self.healthy = false;
        self.last_readiness = readiness;
        self.last_round_trip = round_trip;
        self.last_error = Some(error.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// Throttled readiness prober for a store.
///
/// The prober owns its [`HealthState`]; `check` takes `&mut self`, so there
/// is a single writer. Share it behind a lock if several tasks need to probe.
///
/// ```
/// use monstera_resilience::{HealthConfig, HealthProber, MemoryBackend};
/// use tokio_util::sync::CancellationToken;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryBackend::new();
/// let mut prober = HealthProber::new(HealthConfig::default());
///
/// prober.check(&CancellationToken::new(), &store).await.unwrap();
/// assert!(prober.is_healthy());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct HealthProber {
    config: HealthConfig,
    state: HealthState,
}

impl HealthProber {
    /// Creates a prober that has not checked yet.
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self { config, state: HealthState::default() }
    }

    /// Returns the prober configuration.
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Returns the cached health flag without probing.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.healthy
    }

    /// Returns the cached state.
    #[must_use]
    pub fn state(&self) -> &HealthState {
        &self.state
    }

    /// Probes the store for readiness unless the previous probe was less than
    /// `min_interval` ago, in which case this returns `Ok(())` without
    /// contacting the store.
    ///
    /// A [`Degraded`](Readiness::Degraded) answer counts as passing.
    ///
    /// # Errors
    ///
    /// - [`HealthError::Unhealthy`] if the store reports itself not ready
    /// - [`HealthError::Probe`] if the probe call fails
    /// - [`HealthError::Timeout`] if the store does not answer in time
    /// - [`HealthError::Cancelled`] if `cancel` fires first; the cached state is left untouched
    #[tracing::instrument(skip(self, cancel, store))]
    pub async fn check<S>(&mut self, cancel: &CancellationToken, store: &S) -> Result<(), HealthError>
    where
        S: StorageBackend + ?Sized,
    {
        let now = Instant::now();
        if let Some(last) = self.state.last_check
            && now.duration_since(last) < self.config.min_interval()
        {
            tracing::trace!(healthy = self.state.healthy, "health probe throttled");
            return Ok(());
        }

        let limit = self.config.timeout();
        let answer = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HealthError::Cancelled),
            answer = tokio::time::timeout(limit, store.health_check()) => answer,
        };
        let round_trip = now.elapsed();

        let was_healthy = self.state.healthy;
        let outcome = match answer {
            Err(_elapsed) => Err((None, None, HealthError::Timeout { limit })),
            Ok(Err(err)) => Err((Some(round_trip), None, HealthError::Probe(err))),
            Ok(Ok(readiness)) if !readiness.passes() => {
                let reason = readiness.reason().unwrap_or("not ready").to_owned();
                Err((Some(round_trip), Some(readiness), HealthError::Unhealthy { reason }))
            },
            Ok(Ok(readiness)) => Ok(readiness),
        };

        match outcome {
            Ok(readiness) => {
                let round_trip_ms = round_trip.as_millis() as u64;
                if matches!(readiness, Readiness::Degraded { .. }) {
                    tracing::warn!(%readiness, round_trip_ms, "store degraded");
                } else if !was_healthy {
                    tracing::info!(round_trip_ms, "store recovered");
                }
                self.state.record_pass(now, round_trip, readiness);
                Ok(())
            },
            Err((round_trip, readiness, error)) => {
                self.state.record_failure(now, round_trip, readiness, &error);
                tracing::warn!(
                    error = %error,
                    consecutive_failures = self.state.consecutive_failures,
                    "store health probe failed",
                );
                Err(error)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{error::StorageResult, memory::MemoryBackend, transaction::Transaction};

    /// Delegates to a memory store but answers health probes slowly, optionally
    /// with a fixed answer.
    struct SlowHealthStore {
        inner: MemoryBackend,
        delay: Duration,
        answer: Option<Readiness>,
    }

    impl SlowHealthStore {
        fn new(delay: Duration) -> Self {
            Self { inner: MemoryBackend::new(), delay, answer: None }
        }
    }

    #[async_trait]
    impl StorageBackend for SlowHealthStore {
        async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &[u8]) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
            self.inner.transaction().await
        }

        async fn health_check(&self) -> StorageResult<Readiness> {
            tokio::time::sleep(self.delay).await;
            match &self.answer {
                Some(answer) => Ok(answer.clone()),
                None => self.inner.health_check().await,
            }
        }
    }

    fn prober() -> HealthProber {
        HealthProber::new(
            HealthConfig::builder()
                .min_interval(Duration::from_secs(30))
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_check_probes_store() {
        let store = MemoryBackend::new();
        let mut prober = prober();
        assert!(prober.is_healthy());
        assert!(prober.state().last_check().is_none());

        prober.check(&CancellationToken::new(), &store).await.unwrap();

        assert!(prober.is_healthy());
        assert!(prober.state().last_check().is_some());
        assert_eq!(prober.state().last_readiness(), Some(&Readiness::Ready));
        assert_eq!(prober.state().last_round_trip(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checks_within_interval_are_skipped() {
        let store = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let mut prober = prober();

        prober.check(&cancel, &store).await.unwrap();
        let first = prober.state().last_check().unwrap();

        store.mark_unhealthy("disk full");
        tokio::time::advance(Duration::from_secs(10)).await;
        prober.check(&cancel, &store).await.unwrap();
        assert!(prober.is_healthy());
        assert_eq!(prober.state().last_check(), Some(first));

        tokio::time::advance(Duration::from_secs(20)).await;
        let err = prober.check(&cancel, &store).await.unwrap_err();
        assert!(matches!(err, HealthError::Unhealthy { ref reason } if reason == "disk full"));
        assert!(!prober.is_healthy());
        assert_eq!(prober.state().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_clears_failure() {
        let store = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let mut prober = prober();

        store.mark_unhealthy("replica lagging");
        assert!(prober.check(&cancel, &store).await.is_err());
        assert_eq!(prober.state().last_error(), Some("store reported unhealthy: replica lagging"));

        store.mark_healthy();
        tokio::time::advance(Duration::from_secs(30)).await;
        prober.check(&cancel, &store).await.unwrap();

        assert!(prober.is_healthy());
        assert!(prober.state().last_error().is_none());
        assert_eq!(prober.state().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = SlowHealthStore::new(Duration::from_secs(60));
        let mut prober = prober();

        let err = prober.check(&CancellationToken::new(), &store).await.unwrap_err();

        assert!(matches!(err, HealthError::Timeout { limit } if limit == Duration::from_secs(5)));
        assert!(!prober.is_healthy());
        assert!(prober.state().last_readiness().is_none());
        assert!(prober.state().last_round_trip().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_state_untouched() {
        let store = SlowHealthStore::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let mut prober = prober();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = prober.check(&cancel, &store).await.unwrap_err();
        assert!(matches!(err, HealthError::Cancelled));
        assert!(prober.is_healthy());
        assert!(prober.state().last_check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_store_passes_and_records_round_trip() {
        let mut store = SlowHealthStore::new(Duration::from_millis(40));
        store.answer = Some(Readiness::Degraded { reason: "replica lag 12s".to_owned() });
        let mut prober = prober();

        prober.check(&CancellationToken::new(), &store).await.unwrap();

        assert!(prober.is_healthy());
        assert_eq!(prober.state().last_round_trip(), Some(Duration::from_millis(40)));
        let readiness = prober.state().last_readiness().unwrap();
        assert!(readiness.passes());
        assert_eq!(readiness.reason(), Some("replica lag 12s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_accumulate_across_intervals() {
        let store = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let mut prober = prober();
        store.mark_unhealthy("primary unreachable");

        for expected in 1..=3 {
            let err = prober.check(&cancel, &store).await.unwrap_err();
            assert!(matches!(err, HealthError::Unhealthy { .. }));
            assert_eq!(prober.state().consecutive_failures(), expected);
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        assert_eq!(
            prober.state().last_readiness(),
            Some(&Readiness::NotReady { reason: "primary unreachable".to_owned() })
        );
    }

    #[test]
    fn test_readiness_display_names_reason() {
        let not_ready = Readiness::NotReady { reason: "too many connections".to_owned() };
        assert!(!not_ready.passes());
        assert_eq!(not_ready.to_string(), "not ready: too many connections");
        assert_eq!(Readiness::Ready.to_string(), "ready");
        assert_eq!(Readiness::Ready.reason(), None);
    }
}
