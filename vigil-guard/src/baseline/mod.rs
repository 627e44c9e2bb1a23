//! Baseline computation and persistence.
//!
//! A baseline summarizes a metric's recent history as `(mean, stddev,
//! sample_size)` over a rolling window. Statistics use Welford's online
//! algorithm for numerical stability on large sample counts; the standard
//! deviation is the *sample* deviation (divisor `n - 1`), with `n <= 1`
//! yielding zero.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backend::{MetricDescriptor, MetricSample};
use crate::config::DetectionConfig;
use crate::error::{GuardError, Result};
use crate::resilience::ResilienceManager;

/// Persisted statistical summary of one metric's recent history.
///
/// Upserted atomically per `metric_name`; a baseline is never partially
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBaseline {
    /// Unique metric name (the upsert key).
    pub metric_name: String,
    /// Mean of the windowed samples.
    pub mean: f64,
    /// Sample standard deviation of the windowed samples. Always >= 0.
    pub stddev: f64,
    /// Number of samples the summary was computed from.
    pub sample_size: u64,
    /// Start of the sampling window.
    pub window_start: DateTime<Utc>,
    /// End of the sampling window.
    pub window_end: DateTime<Utc>,
    /// When the baseline was last recomputed.
    pub updated_at: DateTime<Utc>,
}

/// Welford single-pass accumulator for mean and variance.
///
/// Non-finite values are rejected rather than folded in: a single NaN would
/// permanently corrupt the running mean and M2.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an accumulator from an iterator of values.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = Self::new();
        for value in values {
            stats.push(value);
        }
        stats
    }

    /// Folds one value in. Returns `false` (and leaves the accumulator
    /// untouched) for non-finite input.
    pub fn push(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        true
    }

    /// Number of accepted samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of the accepted samples; zero when empty.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation (divisor `n - 1`); zero when `n <= 1`.
    pub fn sample_stddev(&self) -> f64 {
        if self.count <= 1 {
            return 0.0;
        }
        // Guard against tiny negative M2 from floating point cancellation.
        (self.m2 / (self.count - 1) as f64).max(0.0).sqrt()
    }
}

/// Computes and persists [`MetricBaseline`]s through the resilience layer.
///
/// Samples are read from the `data` backend; the resulting baseline is
/// persisted to the `monitoring` backend. Both may be the same manager when
/// one store serves both roles.
pub struct BaselineStore {
    data: Arc<ResilienceManager>,
    monitoring: Arc<ResilienceManager>,
    min_sample_size: usize,
}

impl BaselineStore {
    /// Creates a store reading from `data` and persisting to `monitoring`.
    pub fn new(
        data: Arc<ResilienceManager>,
        monitoring: Arc<ResilienceManager>,
        detection: &DetectionConfig,
    ) -> Self {
        Self {
            data,
            monitoring,
            min_sample_size: detection.min_sample_size,
        }
    }

    /// Recomputes and persists the baseline for `metric` from the samples in
    /// its window ending at `now`.
    ///
    /// When fewer than `min_sample_size` samples are available the store
    /// signals [`GuardError::InsufficientSamples`] and leaves any previously
    /// stored baseline untouched.
    #[instrument(skip(self, metric), fields(metric = %metric.name, source = %metric.source))]
    pub async fn refresh_at(
        &self,
        metric: &MetricDescriptor,
        now: DateTime<Utc>,
    ) -> Result<MetricBaseline> {
        let window = metric.window_ending_at(now);

        let samples: Vec<MetricSample> = {
            let descriptor = metric.clone();
            self.data
                .with_connection("metric_samples", move |conn| {
                    let descriptor = descriptor.clone();
                    Box::pin(async move { conn.metric_samples(&descriptor, &window).await })
                })
                .await?
        };

        if samples.len() < self.min_sample_size {
            warn!(
                available = samples.len(),
                required = self.min_sample_size,
                "not enough samples to refresh baseline, keeping previous"
            );
            return Err(GuardError::InsufficientSamples {
                metric: metric.name.clone(),
                available: samples.len(),
                required: self.min_sample_size,
            });
        }

        let stats = RunningStats::from_values(samples.iter().map(|s| s.value));
        let baseline = MetricBaseline {
            metric_name: metric.name.clone(),
            mean: stats.mean(),
            stddev: stats.sample_stddev(),
            sample_size: stats.count(),
            window_start: window.start,
            window_end: window.end,
            updated_at: now,
        };

        {
            let baseline = baseline.clone();
            self.monitoring
                .with_connection("upsert_baseline", move |conn| {
                    let baseline = baseline.clone();
                    Box::pin(async move { conn.upsert_baseline(&baseline).await })
                })
                .await?;
        }

        info!(
            mean = baseline.mean,
            stddev = baseline.stddev,
            sample_size = baseline.sample_size,
            "baseline refreshed"
        );
        Ok(baseline)
    }

    /// Recomputes the baseline with the window ending now.
    pub async fn refresh(&self, metric: &MetricDescriptor) -> Result<MetricBaseline> {
        self.refresh_at(metric, Utc::now()).await
    }

    /// Loads the stored baseline for a metric, if any.
    #[instrument(skip(self))]
    pub async fn load(&self, metric_name: &str) -> Result<Option<MetricBaseline>> {
        let name = metric_name.to_string();
        let baseline = self
            .monitoring
            .with_connection("fetch_baseline", move |conn| {
                let name = name.clone();
                Box::pin(async move { conn.fetch_baseline(&name).await })
            })
            .await?;
        debug!(found = baseline.is_some(), "baseline lookup");
        Ok(baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_two_pass_computation() {
        let values = [12.0, 15.5, 9.25, 20.0, 18.75, 11.0, 14.5];
        let stats = RunningStats::from_values(values);

        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let variance: f64 =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;

        assert!((stats.mean() - mean).abs() < 1e-12);
        assert!((stats.sample_stddev() - variance.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn single_sample_has_zero_stddev() {
        let stats = RunningStats::from_values([42.0]);
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.mean(), 42.0);
        assert_eq!(stats.sample_stddev(), 0.0);
    }

    #[test]
    fn empty_stats_are_zero() {
        let stats = RunningStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.sample_stddev(), 0.0);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let mut stats = RunningStats::new();
        assert!(stats.push(10.0));
        assert!(!stats.push(f64::NAN));
        assert!(!stats.push(f64::INFINITY));
        assert!(stats.push(12.0));

        assert_eq!(stats.count(), 2);
        assert!((stats.mean() - 11.0).abs() < 1e-12);
    }

    #[test]
    fn stable_on_large_offsets() {
        // Values with a huge common offset; naive sum-of-squares would lose
        // all precision here.
        let offset = 1e12;
        let stats = RunningStats::from_values([offset + 1.0, offset + 2.0, offset + 3.0]);
        assert!((stats.mean() - (offset + 2.0)).abs() < 1e-3);
        assert!((stats.sample_stddev() - 1.0).abs() < 1e-6);
    }

    mod store {
        use super::super::*;
        use crate::backend::memory::MemoryBackend;
        use crate::config::MonitorConfig;
        use chrono::Duration as ChronoDuration;

        fn setup(sample_count: usize) -> (Arc<MemoryBackend>, BaselineStore, MetricDescriptor) {
            let backend = Arc::new(MemoryBackend::new("cdc"));
            let now = Utc::now();
            // One record per hour, `count` hours back.
            for i in 0..sample_count {
                backend.seed_record(
                    "orders_history",
                    now - ChronoDuration::hours(i as i64 + 1),
                    &[],
                );
            }
            let config = MonitorConfig::default();
            let manager = ResilienceManager::new(backend.clone(), &config);
            let store = BaselineStore::new(manager.clone(), manager, &config.detection);
            let metric = MetricDescriptor::volume("hourly_ingestion_rate", "orders_history", 7);
            (backend, store, metric)
        }

        #[tokio::test]
        async fn refresh_persists_baseline() {
            let (backend, store, metric) = setup(24);
            let baseline = store.refresh(&metric).await.unwrap();
            assert_eq!(baseline.metric_name, "hourly_ingestion_rate");
            assert!(baseline.sample_size >= 24);
            assert!(baseline.stddev >= 0.0);

            let stored = backend.baseline("hourly_ingestion_rate").unwrap();
            assert_eq!(stored, baseline);
        }

        #[tokio::test]
        async fn insufficient_samples_keeps_previous_baseline() {
            let (backend, store, metric) = setup(24);
            let first = store.refresh(&metric).await.unwrap();

            // Rebuild against a source with too little history.
            backend.clear_records("orders_history");
            backend.seed_record("orders_history", Utc::now(), &[]);

            let err = store.refresh(&metric).await.unwrap_err();
            assert!(matches!(err, GuardError::InsufficientSamples { .. }));

            // The earlier baseline survived.
            assert_eq!(backend.baseline("hourly_ingestion_rate").unwrap(), first);
        }

        #[tokio::test]
        async fn load_returns_none_for_unknown_metric() {
            let (_backend, store, _metric) = setup(24);
            assert!(store.load("no_such_metric").await.unwrap().is_none());
        }
    }
}
