//! Statistical anomaly detection against baselines.
//!
//! The detector turns a current observation plus its [`MetricBaseline`] into
//! at most one [`AlertCandidate`] per evaluation. Two signal kinds share the
//! Z-score engine:
//!
//! - **volume**: per-bucket record counts, two-tailed (drops and spikes both
//!   alert);
//! - **freshness**: minutes since the most recent record, one-tailed (only
//!   the stale direction alerts) plus a hard staleness ceiling that escalates
//!   independently of any baseline, so "no data at all" still alerts even
//!   with a degenerate baseline.
//!
//! A baseline with `stddev == 0` yields `z == 0` for every current value: no
//! observed variation means no statistical anomaly. This is a deliberate
//! policy, not an omission; the freshness ceiling exists precisely to catch
//! the failure modes a flat baseline would mask.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::alert::{AlertCandidate, AlertKind, Severity};
use crate::backend::MetricDescriptor;
use crate::baseline::MetricBaseline;
use crate::config::DetectionConfig;

/// Number of standard deviations `current` lies from `mean`.
///
/// Returns `0.0` when `stddev == 0` (degenerate baseline policy).
pub fn z_score(current: f64, mean: f64, stddev: f64) -> f64 {
    if stddev == 0.0 {
        return 0.0;
    }
    ((current - mean) / stddev).abs()
}

/// Classifies current values against baselines and emits alert candidates.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    critical_z_threshold: f64,
    warning_z_threshold: f64,
    freshness_threshold_minutes: u32,
}

impl AnomalyDetector {
    /// Creates a detector with the configured thresholds.
    pub fn new(detection: &DetectionConfig) -> Self {
        Self {
            critical_z_threshold: detection.critical_z_threshold,
            warning_z_threshold: detection.warning_z_threshold,
            freshness_threshold_minutes: detection.freshness_threshold_minutes,
        }
    }

    /// Maps a Z-score onto a severity, or `None` below the warning threshold.
    pub fn classify(&self, z: f64) -> Option<Severity> {
        if z >= self.critical_z_threshold {
            Some(Severity::Critical)
        } else if z >= self.warning_z_threshold {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// Evaluates a current volume count against its baseline.
    #[instrument(skip(self, metric, baseline), fields(metric = %metric.name))]
    pub fn evaluate_volume(
        &self,
        metric: &MetricDescriptor,
        baseline: &MetricBaseline,
        current: u64,
        observed_at: DateTime<Utc>,
    ) -> Option<AlertCandidate> {
        let z = z_score(current as f64, baseline.mean, baseline.stddev);
        let Some(severity) = self.classify(z) else {
            debug!(z, current, mean = baseline.mean, "volume within expected range");
            return None;
        };

        let direction = if (current as f64) < baseline.mean {
            "drop"
        } else {
            "spike"
        };
        let candidate = AlertCandidate::new(
            AlertKind::VolumeAnomaly,
            severity,
            metric.source.clone(),
            observed_at,
            format!(
                "volume {direction} on {}: {current} records, expected ~{:.0} ± {:.0} (z-score {z:.2})",
                metric.source, baseline.mean, baseline.stddev
            ),
        )
        .with_detail("metric", metric.name.clone())
        .with_detail("current_count", current)
        .with_detail("baseline_mean", baseline.mean)
        .with_detail("baseline_stddev", baseline.stddev)
        .with_detail("sample_size", baseline.sample_size)
        .with_detail("z_score", z)
        .with_detail("direction", direction);

        debug!(z, %severity, "volume anomaly detected");
        Some(candidate)
    }

    /// Evaluates staleness for a freshness metric.
    ///
    /// `latest` is the most recent record timestamp (`None` when the source
    /// is empty). A stored staleness baseline is consulted when present;
    /// the hard ceiling applies either way.
    #[instrument(skip(self, metric, baseline), fields(metric = %metric.name))]
    pub fn evaluate_freshness(
        &self,
        metric: &MetricDescriptor,
        baseline: Option<&MetricBaseline>,
        latest: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<AlertCandidate> {
        let Some(latest) = latest else {
            // An empty source must alert even without any baseline.
            return Some(
                AlertCandidate::new(
                    AlertKind::FreshnessAnomaly,
                    Severity::Critical,
                    metric.source.clone(),
                    now,
                    format!("no records ever observed in {}", metric.source),
                )
                .with_detail("metric", metric.name.clone())
                .with_detail("no_data", true)
                .with_detail("threshold_minutes", self.freshness_threshold_minutes),
            );
        };

        let staleness_minutes = (now - latest).num_seconds() as f64 / 60.0;
        let ceiling = f64::from(self.freshness_threshold_minutes);

        if staleness_minutes > ceiling {
            let candidate = AlertCandidate::new(
                AlertKind::FreshnessAnomaly,
                Severity::Critical,
                metric.source.clone(),
                now,
                format!(
                    "data flow stale on {}: {staleness_minutes:.1} minutes since last record (ceiling {ceiling:.0})",
                    metric.source
                ),
            )
            .with_detail("metric", metric.name.clone())
            .with_detail("staleness_minutes", staleness_minutes)
            .with_detail("threshold_minutes", self.freshness_threshold_minutes)
            .with_detail("latest_record_at", latest.to_rfc3339());
            debug!(staleness_minutes, "staleness ceiling breached");
            return Some(candidate);
        }

        // One-tailed against the baseline: arriving *faster* than usual is
        // never an anomaly.
        let baseline = baseline?;
        if staleness_minutes <= baseline.mean {
            return None;
        }
        let z = z_score(staleness_minutes, baseline.mean, baseline.stddev);
        let severity = self.classify(z)?;

        let candidate = AlertCandidate::new(
            AlertKind::FreshnessAnomaly,
            severity,
            metric.source.clone(),
            now,
            format!(
                "staleness anomaly on {}: {staleness_minutes:.1} minutes since last record, expected ~{:.1} (z-score {z:.2})",
                metric.source, baseline.mean
            ),
        )
        .with_detail("metric", metric.name.clone())
        .with_detail("staleness_minutes", staleness_minutes)
        .with_detail("baseline_mean", baseline.mean)
        .with_detail("baseline_stddev", baseline.stddev)
        .with_detail("z_score", z)
        .with_detail("latest_record_at", latest.to_rfc3339());

        debug!(z, %severity, "staleness anomaly detected");
        Some(candidate)
    }
}
