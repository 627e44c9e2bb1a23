//! Alert types, deduplication, and the idempotent alert sink.
//!
//! Detection produces [`AlertCandidate`]s; the [`AlertSink`] turns them into
//! durable [`Alert`] rows without ever creating a second row for the same
//! incident. Deduplication hinges on a deterministic key derived from the
//! alert kind, the source identifier, and a time bucket, so re-running
//! detection against the same incident refreshes the existing row instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::contract::ContractViolation;
use crate::error::Result;
use crate::resilience::ResilienceManager;

/// The kind of incident an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    /// Record volume deviated from its baseline.
    VolumeAnomaly,
    /// A source went stale.
    FreshnessAnomaly,
    /// Records violated their declared contract.
    ContractViolation,
}

impl AlertKind {
    /// Stable wire name for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VolumeAnomaly => "VOLUME_ANOMALY",
            Self::FreshnessAnomaly => "FRESHNESS_ANOMALY",
            Self::ContractViolation => "CONTRACT_VIOLATION",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational only.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

impl Severity {
    /// Stable wire name for the severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a stored alert. The core only ever writes `Open`;
/// acknowledgement happens in external tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    /// Unhandled.
    Open,
    /// Acknowledged by an operator.
    Acknowledged,
}

/// One detected incident, before deduplication.
///
/// Candidates are produced by the detector and the contract validator; the
/// sink derives the dedup key and decides insert-vs-refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCandidate {
    /// Kind of incident.
    pub kind: AlertKind,
    /// Severity classified by the producer.
    pub severity: Severity,
    /// Source identifier (table, stream, or contract name).
    pub source: String,
    /// When the incident was observed.
    pub observed_at: DateTime<Utc>,
    /// Human-readable one-line description.
    pub description: String,
    /// Structured payload (current value, baseline, z-score, counts...).
    pub details: Map<String, Value>,
    /// Dedup bucket override. `None` buckets by the observation's UTC
    /// calendar day; contract candidates carry their validation-run token.
    pub bucket: Option<String>,
}

impl AlertCandidate {
    /// Creates a candidate with an empty details payload.
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        source: impl Into<String>,
        observed_at: DateTime<Utc>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            source: source.into(),
            observed_at,
            description: description.into(),
            details: Map::new(),
            bucket: None,
        }
    }

    /// Adds a detail to the payload.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Sets the dedup bucket (validation-run token for contract alerts).
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// The time bucket this candidate dedups within.
    pub fn dedup_bucket(&self) -> String {
        match &self.bucket {
            Some(bucket) => bucket.clone(),
            None => self.observed_at.format("%Y-%m-%d").to_string(),
        }
    }

    /// The deterministic dedup key for this candidate.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.kind, &self.source, &self.dedup_bucket())
    }
}

/// Derives the deterministic dedup key for `(kind, source, bucket)`.
pub fn dedup_key(kind: AlertKind, source: &str, bucket: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.as_bytes());
    hex::encode(hasher.finalize())
}

/// A durable alert row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Kind of incident.
    pub kind: AlertKind,
    /// Severity at the most recent detection.
    pub severity: Severity,
    /// Unique dedup key; the upsert key.
    pub dedup_key: String,
    /// Source identifier.
    pub source: String,
    /// Human-readable description from the most recent detection.
    pub description: String,
    /// Structured payload from the most recent detection.
    pub details: Map<String, Value>,
    /// First time this incident was seen. Never changes once written.
    pub first_seen_at: DateTime<Utc>,
    /// Most recent time this incident was seen.
    pub last_seen_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: AlertStatus,
    /// How many detections have mapped to this row.
    pub occurrences: u64,
}

impl Alert {
    /// Builds the row a candidate would insert on first detection.
    pub fn from_candidate(candidate: &AlertCandidate) -> Self {
        Self {
            kind: candidate.kind,
            severity: candidate.severity,
            dedup_key: candidate.dedup_key(),
            source: candidate.source.clone(),
            description: candidate.description.clone(),
            details: candidate.details.clone(),
            first_seen_at: candidate.observed_at,
            last_seen_at: candidate.observed_at,
            status: AlertStatus::Open,
            occurrences: 1,
        }
    }
}

/// Whether an alert upsert created a new incident row or refreshed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertWriteOutcome {
    /// First detection of this incident.
    Inserted,
    /// A repeat detection; `last_seen_at`/`details` were refreshed.
    Refreshed,
}

/// Persists alert candidates and violations idempotently.
///
/// All writes flow through the resilience manager; the backend's upsert
/// atomicity (not application locks) guarantees that concurrent submissions
/// of the same dedup key collapse into one row.
pub struct AlertSink {
    manager: Arc<ResilienceManager>,
}

impl AlertSink {
    /// Creates a sink writing through the given manager.
    pub fn new(manager: Arc<ResilienceManager>) -> Self {
        Self { manager }
    }

    /// Persists one candidate, deduplicating by its derived key.
    #[instrument(skip(self, candidate), fields(
        kind = %candidate.kind,
        source = %candidate.source,
        severity = %candidate.severity,
    ))]
    pub async fn submit(&self, candidate: &AlertCandidate) -> Result<AlertWriteOutcome> {
        let alert = Alert::from_candidate(candidate);
        let outcome = {
            let alert = alert.clone();
            self.manager
                .with_connection("upsert_alert", move |conn| {
                    let alert = alert.clone();
                    Box::pin(async move { conn.upsert_alert(&alert).await })
                })
                .await?
        };

        match outcome {
            AlertWriteOutcome::Inserted => {
                info!(dedup_key = %alert.dedup_key, "alert recorded");
            }
            AlertWriteOutcome::Refreshed => {
                debug!(dedup_key = %alert.dedup_key, "repeat detection folded into existing alert");
            }
        }
        Ok(outcome)
    }

    /// Persists a batch of contract violations.
    #[instrument(skip(self, violations), fields(count = violations.len()))]
    pub async fn record_violations(&self, violations: &[ContractViolation]) -> Result<()> {
        if violations.is_empty() {
            return Ok(());
        }
        let violations = violations.to_vec();
        self.manager
            .with_connection("insert_violations", move |conn| {
                let violations = violations.clone();
                Box::pin(async move { conn.insert_violations(&violations).await })
            })
            .await
    }

    /// Alert counts per kind since `since`, for status reporting.
    pub async fn recent_alert_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<AlertKind, u64>> {
        self.manager
            .with_connection("recent_alert_counts", move |conn| {
                Box::pin(async move { conn.recent_alert_counts(since).await })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate() -> AlertCandidate {
        AlertCandidate::new(
            AlertKind::VolumeAnomaly,
            Severity::Critical,
            "orders_history",
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(),
            "volume anomaly detected",
        )
    }

    #[test]
    fn dedup_key_is_deterministic() {
        let a = candidate();
        let b = candidate();
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn dedup_key_varies_by_kind_source_and_bucket() {
        let base = candidate();

        let mut other_kind = candidate();
        other_kind.kind = AlertKind::FreshnessAnomaly;
        assert_ne!(base.dedup_key(), other_kind.dedup_key());

        let mut other_source = candidate();
        other_source.source = "payments".to_string();
        assert_ne!(base.dedup_key(), other_source.dedup_key());

        // Same incident a day later is a new incident.
        let mut other_day = candidate();
        other_day.observed_at = Utc.with_ymd_and_hms(2024, 3, 6, 14, 30, 0).unwrap();
        assert_ne!(base.dedup_key(), other_day.dedup_key());

        // Same day, different hour: same incident.
        let mut same_day = candidate();
        same_day.observed_at = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        assert_eq!(base.dedup_key(), same_day.dedup_key());
    }

    #[test]
    fn bucket_override_controls_dedup() {
        let run_a = candidate().with_bucket("run-2024-03-05T14:00:00Z");
        let run_b = candidate().with_bucket("run-2024-03-05T15:00:00Z");
        assert_ne!(run_a.dedup_key(), run_b.dedup_key());

        let run_a_again = candidate().with_bucket("run-2024-03-05T14:00:00Z");
        assert_eq!(run_a.dedup_key(), run_a_again.dedup_key());
    }

    #[test]
    fn first_write_shape() {
        let c = candidate().with_detail("z_score", 4.0);
        let alert = Alert::from_candidate(&c);
        assert_eq!(alert.first_seen_at, c.observed_at);
        assert_eq!(alert.last_seen_at, c.observed_at);
        assert_eq!(alert.occurrences, 1);
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(alert.details.get("z_score"), Some(&Value::from(4.0)));
    }

    mod sink {
        use super::*;
        use crate::backend::memory::MemoryBackend;
        use crate::config::MonitorConfig;
        use std::sync::Arc;

        fn sink() -> (Arc<MemoryBackend>, AlertSink) {
            let backend = Arc::new(MemoryBackend::new("monitoring"));
            let manager = ResilienceManager::new(backend.clone(), &MonitorConfig::default());
            (backend, AlertSink::new(manager))
        }

        #[tokio::test]
        async fn repeat_submission_is_idempotent() {
            let (backend, sink) = sink();
            let first = candidate();
            let mut second = candidate();
            // Same incident observed again later the same day.
            second.observed_at = first.observed_at + chrono::Duration::hours(3);

            assert_eq!(
                sink.submit(&first).await.unwrap(),
                AlertWriteOutcome::Inserted
            );
            assert_eq!(
                sink.submit(&second).await.unwrap(),
                AlertWriteOutcome::Refreshed
            );

            let stored = backend.alert(&first.dedup_key()).unwrap();
            assert_eq!(backend.alert_count(), 1);
            assert_eq!(stored.first_seen_at, first.observed_at);
            assert_eq!(stored.last_seen_at, second.observed_at);
            assert_eq!(stored.occurrences, 2);
        }

        #[tokio::test]
        async fn distinct_incidents_get_distinct_rows() {
            let (backend, sink) = sink();
            let volume = candidate();
            let mut freshness = candidate();
            freshness.kind = AlertKind::FreshnessAnomaly;

            sink.submit(&volume).await.unwrap();
            sink.submit(&freshness).await.unwrap();
            assert_eq!(backend.alert_count(), 2);
        }
    }
}
