//! Backend abstraction for external data stores.
//!
//! This module defines the seam between the detection core and the external
//! stores it observes and writes to. Two traits make up the seam:
//!
//! - [`Backend`]: a connection factory for one named store. The resilience
//!   layer owns a pool of connections produced by a backend and recreates
//!   them when the store recovers from an outage.
//! - [`BackendConnection`]: the typed operation set the core needs — metric
//!   reads (volume samples, staleness, record sampling) and monitoring
//!   writes (baselines, alerts, violations).
//!
//! Implementations provided by the crate:
//!
//! - [`MemoryBackend`](memory::MemoryBackend): full in-memory implementation
//!   honoring the same upsert/idempotence contracts, with failure scripting
//!   for chaos-style testing.
//! - [`AnalyticsBackend`](analytics::AnalyticsBackend): read-side backend
//!   over an embedded DataFusion context.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alert::{Alert, AlertKind, AlertWriteOutcome};
use crate::baseline::MetricBaseline;
use crate::contract::ContractViolation;

pub mod analytics;
pub mod memory;

pub use analytics::AnalyticsBackend;
pub use memory::{FaultPlan, MemoryBackend};

/// Errors raised by backend operations.
///
/// The distinction that matters to callers is [`is_transient`](Self::is_transient):
/// transient errors enter the retry policy, everything else fails immediately.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Network-level trouble: refused, reset, or dropped connections.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The operation did not complete within its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend rejected the operation (malformed query, constraint
    /// violation outside the upsert contracts).
    #[error("query failed: {0}")]
    Query(String),

    /// The backend rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The backend does not implement this part of the operation set.
    #[error("operation '{operation}' not supported by backend '{backend}'")]
    Unsupported {
        /// Name of the backend that rejected the operation.
        backend: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// Error from the embedded query engine.
    #[error("query engine error: {0}")]
    Engine(#[from] datafusion::error::DataFusionError),

    /// Error from Arrow data handling.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

/// A type alias for `Result<T, BackendError>`.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl BackendError {
    /// Returns `true` when the failure is worth retrying.
    ///
    /// Connection-level failures and timeouts are transient; everything else
    /// (malformed queries, auth failures, unsupported operations, engine
    /// errors) will not heal on its own and fails immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Creates an unsupported-operation error for the given backend.
    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }
}

/// A runtime field value carried by observed records.
///
/// Contract validation checks these against declared field types, so the
/// variants intentionally mirror the declarable types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent / SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 text.
    Text(String),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Returns a human-readable name for the runtime type of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Text(_) => "string",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Returns `true` for [`FieldValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Renders the value for violation reports.
    pub fn display(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Integer(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Boolean(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Timestamp(v) => v.to_rfc3339(),
        }
    }
}

/// One observed record, as sampled from a source for contract validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Stable reference to the record in its source (primary key or offset).
    pub reference: String,

    /// Field values keyed by column name.
    pub fields: HashMap<String, FieldValue>,
}

impl SampleRecord {
    /// Creates a record with the given reference and no fields.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            fields: HashMap::new(),
        }
    }

    /// Adds a field to the record.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// One historical sample backing a baseline computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Start of the bucket the sample was aggregated over.
    pub bucket_start: DateTime<Utc>,

    /// The sampled value (record count for volume metrics, staleness minutes
    /// for freshness metrics).
    pub value: f64,
}

/// Aggregation bucket for volume samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleBucket {
    /// One sample per hour.
    Hourly,
    /// One sample per calendar day.
    Daily,
}

impl SampleBucket {
    /// Width of the bucket as a duration.
    pub fn width(&self) -> chrono::Duration {
        match self {
            Self::Hourly => chrono::Duration::hours(1),
            Self::Daily => chrono::Duration::days(1),
        }
    }

    /// Truncates a timestamp to the start of its bucket.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        use chrono::{Datelike, TimeZone, Timelike};
        match self {
            Self::Hourly => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
                .single()
                .unwrap_or(ts),
            Self::Daily => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
                .single()
                .unwrap_or(ts),
        }
    }
}

/// The kind of signal a metric tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Record counts per bucket compared against a volume baseline.
    Volume,
    /// Minutes since the most recent record, compared against a staleness
    /// baseline and a hard ceiling.
    Freshness,
}

/// Descriptor for one monitored metric, consumed as an already-parsed
/// structure (schema parsing is a collaborator concern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Unique metric name, also the baseline key.
    pub name: String,

    /// Source identifier (table or stream) the metric observes.
    pub source: String,

    /// What the metric measures.
    pub kind: MetricKind,

    /// Aggregation bucket for historical samples.
    pub bucket: SampleBucket,

    /// How many days of history back the baseline window.
    pub window_days: u32,
}

impl MetricDescriptor {
    /// Creates a volume metric sampled hourly over the given window.
    pub fn volume(name: impl Into<String>, source: impl Into<String>, window_days: u32) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            kind: MetricKind::Volume,
            bucket: SampleBucket::Hourly,
            window_days,
        }
    }

    /// Creates a freshness metric for the given source.
    pub fn freshness(name: impl Into<String>, source: impl Into<String>, window_days: u32) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            kind: MetricKind::Freshness,
            bucket: SampleBucket::Hourly,
            window_days,
        }
    }

    /// Sets the aggregation bucket.
    pub fn with_bucket(mut self, bucket: SampleBucket) -> Self {
        self.bucket = bucket;
        self
    }

    /// The baseline window ending at `end`.
    pub fn window_ending_at(&self, end: DateTime<Utc>) -> TimeWindow {
        TimeWindow {
            start: end - chrono::Duration::days(i64::from(self.window_days)),
            end,
        }
    }
}

/// A half-open `[start, end)` window of time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns `true` when `ts` falls within the window.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// A connection factory for one named external store.
///
/// The resilience layer calls [`connect`](Self::connect) to fill its pool and
/// again whenever the pool is reinitialized after sustained failures, so
/// implementations must tolerate repeated connect/drop cycles.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Name of the store, used in logs and error messages.
    fn name(&self) -> &str;

    /// Opens a fresh connection to the store.
    async fn connect(&self) -> BackendResult<Box<dyn BackendConnection>>;
}

/// The typed operation set executed against one pooled connection.
///
/// Monitoring writes (baselines, alerts, violations) must be atomic per key:
/// concurrent upserts of the same `metric_name` or `dedup_key` may interleave
/// in any order but never produce a partially written row. Read-only backends
/// may answer the write half with [`BackendError::Unsupported`].
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Trivial liveness probe, used by pool health monitoring.
    async fn ping(&self) -> BackendResult<()>;

    /// Historical samples for a metric over the given window, aggregated by
    /// the descriptor's bucket. Volume metrics yield per-bucket record
    /// counts; freshness metrics yield inter-arrival gaps in minutes.
    async fn metric_samples(
        &self,
        descriptor: &MetricDescriptor,
        window: &TimeWindow,
    ) -> BackendResult<Vec<MetricSample>>;

    /// Number of records in `source` observed at or after `since`.
    async fn current_volume(&self, source: &str, since: DateTime<Utc>) -> BackendResult<u64>;

    /// Timestamp of the most recent record in `source`, or `None` when the
    /// source holds no records at all.
    async fn latest_record_at(&self, source: &str) -> BackendResult<Option<DateTime<Utc>>>;

    /// Most recent records from `source`, newest first, for contract
    /// validation.
    async fn sample_records(&self, source: &str, limit: usize) -> BackendResult<Vec<SampleRecord>>;

    /// The stored baseline for a metric, if any.
    async fn fetch_baseline(&self, metric_name: &str) -> BackendResult<Option<MetricBaseline>>;

    /// Atomically replaces the baseline keyed by its `metric_name`.
    async fn upsert_baseline(&self, baseline: &MetricBaseline) -> BackendResult<()>;

    /// Upserts an alert keyed by `dedup_key`: the first write for a key
    /// inserts the row, later writes refresh `last_seen_at`/`details` and
    /// bump the occurrence count while leaving `first_seen_at` untouched.
    async fn upsert_alert(&self, alert: &Alert) -> BackendResult<AlertWriteOutcome>;

    /// Appends immutable contract violation rows.
    async fn insert_violations(&self, violations: &[ContractViolation]) -> BackendResult<()>;

    /// Alert counts per kind since the given instant, for status reporting.
    async fn recent_alert_counts(
        &self,
        since: DateTime<Utc>,
    ) -> BackendResult<HashMap<AlertKind, u64>>;
}
