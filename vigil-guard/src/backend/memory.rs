//! In-memory backend for testing and development.
//!
//! `MemoryBackend` implements the full [`BackendConnection`] operation set —
//! including the upsert/idempotence contracts — against process-local state,
//! and doubles as the chaos-testing harness: a [`FaultPlan`] scripts
//! transient failures and artificial latency into upcoming operations so the
//! resilience layer can be exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::alert::{Alert, AlertKind, AlertWriteOutcome};
use crate::baseline::MetricBaseline;
use crate::contract::ContractViolation;

use super::{
    Backend, BackendConnection, BackendError, BackendResult, FieldValue, MetricDescriptor,
    MetricKind, MetricSample, SampleRecord, TimeWindow,
};

/// Scripted failure injection shared by every connection of a
/// [`MemoryBackend`].
///
/// Faults apply to operations (not to `connect`): each pending fault makes
/// the next operation fail with a transient connection error. An optional
/// latency is applied to every operation, which lets tests trip the
/// resilience layer's per-call timeout.
#[derive(Debug, Default)]
pub struct FaultPlan {
    inner: Mutex<FaultState>,
}

#[derive(Debug, Default)]
struct FaultState {
    pending_failures: u32,
    consumed: u64,
    latency: Option<Duration>,
}

impl FaultPlan {
    /// Makes the next `count` operations fail transiently.
    pub fn inject_failures(&self, count: u32) {
        self.inner.lock().expect("fault plan poisoned").pending_failures += count;
    }

    /// Applies an artificial delay to every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().expect("fault plan poisoned").latency = Some(latency);
    }

    /// Clears pending failures and latency.
    pub fn clear(&self) {
        let mut state = self.inner.lock().expect("fault plan poisoned");
        state.pending_failures = 0;
        state.latency = None;
    }

    /// How many injected failures have been consumed by operations.
    pub fn consumed(&self) -> u64 {
        self.inner.lock().expect("fault plan poisoned").consumed
    }

    /// Consumes one fault slot; called at the start of every operation.
    async fn apply(&self) -> BackendResult<()> {
        let latency = {
            let state = self.inner.lock().expect("fault plan poisoned");
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.inner.lock().expect("fault plan poisoned");
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            state.consumed += 1;
            return Err(BackendError::Connection(
                "injected transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    reference: String,
    at: DateTime<Utc>,
    fields: HashMap<String, FieldValue>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, Vec<StoredRecord>>,
    baselines: HashMap<String, MetricBaseline>,
    alerts: HashMap<String, Alert>,
    violations: Vec<ContractViolation>,
}

/// Full-duplex in-memory backend.
///
/// Useful for tests, development, and as the reference implementation of the
/// monitoring-store contracts (atomic per-key upserts, alert idempotence).
pub struct MemoryBackend {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultPlan>,
    record_seq: AtomicU64,
}

impl MemoryBackend {
    /// Creates an empty backend with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            faults: Arc::new(FaultPlan::default()),
            record_seq: AtomicU64::new(0),
        }
    }

    /// The fault script shared by all connections of this backend.
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Seeds one record into a source.
    pub fn seed_record(
        &self,
        source: &str,
        at: DateTime<Utc>,
        fields: &[(&str, FieldValue)],
    ) -> String {
        let seq = self.record_seq.fetch_add(1, Ordering::Relaxed);
        let reference = format!("{source}-{seq}");
        let record = StoredRecord {
            reference: reference.clone(),
            at,
            fields: fields
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        };
        self.state
            .lock()
            .expect("memory state poisoned")
            .records
            .entry(source.to_string())
            .or_default()
            .push(record);
        reference
    }

    /// Removes every record from a source.
    pub fn clear_records(&self, source: &str) {
        self.state
            .lock()
            .expect("memory state poisoned")
            .records
            .remove(source);
    }

    /// The stored baseline for a metric, if any.
    pub fn baseline(&self, metric_name: &str) -> Option<MetricBaseline> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .baselines
            .get(metric_name)
            .cloned()
    }

    /// The stored alert for a dedup key, if any.
    pub fn alert(&self, dedup_key: &str) -> Option<Alert> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .alerts
            .get(dedup_key)
            .cloned()
    }

    /// Number of distinct alert rows.
    pub fn alert_count(&self) -> usize {
        self.state.lock().expect("memory state poisoned").alerts.len()
    }

    /// All stored alert rows.
    pub fn alerts_snapshot(&self) -> Vec<Alert> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .alerts
            .values()
            .cloned()
            .collect()
    }

    /// All recorded contract violations.
    pub fn violations(&self) -> Vec<ContractViolation> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .violations
            .clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> BackendResult<Box<dyn BackendConnection>> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultPlan>,
}

impl MemoryConnection {
    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().expect("memory state poisoned");
        f(&mut state)
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn ping(&self) -> BackendResult<()> {
        self.faults.apply().await
    }

    async fn metric_samples(
        &self,
        descriptor: &MetricDescriptor,
        window: &TimeWindow,
    ) -> BackendResult<Vec<MetricSample>> {
        self.faults.apply().await?;
        let samples = self.with_state(|state| {
            let records = state
                .records
                .get(&descriptor.source)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut timestamps: Vec<DateTime<Utc>> = records
                .iter()
                .filter(|r| window.contains(r.at))
                .map(|r| r.at)
                .collect();
            timestamps.sort_unstable();

            match descriptor.kind {
                MetricKind::Volume => {
                    // Per-bucket counts; buckets without records yield no
                    // sample, matching GROUP BY aggregation semantics.
                    let mut counts: HashMap<DateTime<Utc>, u64> = HashMap::new();
                    for ts in &timestamps {
                        *counts.entry(descriptor.bucket.truncate(*ts)).or_default() += 1;
                    }
                    let mut samples: Vec<MetricSample> = counts
                        .into_iter()
                        .map(|(bucket_start, count)| MetricSample {
                            bucket_start,
                            value: count as f64,
                        })
                        .collect();
                    samples.sort_unstable_by_key(|s| s.bucket_start);
                    samples
                }
                MetricKind::Freshness => timestamps
                    .windows(2)
                    .map(|pair| MetricSample {
                        bucket_start: pair[1],
                        value: (pair[1] - pair[0]).num_seconds() as f64 / 60.0,
                    })
                    .collect(),
            }
        });
        debug!(count = samples.len(), "served metric samples");
        Ok(samples)
    }

    async fn current_volume(&self, source: &str, since: DateTime<Utc>) -> BackendResult<u64> {
        self.faults.apply().await?;
        Ok(self.with_state(|state| {
            state
                .records
                .get(source)
                .map(|records| records.iter().filter(|r| r.at >= since).count() as u64)
                .unwrap_or(0)
        }))
    }

    async fn latest_record_at(&self, source: &str) -> BackendResult<Option<DateTime<Utc>>> {
        self.faults.apply().await?;
        Ok(self.with_state(|state| {
            state
                .records
                .get(source)
                .and_then(|records| records.iter().map(|r| r.at).max())
        }))
    }

    async fn sample_records(&self, source: &str, limit: usize) -> BackendResult<Vec<SampleRecord>> {
        self.faults.apply().await?;
        Ok(self.with_state(|state| {
            let mut records: Vec<StoredRecord> = state
                .records
                .get(source)
                .map(|records| records.to_vec())
                .unwrap_or_default();
            records.sort_unstable_by_key(|r| std::cmp::Reverse(r.at));
            records
                .into_iter()
                .take(limit)
                .map(|r| SampleRecord {
                    reference: r.reference,
                    fields: r.fields,
                })
                .collect()
        }))
    }

    async fn fetch_baseline(&self, metric_name: &str) -> BackendResult<Option<MetricBaseline>> {
        self.faults.apply().await?;
        Ok(self.with_state(|state| state.baselines.get(metric_name).cloned()))
    }

    async fn upsert_baseline(&self, baseline: &MetricBaseline) -> BackendResult<()> {
        self.faults.apply().await?;
        self.with_state(|state| {
            state
                .baselines
                .insert(baseline.metric_name.clone(), baseline.clone());
        });
        Ok(())
    }

    async fn upsert_alert(&self, alert: &Alert) -> BackendResult<AlertWriteOutcome> {
        self.faults.apply().await?;
        Ok(self.with_state(|state| {
            match state.alerts.get_mut(&alert.dedup_key) {
                Some(existing) => {
                    // Repeat detection: refresh everything except the
                    // immutable first_seen_at.
                    existing.last_seen_at = alert.last_seen_at;
                    existing.severity = alert.severity;
                    existing.description = alert.description.clone();
                    existing.details = alert.details.clone();
                    existing.occurrences += 1;
                    AlertWriteOutcome::Refreshed
                }
                None => {
                    state.alerts.insert(alert.dedup_key.clone(), alert.clone());
                    AlertWriteOutcome::Inserted
                }
            }
        }))
    }

    async fn insert_violations(&self, violations: &[ContractViolation]) -> BackendResult<()> {
        self.faults.apply().await?;
        self.with_state(|state| state.violations.extend_from_slice(violations));
        Ok(())
    }

    async fn recent_alert_counts(
        &self,
        since: DateTime<Utc>,
    ) -> BackendResult<HashMap<AlertKind, u64>> {
        self.faults.apply().await?;
        Ok(self.with_state(|state| {
            let mut counts: HashMap<AlertKind, u64> = HashMap::new();
            for alert in state.alerts.values() {
                if alert.last_seen_at >= since {
                    *counts.entry(alert.kind).or_default() += 1;
                }
            }
            counts
        }))
    }
}
