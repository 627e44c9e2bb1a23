//! Concurrent detection runs across all configured metrics and contracts.
//!
//! The [`DetectionCoordinator`] fans one task per metric/contract out over a
//! bounded worker pool, runs each task's pipeline sequentially (baseline
//! refresh before evaluation, evaluation before sinking), and folds every
//! per-task failure into the [`RunSummary`] instead of letting it abort the
//! run. The only way a run fails as a whole is a fatal condition before any
//! task starts — which is caught at construction, where the configuration is
//! validated.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::alert::{AlertSink, AlertWriteOutcome};
use crate::backend::{MetricDescriptor, MetricKind};
use crate::baseline::BaselineStore;
use crate::config::MonitorConfig;
use crate::contract::{ContractSchema, ContractValidator};
use crate::detector::AnomalyDetector;
use crate::error::Result;
use crate::resilience::ResilienceManager;

/// One failed (or skipped) metric evaluation in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricFailure {
    /// The metric or contract that failed.
    pub metric: String,
    /// Rendered failure reason.
    pub error: String,
}

/// Aggregate result of one detection run, consumed by reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks that completed their evaluation.
    pub evaluated_metrics: usize,
    /// Volume/freshness anomalies detected and sunk.
    pub anomalies_found: usize,
    /// Total contract violations detected and sunk.
    pub violations_found: usize,
    /// Per-metric failures; never aborts the rest of the run.
    pub per_metric_failures: Vec<MetricFailure>,
    /// Tasks skipped because the run deadline elapsed before they were
    /// scheduled.
    pub skipped_metrics: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// `true` when every task evaluated cleanly and nothing was detected.
    pub fn is_quiet(&self) -> bool {
        self.anomalies_found == 0
            && self.violations_found == 0
            && self.per_metric_failures.is_empty()
            && self.skipped_metrics == 0
    }
}

/// A contract validation task: which schema, sampled from which source.
#[derive(Debug, Clone)]
pub struct ContractTask {
    /// The declared schema to validate against.
    pub schema: ContractSchema,
    /// Source the records are sampled from.
    pub source: String,
}

enum TaskVerdict {
    Clean,
    Anomaly,
    Violations(usize),
    SkippedByDeadline,
    Failed(String),
}

struct TaskOutcome {
    name: String,
    verdict: TaskVerdict,
}

/// Schedules baseline refresh, anomaly detection, and contract validation
/// across all configured metrics, bounded by a fixed-size worker pool.
pub struct DetectionCoordinator {
    config: MonitorConfig,
    data: Arc<ResilienceManager>,
    store: Arc<BaselineStore>,
    sink: Arc<AlertSink>,
    detector: AnomalyDetector,
    metrics: Vec<MetricDescriptor>,
    contracts: Vec<ContractTask>,
}

impl std::fmt::Debug for DetectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionCoordinator")
            .field("metrics", &self.metrics.len())
            .field("contracts", &self.contracts.len())
            .finish_non_exhaustive()
    }
}

impl DetectionCoordinator {
    /// Creates a coordinator reading metrics through `data` and persisting
    /// baselines/alerts through `monitoring` (both may manage the same
    /// backend).
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error — before any task can run — when the
    /// configuration fails validation.
    pub fn new(
        config: MonitorConfig,
        data: Arc<ResilienceManager>,
        monitoring: Arc<ResilienceManager>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(BaselineStore::new(
            data.clone(),
            monitoring.clone(),
            &config.detection,
        ));
        let sink = Arc::new(AlertSink::new(monitoring));
        let detector = AnomalyDetector::new(&config.detection);
        Ok(Self {
            config,
            data,
            store,
            sink,
            detector,
            metrics: Vec::new(),
            contracts: Vec::new(),
        })
    }

    /// Adds a metric to every future run.
    pub fn with_metric(mut self, metric: MetricDescriptor) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Adds a contract validation task to every future run.
    pub fn with_contract(mut self, schema: ContractSchema, source: impl Into<String>) -> Self {
        self.contracts.push(ContractTask {
            schema,
            source: source.into(),
        });
        self
    }

    /// Runs detection across every configured metric and contract.
    ///
    /// Tasks run concurrently, bounded by `concurrent_workers`; there is no
    /// ordering guarantee between metrics. Within one task the pipeline is
    /// sequential: baseline refresh completes before evaluation, evaluation
    /// before sinking.
    #[instrument(skip(self), fields(
        metrics = self.metrics.len(),
        contracts = self.contracts.len(),
        workers = self.config.workers.concurrent_workers,
    ))]
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let run_started_at = Utc::now();
        let run_token = run_started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let deadline = self.config.workers.run_deadline.map(|d| started + d);

        info!(run_token = %run_token, "starting detection run");

        let permits = Arc::new(Semaphore::new(self.config.workers.concurrent_workers));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

        for metric in &self.metrics {
            let metric = metric.clone();
            let permits = permits.clone();
            let store = self.store.clone();
            let sink = self.sink.clone();
            let data = self.data.clone();
            let detector = self.detector.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return TaskOutcome {
                        name: metric.name.clone(),
                        verdict: TaskVerdict::SkippedByDeadline,
                    };
                }
                let verdict =
                    run_metric_task(&metric, &store, &sink, &data, &detector, run_started_at)
                        .await;
                TaskOutcome {
                    name: metric.name.clone(),
                    verdict,
                }
            });
        }

        for contract in &self.contracts {
            let contract = contract.clone();
            let permits = permits.clone();
            let sink = self.sink.clone();
            let data = self.data.clone();
            let sample_size = self.config.detection.contract_sample_size;
            let run_token = run_token.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                let name = contract.schema.name().to_string();
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return TaskOutcome {
                        name,
                        verdict: TaskVerdict::SkippedByDeadline,
                    };
                }
                let verdict =
                    run_contract_task(contract, &sink, &data, sample_size, run_started_at, &run_token)
                        .await;
                TaskOutcome { name, verdict }
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(error = %join_err, "detection task aborted");
                    summary.per_metric_failures.push(MetricFailure {
                        metric: "<unknown>".to_string(),
                        error: format!("task aborted: {join_err}"),
                    });
                    continue;
                }
            };
            match outcome.verdict {
                TaskVerdict::Clean => summary.evaluated_metrics += 1,
                TaskVerdict::Anomaly => {
                    summary.evaluated_metrics += 1;
                    summary.anomalies_found += 1;
                }
                TaskVerdict::Violations(count) => {
                    summary.evaluated_metrics += 1;
                    summary.violations_found += count;
                }
                TaskVerdict::SkippedByDeadline => {
                    warn!(metric = %outcome.name, "task skipped: run deadline elapsed");
                    summary.skipped_metrics += 1;
                }
                TaskVerdict::Failed(error) => {
                    warn!(metric = %outcome.name, error = %error, "metric evaluation failed");
                    summary.per_metric_failures.push(MetricFailure {
                        metric: outcome.name,
                        error,
                    });
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            evaluated = summary.evaluated_metrics,
            anomalies = summary.anomalies_found,
            violations = summary.violations_found,
            failures = summary.per_metric_failures.len(),
            skipped = summary.skipped_metrics,
            elapsed = ?summary.elapsed,
            "detection run complete"
        );
        Ok(summary)
    }

    /// Alert counts per kind over the trailing 24 hours, for status
    /// reporting.
    pub async fn recent_alert_counts(
        &self,
    ) -> Result<std::collections::HashMap<crate::alert::AlertKind, u64>> {
        self.sink
            .recent_alert_counts(Utc::now() - chrono::Duration::hours(24))
            .await
    }
}

/// Volume pipeline: refresh baseline → read current count → detect → sink.
/// Freshness pipeline: refresh staleness baseline (best effort) → read
/// latest timestamp → detect → sink.
async fn run_metric_task(
    metric: &MetricDescriptor,
    store: &BaselineStore,
    sink: &AlertSink,
    data: &ResilienceManager,
    detector: &AnomalyDetector,
    now: DateTime<Utc>,
) -> TaskVerdict {
    match metric.kind {
        MetricKind::Volume => {
            let baseline = match store.refresh_at(metric, now).await {
                Ok(baseline) => baseline,
                Err(err) => return TaskVerdict::Failed(err.to_string()),
            };

            let current = {
                let source = metric.source.clone();
                let since = now - metric.bucket.width();
                match data
                    .with_connection("current_volume", move |conn| {
                        let source = source.clone();
                        Box::pin(async move { conn.current_volume(&source, since).await })
                    })
                    .await
                {
                    Ok(count) => count,
                    Err(err) => return TaskVerdict::Failed(err.to_string()),
                }
            };

            match detector.evaluate_volume(metric, &baseline, current, now) {
                Some(candidate) => match sink.submit(&candidate).await {
                    Ok(AlertWriteOutcome::Inserted) | Ok(AlertWriteOutcome::Refreshed) => {
                        TaskVerdict::Anomaly
                    }
                    Err(err) => TaskVerdict::Failed(err.to_string()),
                },
                None => TaskVerdict::Clean,
            }
        }
        MetricKind::Freshness => {
            // Staleness baselines are best effort: too little history falls
            // back to whatever was stored before, and the hard ceiling works
            // with no baseline at all.
            let baseline = match store.refresh_at(metric, now).await {
                Ok(baseline) => Some(baseline),
                Err(err) if err.is_skip() => match store.load(&metric.name).await {
                    Ok(stored) => stored,
                    Err(err) => return TaskVerdict::Failed(err.to_string()),
                },
                Err(err) => return TaskVerdict::Failed(err.to_string()),
            };

            let latest = {
                let source = metric.source.clone();
                match data
                    .with_connection("latest_record_at", move |conn| {
                        let source = source.clone();
                        Box::pin(async move { conn.latest_record_at(&source).await })
                    })
                    .await
                {
                    Ok(latest) => latest,
                    Err(err) => return TaskVerdict::Failed(err.to_string()),
                }
            };

            match detector.evaluate_freshness(metric, baseline.as_ref(), latest, now) {
                Some(candidate) => match sink.submit(&candidate).await {
                    Ok(_) => TaskVerdict::Anomaly,
                    Err(err) => TaskVerdict::Failed(err.to_string()),
                },
                None => TaskVerdict::Clean,
            }
        }
    }
}

/// Contract pipeline: sample records → validate → sink violations + alert.
async fn run_contract_task(
    contract: ContractTask,
    sink: &AlertSink,
    data: &ResilienceManager,
    sample_size: usize,
    now: DateTime<Utc>,
    run_token: &str,
) -> TaskVerdict {
    let records = {
        let source = contract.source.clone();
        match data
            .with_connection("sample_records", move |conn| {
                let source = source.clone();
                Box::pin(async move { conn.sample_records(&source, sample_size).await })
            })
            .await
        {
            Ok(records) => records,
            Err(err) => return TaskVerdict::Failed(err.to_string()),
        }
    };

    let validator = ContractValidator::new(contract.schema);
    let report = validator.validate_batch(&records, now);
    if report.is_clean() {
        return TaskVerdict::Clean;
    }

    if let Err(err) = sink.record_violations(&report.violations).await {
        return TaskVerdict::Failed(err.to_string());
    }
    let candidate = report
        .alert_candidate(now, run_token)
        .expect("non-clean report yields a candidate");
    match sink.submit(&candidate).await {
        Ok(_) => TaskVerdict::Violations(report.total_violations()),
        Err(err) => TaskVerdict::Failed(err.to_string()),
    }
}
