//! End-to-end detection runs against the in-memory backend.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use vigil_guard::alert::AlertKind;
use vigil_guard::backend::memory::MemoryBackend;
use vigil_guard::backend::{FieldValue, MetricDescriptor};
use vigil_guard::config::MonitorConfig;
use vigil_guard::contract::{ContractSchema, FieldSpec, FieldType};
use vigil_guard::coordinator::DetectionCoordinator;
use vigil_guard::resilience::ResilienceManager;

/// Seeds `per_hour` records for each of the last `hours` full hours
/// (alternating +/- `jitter` around `per_hour` so the baseline has spread),
/// then `current` records within the last few minutes.
fn seeded_backend(hours: i64, per_hour: usize, jitter: usize, current: usize) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new("cdc"));
    let now = Utc::now();
    for h in 1..=hours {
        let count = if h % 2 == 0 {
            per_hour + jitter
        } else {
            per_hour - jitter
        };
        for i in 0..count {
            backend.seed_record(
                "orders_history",
                now - ChronoDuration::hours(h) - ChronoDuration::seconds(i as i64),
                &[
                    ("order_key", FieldValue::Text(format!("ORD-{h}-{i}"))),
                    ("total_amount", FieldValue::Float(25.0)),
                ],
            );
        }
    }
    for i in 0..current {
        backend.seed_record(
            "orders_history",
            now - ChronoDuration::minutes(i as i64 + 1),
            &[
                ("order_key", FieldValue::Text(format!("ORD-now-{i}"))),
                ("total_amount", FieldValue::Float(25.0)),
            ],
        );
    }
    backend
}

fn coordinator(backend: Arc<MemoryBackend>, config: MonitorConfig) -> DetectionCoordinator {
    let manager = ResilienceManager::new(backend, &config);
    DetectionCoordinator::new(config, manager.clone(), manager).unwrap()
}

fn order_contract() -> ContractSchema {
    ContractSchema::new("cdc_order_contract")
        .field("order_key", FieldSpec::new(FieldType::String).required())
        .field(
            "total_amount",
            FieldSpec::new(FieldType::Float)
                .required()
                .with_range(Some(0.0), Some(100_000.0)),
        )
}

#[tokio::test]
async fn volume_collapse_raises_critical_alert() {
    // Baseline ~10/hour; the current hour collapsed to 2.
    let backend = seeded_backend(48, 10, 1, 2);
    let coordinator = coordinator(backend.clone(), MonitorConfig::default()).with_metric(
        MetricDescriptor::volume("hourly_ingestion_rate", "orders_history", 7),
    );

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.evaluated_metrics, 1);
    assert_eq!(summary.anomalies_found, 1);
    assert!(summary.per_metric_failures.is_empty());

    let alerts = backend.alerts_snapshot();
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.kind, AlertKind::VolumeAnomaly);
    assert_eq!(alert.source, "orders_history");
    let z = alert.details["z_score"].as_f64().unwrap();
    assert!(z >= 3.0, "expected critical z-score, got {z}");
    assert_eq!(alert.details["direction"], "drop");
}

#[tokio::test]
async fn steady_state_run_is_quiet() {
    // Current hour matches the baseline: nothing to report.
    let backend = seeded_backend(48, 10, 1, 10);
    let coordinator = coordinator(backend.clone(), MonitorConfig::default())
        .with_metric(MetricDescriptor::volume(
            "hourly_ingestion_rate",
            "orders_history",
            7,
        ))
        .with_metric(MetricDescriptor::freshness(
            "orders_staleness",
            "orders_history",
            7,
        ))
        .with_contract(order_contract(), "orders_history");

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.evaluated_metrics, 3);
    assert_eq!(summary.anomalies_found, 0);
    assert_eq!(summary.violations_found, 0);
    assert!(summary.per_metric_failures.is_empty());
    assert_eq!(backend.alert_count(), 0);
}

#[tokio::test]
async fn stale_source_raises_freshness_alert() {
    // History exists but nothing recent: freshest record is 1 hour old.
    let backend = seeded_backend(48, 10, 1, 0);
    let coordinator = coordinator(backend.clone(), MonitorConfig::default()).with_metric(
        MetricDescriptor::freshness("orders_staleness", "orders_history", 7),
    );

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.anomalies_found, 1);

    let alerts = backend.alerts_snapshot();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::FreshnessAnomaly);
    let staleness = alerts[0].details["staleness_minutes"].as_f64().unwrap();
    assert!(staleness > 30.0);
}

#[tokio::test]
async fn bad_records_raise_contract_alert_and_violations() {
    let backend = seeded_backend(48, 10, 1, 5);
    let now = Utc::now();
    // One record with a stringly-typed amount, one with a negative amount.
    backend.seed_record(
        "orders_history",
        now,
        &[
            ("order_key", FieldValue::Text("ORD-bad-1".into())),
            ("total_amount", FieldValue::Text("59.98".into())),
        ],
    );
    backend.seed_record(
        "orders_history",
        now,
        &[
            ("order_key", FieldValue::Text("ORD-bad-2".into())),
            ("total_amount", FieldValue::Float(-12.5)),
        ],
    );

    let coordinator = coordinator(backend.clone(), MonitorConfig::default())
        .with_contract(order_contract(), "orders_history");

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.violations_found, 2);

    let violations = backend.violations();
    assert_eq!(violations.len(), 2);
    assert!(violations.iter().all(|v| v.field_name == "total_amount"));

    let alerts = backend.alerts_snapshot();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::ContractViolation);
    assert_eq!(alerts[0].source, "cdc_order_contract");
}

#[tokio::test]
async fn mixed_run_reports_all_signal_kinds() {
    // Volume collapse AND a contract violation in the same run; freshness
    // stays quiet because the bad records are recent.
    let backend = seeded_backend(48, 10, 1, 1);
    backend.seed_record(
        "orders_history",
        Utc::now(),
        &[
            ("order_key", FieldValue::Text("ORD-bad".into())),
            ("total_amount", FieldValue::Text("oops".into())),
        ],
    );

    let coordinator = coordinator(backend.clone(), MonitorConfig::default())
        .with_metric(MetricDescriptor::volume(
            "hourly_ingestion_rate",
            "orders_history",
            7,
        ))
        .with_metric(MetricDescriptor::freshness(
            "orders_staleness",
            "orders_history",
            7,
        ))
        .with_contract(order_contract(), "orders_history");

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.evaluated_metrics, 3);
    assert_eq!(summary.anomalies_found, 1);
    assert_eq!(summary.violations_found, 1);

    let counts = coordinator.recent_alert_counts().await.unwrap();
    assert_eq!(counts.get(&AlertKind::VolumeAnomaly), Some(&1));
    assert_eq!(counts.get(&AlertKind::ContractViolation), Some(&1));
    assert_eq!(counts.get(&AlertKind::FreshnessAnomaly), None);
}
