//! # Vigil - Data Observability for Rust
//!
//! Vigil is a data observability library that continuously evaluates
//! operational metrics against dynamically maintained statistical baselines,
//! raises deduplicated alerts when metrics deviate significantly, and
//! validates incoming records against declared schema contracts. Every
//! backend interaction flows through a connection-resilience layer (pooling,
//! retry with jittered backoff, circuit breaking, health-driven recovery),
//! so detection keeps working through transient store failures and degrades
//! gracefully through sustained ones.
//!
//! ## Overview
//!
//! A detection run walks every configured metric and contract concurrently:
//!
//! - **volume** metrics compare the current record count against a
//!   persisted mean/stddev baseline via Z-score;
//! - **freshness** metrics watch minutes-since-last-record, one-tailed
//!   against a staleness baseline plus a hard ceiling;
//! - **contracts** validate sampled records field-by-field (type, required,
//!   range, length, pattern, allowed values), collecting every violation.
//!
//! Detections become alerts through an idempotent sink: repeated detections
//! of the same incident fold into one row, keyed by a deterministic dedup
//! key.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use vigil_guard::prelude::*;
//! use vigil_guard::backend::memory::MemoryBackend;
//! use vigil_guard::contract::{FieldSpec, FieldType};
//!
//! # async fn example() -> vigil_guard::error::Result<()> {
//! let backend = Arc::new(MemoryBackend::new("cdc"));
//! let config = MonitorConfig::default();
//! let manager = ResilienceManager::new(backend, &config);
//! manager.spawn_health_monitor();
//!
//! let schema = ContractSchema::new("cdc_order_contract")
//!     .field("order_key", FieldSpec::new(FieldType::String).required())
//!     .field("total_amount", FieldSpec::new(FieldType::Float).required());
//!
//! let coordinator = DetectionCoordinator::new(config, manager.clone(), manager.clone())?
//!     .with_metric(MetricDescriptor::volume("hourly_ingestion_rate", "orders_history", 7))
//!     .with_metric(MetricDescriptor::freshness("orders_staleness", "orders_history", 7))
//!     .with_contract(schema, "orders_history");
//!
//! let summary = coordinator.run().await?;
//! println!(
//!     "evaluated {} metrics, {} anomalies, {} violations",
//!     summary.evaluated_metrics, summary.anomalies_found, summary.violations_found
//! );
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Pieces
//!
//! - [`resilience::ResilienceManager`]: retrying, circuit-breaking access to
//!   one pooled backend — the only way the crate touches a store.
//! - [`baseline::BaselineStore`]: Welford-based baseline computation with a
//!   minimum-sample policy and atomic upserts.
//! - [`detector::AnomalyDetector`]: Z-score classification for volume and
//!   freshness signals.
//! - [`contract::ContractValidator`]: total (non-short-circuiting) record
//!   validation against a declared schema.
//! - [`alert::AlertSink`]: exactly-one-row-per-incident alert persistence.
//! - [`coordinator::DetectionCoordinator`]: bounded-concurrency scheduling
//!   with per-metric failure isolation.
//!
//! ## Backends
//!
//! The external store sits behind the [`backend::Backend`] /
//! [`backend::BackendConnection`] traits. The crate ships an in-memory
//! reference implementation (tests, development, chaos injection) and a
//! read-side [`backend::AnalyticsBackend`] over an embedded DataFusion
//! context for file- and table-backed sources.

pub mod alert;
pub mod backend;
pub mod baseline;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod resilience;

pub use config::MonitorConfig;
pub use coordinator::{DetectionCoordinator, RunSummary};
pub use error::{GuardError, Result};
