//! Common imports for working with Vigil.

pub use crate::alert::{Alert, AlertCandidate, AlertKind, AlertSink, Severity};
pub use crate::backend::{Backend, BackendConnection, MetricDescriptor, MetricKind};
pub use crate::baseline::{BaselineStore, MetricBaseline};
pub use crate::config::MonitorConfig;
pub use crate::contract::{ContractSchema, ContractValidator, FieldSpec, FieldType};
pub use crate::coordinator::{DetectionCoordinator, RunSummary};
pub use crate::detector::AnomalyDetector;
pub use crate::error::{GuardError, Result};
pub use crate::resilience::ResilienceManager;
