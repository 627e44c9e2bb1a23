//! Logging utilities and configuration for Vigil.
//!
//! Detection runs are chatty by nature (every retry, breaker transition, and
//! pool event is logged), so this module provides presets that keep the
//! overhead predictable, plus a subscriber installer for binaries and tests
//! that do not bring their own.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration for Vigil components.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level for Vigil components.
    pub base_level: Level,
    /// Whether to log per-record contract evaluation details.
    pub log_validation_details: bool,
    /// Whether to log backend operations (queries, pool events).
    pub log_backend_operations: bool,
    /// Emit logs as JSON instead of human-readable lines.
    pub json_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_level: Level::INFO,
            log_validation_details: false,
            log_backend_operations: true,
            json_output: false,
        }
    }
}

impl LogConfig {
    /// Verbose configuration suitable for debugging.
    pub fn verbose() -> Self {
        Self {
            base_level: Level::DEBUG,
            log_validation_details: true,
            log_backend_operations: true,
            json_output: false,
        }
    }

    /// Minimal configuration for production with the lowest overhead.
    pub fn production() -> Self {
        Self {
            base_level: Level::WARN,
            log_validation_details: false,
            log_backend_operations: false,
            json_output: true,
        }
    }

    /// Balanced configuration suitable for most use cases.
    pub fn balanced() -> Self {
        Self::default()
    }

    /// The `EnvFilter` directive this configuration translates to.
    ///
    /// `RUST_LOG` still takes precedence when set, so operators can override
    /// per-module levels without touching code.
    pub fn filter(&self) -> EnvFilter {
        let directive = format!("vigil_guard={}", self.base_level.as_str().to_lowercase());
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    }
}

/// Installs a global `tracing` subscriber for this configuration.
///
/// Intended for binaries and integration tests; libraries embedding Vigil
/// should install their own subscriber instead. Returns quietly when a
/// subscriber is already installed.
pub fn init_logging(config: &LogConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(true);

    let result = if config.json_output {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed, keeping existing one");
    }
}
