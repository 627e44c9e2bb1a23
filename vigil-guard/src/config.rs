//! Validated runtime configuration for the detection core.
//!
//! A [`MonitorConfig`] is constructed once at startup from already-parsed
//! values (environment/YAML loading is a collaborator concern) and passed by
//! reference to every component. [`MonitorConfig::validate`] rejects invalid
//! values before any detection task runs; a rejected configuration is the
//! only condition that fails a whole run up front.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Retry policy tunables for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each retry. Must be > 1.
    pub backoff_factor: f64,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_factor: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Connection pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept warm in the pool.
    pub pool_size: usize,
    /// Extra transient connections admitted under load.
    pub max_overflow: usize,
    /// How long a caller waits for a free connection before
    /// `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Per-operation timeout; an elapsed timeout is treated as a transient
    /// failure.
    pub call_timeout: Duration,
    /// Interval between background health probes.
    pub health_check_interval: Duration,
    /// Consecutive failed health probes before the pool is reinitialized.
    pub max_failed_health_checks: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            max_failed_health_checks: 5,
        }
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the breaker opens.
    pub failure_threshold: u32,
    /// Cooldown before a probe is admitted after opening.
    pub cooldown: Duration,
    /// Factor applied to the cooldown on each consecutive re-open.
    pub cooldown_growth_factor: f64,
    /// Upper bound on the escalated cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_growth_factor: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Detection thresholds and baseline policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Z-score at or above which an anomaly is CRITICAL.
    pub critical_z_threshold: f64,
    /// Z-score at or above which an anomaly is WARNING.
    pub warning_z_threshold: f64,
    /// Hard staleness ceiling in minutes; breaching it is CRITICAL
    /// regardless of any baseline.
    pub freshness_threshold_minutes: u32,
    /// Minimum samples required before a baseline may be (re)written.
    pub min_sample_size: usize,
    /// Records sampled per source for contract validation.
    pub contract_sample_size: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            critical_z_threshold: 3.0,
            warning_z_threshold: 2.0,
            freshness_threshold_minutes: 30,
            min_sample_size: 10,
            contract_sample_size: 100,
        }
    }
}

/// Worker pool tunables for the detection coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Detection tasks allowed to run concurrently.
    pub concurrent_workers: usize,
    /// Optional run deadline: tasks not yet scheduled when it elapses are
    /// skipped, in-flight tasks finish.
    pub run_deadline: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrent_workers: num_cpus::get().min(8),
            run_deadline: None,
        }
    }
}

/// The complete, validated configuration consumed by the detection core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Retry policy for transient backend failures.
    pub retry: RetryConfig,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Detection thresholds.
    pub detection: DetectionConfig,
    /// Worker pool settings.
    pub workers: WorkerConfig,
}

impl MonitorConfig {
    /// Validates every tunable, collecting all offending values into a
    /// single `Configuration` error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.retry.backoff_factor <= 1.0 {
            problems.push(format!(
                "retry.backoff_factor must be > 1, got {}",
                self.retry.backoff_factor
            ));
        }
        if self.retry.initial_delay.is_zero() {
            problems.push("retry.initial_delay must be > 0".to_string());
        }
        if self.retry.max_delay < self.retry.initial_delay {
            problems.push("retry.max_delay must be >= retry.initial_delay".to_string());
        }

        if self.pool.pool_size == 0 {
            problems.push("pool.pool_size must be >= 1".to_string());
        }
        if self.pool.acquire_timeout.is_zero() {
            problems.push("pool.acquire_timeout must be > 0".to_string());
        }
        if self.pool.call_timeout.is_zero() {
            problems.push("pool.call_timeout must be > 0".to_string());
        }
        if self.pool.max_failed_health_checks == 0 {
            problems.push("pool.max_failed_health_checks must be >= 1".to_string());
        }

        if self.breaker.failure_threshold == 0 {
            problems.push("breaker.failure_threshold must be >= 1".to_string());
        }
        if self.breaker.cooldown_growth_factor < 1.0 {
            problems.push(format!(
                "breaker.cooldown_growth_factor must be >= 1, got {}",
                self.breaker.cooldown_growth_factor
            ));
        }

        if self.detection.warning_z_threshold <= 0.0 {
            problems.push(format!(
                "detection.warning_z_threshold must be > 0, got {}",
                self.detection.warning_z_threshold
            ));
        }
        if self.detection.critical_z_threshold <= self.detection.warning_z_threshold {
            problems.push(format!(
                "detection.critical_z_threshold ({}) must exceed warning_z_threshold ({})",
                self.detection.critical_z_threshold, self.detection.warning_z_threshold
            ));
        }
        if self.detection.freshness_threshold_minutes == 0 {
            problems.push("detection.freshness_threshold_minutes must be >= 1".to_string());
        }
        if self.detection.min_sample_size == 0 {
            problems.push("detection.min_sample_size must be >= 1".to_string());
        }

        if self.workers.concurrent_workers == 0 {
            problems.push("workers.concurrent_workers must be >= 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GuardError::Configuration(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_escalating_backoff() {
        let mut config = MonitorConfig::default();
        config.retry.backoff_factor = 1.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_factor"));
    }

    #[test]
    fn rejects_inverted_z_thresholds() {
        let mut config = MonitorConfig::default();
        config.detection.critical_z_threshold = 1.5;
        config.detection.warning_z_threshold = 2.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("critical_z_threshold"));
    }

    #[test]
    fn collects_multiple_problems() {
        let mut config = MonitorConfig::default();
        config.pool.pool_size = 0;
        config.workers.concurrent_workers = 0;
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pool_size"));
        assert!(message.contains("concurrent_workers"));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = MonitorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: MonitorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            decoded.detection.critical_z_threshold,
            config.detection.critical_z_threshold
        );
        assert_eq!(decoded.pool.pool_size, config.pool.pool_size);
    }
}
