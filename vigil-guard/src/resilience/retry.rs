//! Exponential backoff retry policy with jitter.
//!
//! The policy is pure computation: it decides how many attempts an operation
//! gets and how long to wait between them. Actually sleeping and re-running
//! the operation is the [`ResilienceManager`](super::ResilienceManager)'s job,
//! which keeps the delay schedule testable without any I/O.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::RetryConfig;

/// Fraction of the base delay used as the jitter range.
const JITTER_FRACTION: f64 = 0.25;

/// Decides the retry schedule for transient backend failures.
///
/// The base delay for the `n`-th retry (0-indexed) is
/// `min(max_delay, initial_delay * backoff_factor^n)`, to which a jitter
/// sampled uniformly from `[0, base * 0.25]` is added so that workers
/// retrying the same outage do not synchronize.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_factor: f64,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy from validated configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_factor: config.backoff_factor,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
        }
    }

    /// Maximum number of retries after the initial attempt.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Total attempts an operation gets: the initial try plus retries.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts + 1
    }

    /// Base (jitter-free) delay before the given 0-indexed retry.
    ///
    /// Non-decreasing in `retry` and capped at the configured maximum.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry as i32);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before the given retry, with jitter applied.
    pub fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter_max = base.as_secs_f64() * JITTER_FRACTION;
        let jitter = if jitter_max > 0.0 {
            rand::rng().random_range(0.0..jitter_max)
        } else {
            0.0
        };
        base + Duration::from_secs_f64(jitter)
    }
}

/// Per-operation retry bookkeeping.
///
/// Created when an operation first fails transiently and dropped as soon as
/// the operation succeeds or exhausts its attempts.
#[derive(Debug)]
pub struct RetryContext {
    /// Attempts made so far (the initial try counts as 1).
    attempt: u32,
    /// Delay that will precede the next attempt, if one is allowed.
    next_delay: Duration,
    /// When the operation started, for duration logging.
    started_at: Instant,
}

impl RetryContext {
    /// Starts tracking a new operation; the first attempt is about to run.
    pub fn new() -> Self {
        Self {
            attempt: 0,
            next_delay: Duration::ZERO,
            started_at: Instant::now(),
        }
    }

    /// Attempts made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay that will precede the next attempt.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Elapsed time since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Records the start of an attempt.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Records a transient failure and returns the delay to sleep before the
    /// next attempt, or `None` when the attempt budget is spent.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.attempt >= policy.total_attempts() {
            return None;
        }
        // Retries are 0-indexed: the delay after the first failed attempt is
        // base_delay(0).
        let delay = policy.delay_with_jitter(self.attempt - 1);
        self.next_delay = delay;
        Some(delay)
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}
