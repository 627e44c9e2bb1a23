//! Circuit breaker guarding one backend.
//!
//! The breaker tracks backend *reachability*, not application success: only
//! transient failures (connection trouble, timeouts) count toward tripping
//! it, while fatal application errors prove the backend responded and reset
//! the failure streak.
//!
//! # State Machine
//!
//! ```text
//!   Closed ──(failure_threshold consecutive transient failures)──> Open
//!   Open ──(cooldown elapsed)──> HalfOpen (admits exactly one probe)
//!   HalfOpen ──(probe success)──> Closed (cooldown resets)
//!   HalfOpen ──(probe transient failure)──> Open (cooldown escalates)
//! ```
//!
//! While the breaker is open, calls fail fast without touching the pool or
//! the backend. The re-open cooldown grows by a configurable factor on each
//! consecutive re-open, capped at a maximum, and resets once a probe closes
//! the circuit.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;

/// Breaker state, stored as an atomic u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BreakerState {
    /// Normal operation: every call reaches the backend.
    Closed = 0,
    /// Tripped: calls fail fast until the cooldown elapses.
    Open = 1,
    /// Probing: a single call is allowed through to test recovery.
    HalfOpen = 2,
}

impl BreakerState {
    const fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Observable counters from the circuit breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerMetrics {
    /// Times the breaker tripped (Closed → Open).
    pub trips: u64,
    /// Times the breaker recovered (HalfOpen → Closed).
    pub resets: u64,
    /// Calls rejected while open.
    pub rejections: u64,
    /// Probe calls admitted in half-open state.
    pub probes_admitted: u64,
}

/// Circuit breaker with atomic state transitions.
///
/// Thread-safe without locks: worker tasks call [`check`](Self::check) and
/// [`record_success`](Self::record_success)/[`record_failure`](Self::record_failure)
/// concurrently. Half-open admits exactly one probe via a compare-and-swap
/// guard; concurrent callers during the probe are rejected.
pub struct CircuitBreaker {
    backend: String,
    failure_threshold: u32,
    base_cooldown: Duration,
    cooldown_growth_factor: f64,
    max_cooldown: Duration,

    /// Current state: 0=Closed, 1=Open, 2=HalfOpen.
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` when the breaker last tripped.
    tripped_at_ms: AtomicU64,
    /// Cooldown currently in force, in milliseconds (escalates on re-open).
    cooldown_ms: AtomicU64,
    /// Guard ensuring a single in-flight probe in half-open state.
    probe_in_flight: AtomicBool,
    epoch: Instant,

    trip_count: AtomicU64,
    reset_count: AtomicU64,
    rejection_count: AtomicU64,
    probe_count: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a breaker for the named backend.
    pub fn new(backend: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            failure_threshold: config.failure_threshold,
            base_cooldown: config.cooldown,
            cooldown_growth_factor: config.cooldown_growth_factor,
            max_cooldown: config.max_cooldown,
            state: AtomicU32::new(BreakerState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            tripped_at_ms: AtomicU64::new(0),
            cooldown_ms: AtomicU64::new(config.cooldown.as_millis() as u64),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
            trip_count: AtomicU64::new(0),
            reset_count: AtomicU64::new(0),
            rejection_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
        }
    }

    /// Gate to pass before touching the pool.
    ///
    /// Returns `Ok(())` when the call may proceed, or `Err(retry_after)` with
    /// the remaining cooldown when the call must fail fast. When the cooldown
    /// has elapsed this transitions Open → HalfOpen and admits the caller as
    /// the single probe.
    pub fn check(&self) -> Result<(), Duration> {
        match self.current_state() {
            BreakerState::Closed => Ok(()),

            BreakerState::Open => {
                let cooldown = Duration::from_millis(self.cooldown_ms.load(Ordering::Acquire));
                let since_trip = Duration::from_millis(
                    self.elapsed_ms()
                        .saturating_sub(self.tripped_at_ms.load(Ordering::Acquire)),
                );

                if since_trip >= cooldown {
                    // Claim the probe slot before flipping state so that a
                    // racing caller cannot slip through as a second probe.
                    if self
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state
                            .store(BreakerState::HalfOpen as u32, Ordering::Release);
                        self.probe_count.fetch_add(1, Ordering::Relaxed);
                        info!(
                            backend = %self.backend,
                            "circuit breaker cooldown elapsed, admitting probe"
                        );
                        Ok(())
                    } else {
                        self.rejection_count.fetch_add(1, Ordering::Relaxed);
                        Err(Duration::ZERO)
                    }
                } else {
                    self.rejection_count.fetch_add(1, Ordering::Relaxed);
                    Err(cooldown - since_trip)
                }
            }

            BreakerState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.probe_count.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    // A probe is already in flight; fail fast.
                    self.rejection_count.fetch_add(1, Ordering::Relaxed);
                    Err(Duration::ZERO)
                }
            }
        }
    }

    /// Records a call that reached the backend and got an answer.
    pub fn record_success(&self) {
        match self.current_state() {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                self.state
                    .store(BreakerState::Closed as u32, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
                self.cooldown_ms
                    .store(self.base_cooldown.as_millis() as u64, Ordering::Release);
                self.probe_in_flight.store(false, Ordering::Release);
                self.reset_count.fetch_add(1, Ordering::Relaxed);
                info!(backend = %self.backend, "circuit breaker closed after successful probe");
            }
            BreakerState::Open => {
                // A call admitted before the trip finished after it; ignore.
            }
        }
    }

    /// Records a transient failure against the backend.
    pub fn record_failure(&self) {
        match self.current_state() {
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.trip(self.base_cooldown);
                }
            }
            BreakerState::HalfOpen => {
                let escalated = self.escalated_cooldown();
                self.probe_in_flight.store(false, Ordering::Release);
                self.trip(escalated);
                warn!(
                    backend = %self.backend,
                    cooldown = ?escalated,
                    "probe failed, circuit breaker re-opened"
                );
            }
            BreakerState::Open => {}
        }
    }

    /// Releases the probe slot without recording an outcome.
    ///
    /// Used when an admitted probe never reached the backend (for example the
    /// pool timed out first); the next caller becomes the probe instead.
    pub fn abandon_probe(&self) {
        if self.current_state() == BreakerState::HalfOpen {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    /// Current breaker state.
    pub fn state(&self) -> BreakerState {
        self.current_state()
    }

    /// Returns `true` while calls are failing fast.
    pub fn is_open(&self) -> bool {
        self.current_state() == BreakerState::Open
    }

    /// Snapshot of observable counters.
    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            trips: self.trip_count.load(Ordering::Relaxed),
            resets: self.reset_count.load(Ordering::Relaxed),
            rejections: self.rejection_count.load(Ordering::Relaxed),
            probes_admitted: self.probe_count.load(Ordering::Relaxed),
        }
    }

    fn current_state(&self) -> BreakerState {
        BreakerState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn escalated_cooldown(&self) -> Duration {
        let current = Duration::from_millis(self.cooldown_ms.load(Ordering::Acquire));
        let grown = current.mul_f64(self.cooldown_growth_factor);
        grown.min(self.max_cooldown)
    }

    fn trip(&self, cooldown: Duration) {
        self.cooldown_ms
            .store(cooldown.as_millis() as u64, Ordering::Release);
        self.tripped_at_ms
            .store(self.elapsed_ms(), Ordering::Release);
        self.state.store(BreakerState::Open as u32, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trip_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            backend = %self.backend,
            threshold = self.failure_threshold,
            cooldown = ?cooldown,
            "circuit breaker tripped"
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.current_state())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .field("trips", &self.trip_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
