//! The connection resilience manager.
//!
//! [`ResilienceManager`] is the single entry point every other component uses
//! to touch a backend: it composes the circuit breaker gate, pool checkout,
//! a per-call timeout, and the transient retry policy around one operation
//! closure. Nothing else in the crate opens connections directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{Backend, BackendConnection, BackendError, BackendResult};
use crate::config::MonitorConfig;
use crate::error::{GuardError, Result};

use super::breaker::{BreakerMetrics, BreakerState, CircuitBreaker};
use super::pool::{ConnectionPool, PoolStatus};
use super::retry::{RetryContext, RetryPolicy};

/// Operation closure type accepted by [`ResilienceManager::with_connection`].
///
/// The closure may be invoked several times (once per retry attempt), each
/// time with a freshly checked-out connection, so it must own or clone
/// whatever state the operation needs.
pub type ConnectionOp<T> =
    dyn for<'a> Fn(&'a dyn BackendConnection) -> BoxFuture<'a, BackendResult<T>> + Send + Sync;

/// How a single attempt against the backend ended.
enum AttemptError {
    /// Worth retrying: connection trouble or a timed-out call.
    Transient(BackendError),
    /// The backend answered with a non-retryable rejection.
    Fatal(BackendError),
    /// The backend was never reached (pool exhausted or closed).
    NotAttempted(GuardError),
}

/// Retrying, circuit-breaking access to one pooled backend.
///
/// # Example
///
/// ```rust,ignore
/// use vigil_guard::resilience::ResilienceManager;
///
/// let manager = ResilienceManager::new(backend, &config);
/// manager.spawn_health_monitor();
///
/// let latest = manager
///     .with_connection("latest_record_at", |conn| {
///         Box::pin(conn.latest_record_at("orders_history"))
///     })
///     .await?;
/// ```
pub struct ResilienceManager {
    backend_name: String,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
    health_check_interval: Duration,
    max_failed_health_checks: u32,
    shutdown_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceManager {
    /// Creates a manager over the given backend with the configured policies.
    ///
    /// The health monitor is not started automatically; call
    /// [`spawn_health_monitor`](Self::spawn_health_monitor) once the manager
    /// is wrapped in its final `Arc`.
    pub fn new(backend: Arc<dyn Backend>, config: &MonitorConfig) -> Arc<Self> {
        let backend_name = backend.name().to_string();
        let (shutdown_tx, _) = watch::channel(false);
        let manager = Self {
            pool: ConnectionPool::new(backend, &config.pool),
            breaker: CircuitBreaker::new(backend_name.as_str(), &config.breaker),
            retry: RetryPolicy::new(&config.retry),
            call_timeout: config.pool.call_timeout,
            health_check_interval: config.pool.health_check_interval,
            max_failed_health_checks: config.pool.max_failed_health_checks,
            backend_name,
            shutdown_tx,
            monitor: Mutex::new(None),
        };
        info!(backend = %manager.backend_name, "resilience manager initialized");
        Arc::new(manager)
    }

    /// Name of the managed backend.
    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Executes `op` against a pooled connection, retrying transient failures.
    ///
    /// The call sequence per attempt is: circuit breaker gate → pool checkout
    /// → `op` bounded by the call timeout. Transient failures (connection
    /// trouble, timeouts) enter the retry policy and count toward the
    /// breaker; fatal backend rejections surface immediately and reset the
    /// breaker's failure streak, since the backend demonstrably answered.
    #[instrument(skip(self, op), fields(backend = %self.backend_name, operation))]
    pub async fn with_connection<T: Send>(
        &self,
        operation: &str,
        op: impl for<'a> Fn(&'a dyn BackendConnection) -> BoxFuture<'a, BackendResult<T>>
            + Send
            + Sync,
    ) -> Result<T> {
        if let Err(retry_after) = self.breaker.check() {
            debug!(operation, "call rejected by open circuit breaker");
            return Err(GuardError::CircuitOpen {
                backend: self.backend_name.clone(),
                retry_after,
            });
        }

        let mut ctx = RetryContext::new();
        loop {
            let attempt = ctx.begin_attempt();
            match self.attempt_once(&op).await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 1 {
                        info!(
                            operation,
                            attempt,
                            elapsed = ?ctx.elapsed(),
                            "operation recovered after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(AttemptError::Fatal(err)) => {
                    // The backend is reachable; the operation itself is bad.
                    self.breaker.record_success();
                    error!(operation, error = %err, "non-retryable backend failure");
                    return Err(GuardError::Backend(err));
                }
                Err(AttemptError::NotAttempted(err)) => {
                    self.breaker.abandon_probe();
                    return Err(err);
                }
                Err(AttemptError::Transient(err)) => {
                    self.breaker.record_failure();
                    match ctx.record_failure(&self.retry) {
                        Some(delay) => {
                            warn!(
                                operation,
                                attempt,
                                max_attempts = self.retry.total_attempts(),
                                delay = ?delay,
                                error = %err,
                                "transient backend failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            // Another worker may have tripped the breaker
                            // while this one slept.
                            if let Err(retry_after) = self.breaker.check() {
                                return Err(GuardError::CircuitOpen {
                                    backend: self.backend_name.clone(),
                                    retry_after,
                                });
                            }
                        }
                        None => {
                            error!(
                                operation,
                                attempts = ctx.attempt(),
                                elapsed = ?ctx.elapsed(),
                                error = %err,
                                "backend operation failed after exhausting retries"
                            );
                            return Err(GuardError::RetriesExhausted {
                                attempts: ctx.attempt(),
                                source: err,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Starts the background health monitor.
    ///
    /// The monitor periodically pings the backend through the same
    /// `with_connection` path as real traffic; after
    /// `max_failed_health_checks` consecutive failures it reinitializes the
    /// pool (drop and recreate all connections). Reinitialization is
    /// idempotent and safe while operations are in flight.
    pub fn spawn_health_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the monitor waits
            // a full interval before its first probe.
            ticker.tick().await;

            let mut consecutive_failures = 0u32;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(manager) = weak.upgrade() else { break };
                match manager
                    .with_connection("health_check", |conn| Box::pin(conn.ping()))
                    .await
                {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            info!(
                                backend = %manager.backend_name,
                                "backend health restored"
                            );
                        }
                        consecutive_failures = 0;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(
                            backend = %manager.backend_name,
                            consecutive_failures,
                            error = %err,
                            "health check failed"
                        );
                        if consecutive_failures >= manager.max_failed_health_checks {
                            error!(
                                backend = %manager.backend_name,
                                "too many failed health checks, reinitializing pool"
                            );
                            manager.pool.reinitialize();
                            consecutive_failures = 0;
                        }
                    }
                }
            }
        });
        *self.monitor.lock().expect("monitor lock poisoned") = Some(handle);
    }

    /// Current pool occupancy.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Current circuit breaker state.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Circuit breaker counters.
    pub fn breaker_metrics(&self) -> BreakerMetrics {
        self.breaker.metrics()
    }

    /// Stops the health monitor and closes pooled connections.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.monitor.lock().expect("monitor lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pool.close();
        info!(backend = %self.backend_name, "resilience manager shut down");
    }

    async fn attempt_once<T: Send>(
        &self,
        op: &(impl for<'a> Fn(&'a dyn BackendConnection) -> BoxFuture<'a, BackendResult<T>>
              + Send
              + Sync),
    ) -> std::result::Result<T, AttemptError> {
        let mut guard = match self.pool.acquire().await {
            Ok(guard) => guard,
            Err(GuardError::Backend(err)) => {
                return if err.is_transient() {
                    Err(AttemptError::Transient(err))
                } else {
                    Err(AttemptError::Fatal(err))
                };
            }
            Err(other) => return Err(AttemptError::NotAttempted(other)),
        };

        match tokio::time::timeout(self.call_timeout, op(guard.connection())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_transient() => {
                guard.discard();
                Err(AttemptError::Transient(err))
            }
            Ok(Err(err)) => Err(AttemptError::Fatal(err)),
            Err(_) => {
                guard.discard();
                Err(AttemptError::Transient(BackendError::Timeout(
                    self.call_timeout,
                )))
            }
        }
    }
}

impl std::fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("backend", &self.backend_name)
            .field("breaker", &self.breaker.state())
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::config::MonitorConfig;

    fn fast_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.retry.max_attempts = 3;
        config.retry.initial_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(50);
        config.breaker.failure_threshold = 10;
        config.pool.acquire_timeout = Duration::from_millis(100);
        config.pool.call_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_failures() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        let manager = ResilienceManager::new(backend, &fast_config());

        let result = manager
            .with_connection("ping", |conn| Box::pin(conn.ping()))
            .await;
        assert!(result.is_ok());
        assert_eq!(manager.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_two_transient_failures() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        backend.faults().inject_failures(2);
        let manager = ResilienceManager::new(backend.clone(), &fast_config());

        let result = manager
            .with_connection("ping", |conn| Box::pin(conn.ping()))
            .await;
        assert!(result.is_ok(), "operation should succeed on the third try");
        assert_eq!(backend.faults().consumed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_retries_exhausted_after_budget() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        backend.faults().inject_failures(100);
        let manager = ResilienceManager::new(backend.clone(), &fast_config());

        let err = manager
            .with_connection("ping", |conn| Box::pin(conn.ping()))
            .await
            .unwrap_err();
        match err {
            GuardError::RetriesExhausted { attempts, .. } => {
                // Initial try plus max_attempts retries.
                assert_eq!(attempts, 4);
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
        assert_eq!(backend.faults().consumed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        let manager = ResilienceManager::new(backend.clone(), &fast_config());

        let err = manager
            .with_connection("bad_query", |_conn| {
                Box::pin(async { Err::<(), _>(BackendError::Query("syntax error".to_string())) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Backend(BackendError::Query(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_touching_backend() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        backend.faults().inject_failures(100);
        let mut config = fast_config();
        config.retry.max_attempts = 0;
        config.breaker.failure_threshold = 2;
        let manager = ResilienceManager::new(backend.clone(), &config);

        for _ in 0..2 {
            let _ = manager
                .with_connection("ping", |conn| Box::pin(conn.ping()))
                .await;
        }
        assert_eq!(manager.breaker_state(), BreakerState::Open);
        let consumed_before = backend.faults().consumed();

        let err = manager
            .with_connection("ping", |conn| Box::pin(conn.ping()))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::CircuitOpen { .. }));
        // The backend was never contacted while the breaker was open.
        assert_eq!(backend.faults().consumed(), consumed_before);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_closes_after_successful_probe() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        backend.faults().inject_failures(2);
        let mut config = fast_config();
        config.retry.max_attempts = 0;
        config.breaker.failure_threshold = 2;
        config.breaker.cooldown = Duration::from_millis(20);
        let manager = ResilienceManager::new(backend.clone(), &config);

        for _ in 0..2 {
            let _ = manager
                .with_connection("ping", |conn| Box::pin(conn.ping()))
                .await;
        }
        assert_eq!(manager.breaker_state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(30)).await;

        // Faults are spent, so the probe succeeds and closes the circuit.
        let result = manager
            .with_connection("ping", |conn| Box::pin(conn.ping()))
            .await;
        assert!(result.is_ok());
        assert_eq!(manager.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_is_transient() {
        let backend = Arc::new(MemoryBackend::new("cdc"));
        backend.faults().set_latency(Duration::from_secs(10));
        let mut config = fast_config();
        config.retry.max_attempts = 1;
        let manager = ResilienceManager::new(backend, &config);

        let err = manager
            .with_connection("ping", |conn| Box::pin(conn.ping()))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::RetriesExhausted { .. }));
    }
}
