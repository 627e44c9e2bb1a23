//! Bounded connection pool with overflow and generation-based recovery.
//!
//! The pool keeps up to `pool_size` idle connections warm and admits up to
//! `pool_size + max_overflow` concurrent checkouts; overflow connections are
//! closed on return instead of parked. Callers wait up to the acquire
//! timeout for a permit and then fail with
//! [`GuardError::PoolExhausted`](crate::error::GuardError::PoolExhausted).
//!
//! Recovery never coordinates with in-flight operations: reinitializing the
//! pool bumps a generation counter and drains the idle list, so connections
//! checked out before the bump finish their work normally and are simply
//! dropped on return instead of being parked for reuse.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendConnection, BackendResult};
use crate::config::PoolConfig;
use crate::error::{GuardError, Result};

/// Snapshot of pool occupancy for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Maximum parked connections.
    pub pool_size: usize,
    /// Extra transient checkouts allowed under load.
    pub max_overflow: usize,
    /// Connections currently checked out.
    pub checked_out: usize,
    /// Connections currently parked.
    pub idle: usize,
    /// Total connections opened over the pool's lifetime.
    pub total_connects: u64,
    /// Pool generation; increments on every reinitialization.
    pub generation: u64,
}

struct IdleConnection {
    conn: Box<dyn BackendConnection>,
    generation: u64,
}

struct PoolInner {
    backend: Arc<dyn Backend>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    generation: AtomicU64,
    checked_out: AtomicUsize,
    total_connects: AtomicU64,
    pool_size: usize,
    max_overflow: usize,
    acquire_timeout: Duration,
}

impl PoolInner {
    fn release(&self, conn: Box<dyn BackendConnection>, generation: u64, reusable: bool) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
        if !reusable || generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock().expect("pool idle lock poisoned");
        if idle.len() < self.pool_size {
            idle.push(IdleConnection { conn, generation });
        }
        // Overflow connections fall out of scope here and close.
    }
}

/// Bounded pool of connections to one backend.
///
/// `ConnectionPool` is a cheap handle over shared state; checked-out
/// [`PooledConnection`]s keep that state alive, so guards stay valid even if
/// the handle is dropped first.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool over the given backend.
    pub fn new(backend: Arc<dyn Backend>, config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                permits: Arc::new(Semaphore::new(config.pool_size + config.max_overflow)),
                idle: Mutex::new(Vec::with_capacity(config.pool_size)),
                generation: AtomicU64::new(0),
                checked_out: AtomicUsize::new(0),
                total_connects: AtomicU64::new(0),
                pool_size: config.pool_size,
                max_overflow: config.max_overflow,
                acquire_timeout: config.acquire_timeout,
            }),
        }
    }

    /// Checks a connection out of the pool.
    ///
    /// Waits up to the acquire timeout for a free slot, then reuses a parked
    /// connection or opens a fresh one. Connect failures propagate as
    /// [`BackendError`](crate::backend::BackendError)s wrapped in the guard
    /// error, entering the caller's retry policy when transient.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let permit = match tokio::time::timeout(
            inner.acquire_timeout,
            Arc::clone(&inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GuardError::internal("connection pool is closed"));
            }
            Err(_) => {
                warn!(
                    backend = inner.backend.name(),
                    waited = ?inner.acquire_timeout,
                    "connection pool exhausted"
                );
                return Err(GuardError::PoolExhausted {
                    waited: inner.acquire_timeout,
                });
            }
        };

        let generation = inner.generation.load(Ordering::Acquire);
        let parked = {
            let mut idle = inner.idle.lock().expect("pool idle lock poisoned");
            let mut live = None;
            // Stale-generation connections were invalidated by a
            // reinitialization; drop them instead of handing them out.
            while let Some(candidate) = idle.pop() {
                if candidate.generation == generation {
                    live = Some(candidate);
                    break;
                }
            }
            live
        };

        let conn = match parked {
            Some(parked) => parked.conn,
            None => self.open_connection().await?,
        };

        inner.checked_out.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            generation,
            reusable: true,
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Invalidates every pooled connection and starts a fresh generation.
    ///
    /// Idempotent and safe while operations are in flight: checked-out
    /// connections complete or fail on their own and are dropped on return.
    pub fn reinitialize(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let drained = {
            let mut idle = self.inner.idle.lock().expect("pool idle lock poisoned");
            std::mem::take(&mut *idle)
        };
        info!(
            backend = self.inner.backend.name(),
            generation,
            dropped = drained.len(),
            "connection pool reinitialized"
        );
    }

    /// Drops every idle connection. Checked-out connections are dropped on
    /// return because their generation no longer matches.
    pub fn close(&self) {
        self.reinitialize();
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pool_size: self.inner.pool_size,
            max_overflow: self.inner.max_overflow,
            checked_out: self.inner.checked_out.load(Ordering::Relaxed),
            idle: self
                .inner
                .idle
                .lock()
                .expect("pool idle lock poisoned")
                .len(),
            total_connects: self.inner.total_connects.load(Ordering::Relaxed),
            generation: self.inner.generation.load(Ordering::Relaxed),
        }
    }

    async fn open_connection(&self) -> BackendResult<Box<dyn BackendConnection>> {
        let conn = self.inner.backend.connect().await?;
        self.inner.total_connects.fetch_add(1, Ordering::Relaxed);
        debug!(
            backend = self.inner.backend.name(),
            "opened backend connection"
        );
        Ok(conn)
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn BackendConnection>>,
    generation: u64,
    reusable: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("generation", &self.generation)
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// The underlying backend connection.
    pub fn connection(&self) -> &dyn BackendConnection {
        self.conn
            .as_deref()
            .expect("connection taken out of guard before drop")
    }

    /// Marks the connection as broken so it is closed instead of parked.
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation, self.reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn pool_config(size: usize, overflow: usize) -> PoolConfig {
        PoolConfig {
            pool_size: size,
            max_overflow: overflow,
            acquire_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        }
    }

    fn pool(size: usize, overflow: usize) -> ConnectionPool {
        let backend = Arc::new(MemoryBackend::new("test"));
        ConnectionPool::new(backend, &pool_config(size, overflow))
    }

    #[tokio::test]
    async fn reuses_parked_connections() {
        let pool = pool(2, 0);
        {
            let conn = pool.acquire().await.unwrap();
            conn.connection().ping().await.unwrap();
        }
        assert_eq!(pool.status().idle, 1);

        let _conn = pool.acquire().await.unwrap();
        // The parked connection was reused rather than a second one opened.
        assert_eq!(pool.status().total_connects, 1);
    }

    #[tokio::test]
    async fn overflow_connections_are_not_parked() {
        let pool = pool(1, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.status().checked_out, 3);

        drop(a);
        drop(b);
        drop(c);
        // Only pool_size connections are kept warm.
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn exhaustion_times_out_with_pool_exhausted() {
        let pool = pool(1, 0);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, GuardError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn reinitialize_drops_idle_and_stale_returns() {
        let pool = pool(2, 0);
        let held = pool.acquire().await.unwrap();
        {
            let parked = pool.acquire().await.unwrap();
            drop(parked);
        }
        assert_eq!(pool.status().idle, 1);

        pool.reinitialize();
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().generation, 1);

        // The connection checked out before the bump is dropped on return,
        // not parked.
        drop(held);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().checked_out, 0);
    }

    #[tokio::test]
    async fn discarded_connections_are_not_parked() {
        let pool = pool(2, 0);
        let mut conn = pool.acquire().await.unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.status().idle, 0);
    }
}
