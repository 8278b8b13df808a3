//! Bounded connection pool.
//!
//! A semaphore caps the number of checked-out connections; idle connections
//! wait in a LIFO queue. Checkout blocks up to the acquire timeout and then
//! fails with [`StoreError::PoolExhausted`] instead of queuing unboundedly.
//! Connections return to the pool when their [`PooledConnection`] guard is
//! dropped, so every exit path of a caller releases what it acquired.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Creates and validates pooled connections.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Connection type handed out by the pool.
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn create(&self) -> StoreResult<Self::Connection>;

    /// Validate an existing connection.
    async fn check(&self, conn: &mut Self::Connection) -> StoreResult<()>;
}

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections open at once.
    pub max_size: usize,
    /// Idle connections the maintenance task keeps open.
    pub min_idle: usize,
    /// How long checkout waits for a free slot.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed.
    pub idle_timeout: Duration,
    /// Interval of the eviction sweep.
    pub eviction_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 35,
            min_idle: 15,
            acquire_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(180),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolState {
    /// Open connections (idle + in use).
    pub size: usize,
    /// Idle connections.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Configured maximum.
    pub max_size: usize,
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct Inner<M: Manager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<M::Connection>>>,
    permits: Arc<Semaphore>,
    size: AtomicUsize,
    closed: AtomicBool,
}

impl<M: Manager> Inner<M> {
    fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConn<M::Connection>>> {
        // A panic while holding the lock cannot leave the queue inconsistent.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn give_back(&self, conn: M::Connection) {
        if self.closed.load(Ordering::Acquire) {
            self.size.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.idle_queue().push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
    }
}

/// A bounded pool of connections produced by a [`Manager`].
pub struct Pool<M: Manager> {
    inner: Arc<Inner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<M: Manager> Pool<M> {
    /// Create an empty pool. Connections are opened on demand or by [`Pool::fill`].
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(Inner {
                manager,
                config,
                idle: Mutex::new(VecDeque::new()),
                permits,
                size: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Access the connection manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub async fn get(&self) -> StoreResult<PooledConnection<M>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::PoolClosed);
        }

        let timeout = self.inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StoreError::PoolClosed),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Store pool exhausted"
                );
                return Err(StoreError::PoolExhausted(timeout));
            }
        };

        // Most recently returned first; stale ones are dropped on the way.
        let reused = loop {
            let next = self.inner.idle_queue().pop_back();
            match next {
                Some(idle) if idle.since.elapsed() < self.inner.config.idle_timeout => {
                    break Some(idle.conn);
                }
                Some(_) => {
                    self.inner.size.fetch_sub(1, Ordering::AcqRel);
                }
                None => break None,
            }
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = self.inner.manager.create().await?;
                self.inner.size.fetch_add(1, Ordering::AcqRel);
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            discard: false,
            _permit: permit,
        })
    }

    /// Open connections until `min_idle` are available.
    ///
    /// Returns the number of connections created.
    pub async fn fill(&self) -> StoreResult<usize> {
        let mut created = 0;
        while !self.inner.closed.load(Ordering::Acquire)
            && self.inner.size.load(Ordering::Acquire) < self.inner.config.min_idle
        {
            let Ok(_permit) = self.inner.permits.clone().try_acquire_owned() else {
                break;
            };
            let conn = self.inner.manager.create().await?;
            self.inner.size.fetch_add(1, Ordering::AcqRel);
            self.inner.give_back(conn);
            created += 1;
        }
        Ok(created)
    }

    /// Close idle connections older than the idle timeout, keeping `min_idle`.
    ///
    /// Returns the number of connections closed.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let min_idle = self.inner.config.min_idle;
        let mut queue = self.inner.idle_queue();
        let mut evicted = 0;
        // Oldest connections sit at the front.
        while queue.len() > min_idle {
            match queue.front() {
                Some(idle) if idle.since.elapsed() >= idle_timeout => {
                    queue.pop_front();
                    evicted += 1;
                }
                _ => break,
            }
        }
        drop(queue);
        if evicted > 0 {
            self.inner.size.fetch_sub(evicted, Ordering::AcqRel);
        }
        evicted
    }

    /// Validate one idle connection with the manager's check.
    ///
    /// A failed connection is closed and the error returned.
    pub async fn check_one(&self) -> StoreResult<()> {
        let mut conn = self.get().await?;
        let result = self.inner.manager.check(&mut conn).await;
        if result.is_err() {
            conn.discard();
        }
        result
    }

    /// Spawn the periodic eviction and refill task.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let period = self.inner.config.eviction_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;
            loop {
                timer.tick().await;
                if pool.inner.closed.load(Ordering::Acquire) {
                    break;
                }
                let evicted = pool.evict_idle();
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted idle store connections");
                }
                if let Err(e) = pool.fill().await {
                    tracing::warn!(error = %e, "Failed to refill store pool");
                }
            }
        })
    }

    /// Current occupancy.
    pub fn state(&self) -> PoolState {
        let size = self.inner.size.load(Ordering::Acquire);
        let idle = self.inner.idle_queue().len();
        PoolState {
            size,
            idle,
            in_use: size.saturating_sub(idle),
            max_size: self.inner.config.max_size,
        }
    }

    /// Close the pool: waiting and future checkouts fail, idle connections close.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let drained = {
            let mut queue = self.inner.idle_queue();
            let n = queue.len();
            queue.clear();
            n
        };
        self.inner.size.fetch_sub(drained, Ordering::AcqRel);
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection<M: Manager> {
    /// `Some` for the whole lifetime of the guard; `Drop` takes it.
    conn: Option<M::Connection>,
    pool: Arc<Inner<M>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> PooledConnection<M> {
    /// Close this connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<M: Manager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl<M: Manager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection is present until drop")
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.discard {
                self.pool.size.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.pool.give_back(conn);
            }
        }
    }
}
