use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::api::middleware::AppError;
use crate::services::database::{Connection, ConnectionFactory, QueryExecutor, QueryResult};

/// Statement used as the liveness probe
const VALIDATION_QUERY: &str = "SELECT 1";

/// Pause between attempts when the factory fails to open a connection
const CREATE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Connection pool configuration, fixed at construction
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connections opened by the lazy warm-up
    pub min_size: usize,
    /// Upper bound on live connections (idle + checked out)
    pub max_size: usize,
    /// Maximum time `acquire()` waits for a usable connection
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed instead of handed out
    pub idle_timeout: Duration,
    /// Connections validated more recently than this skip the liveness probe
    pub validation_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            validation_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// No usable connection materialized before the deadline
    #[error("Could not acquire connection within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("Connection pool is closed")]
    Closed,

    /// Liveness probe failed; the connection is discarded and acquisition retried
    #[error("Connection validation failed: {0}")]
    ValidationFailed(String),

    /// The factory failed; acquisition retries until the deadline
    #[error("Failed to create connection: {0}")]
    Connection(String),
}

/// Point-in-time pool snapshot
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub max_size: usize,
    pub initialized: bool,
    pub closed: bool,
}

/// One live connection plus its lifecycle timestamps.
///
/// At any moment it is either in the idle queue, inside a [`PoolGuard`], or gone.
struct PooledConnection {
    id: u64,
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used_at: Instant,
    last_validated_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledConnection>,
    /// Live connections plus reserved slots whose connection is being opened
    total: usize,
    in_use: usize,
    next_id: u64,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// One permit per checkout; bounds concurrent consumers to `max_size`
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    initialized: OnceCell<()>,
}

/// Bounded pool of validated, reusable connections.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first acquisition.
    pub fn new(factory: Arc<dyn ConnectionFactory>, mut config: PoolConfig) -> Self {
        config.min_size = config.min_size.min(config.max_size);

        tracing::info!(
            "Creating {} connection pool (min_size: {}, max_size: {}, acquire_timeout: {:?})",
            factory.database_type().as_str(),
            config.min_size,
            config.max_size,
            config.acquire_timeout
        );

        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_size)),
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                initialized: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Open the `min_size` warm-up connections exactly once.
    ///
    /// Failures are logged and tolerated; missing connections are opened on demand.
    pub async fn ensure_initialized(&self) {
        self.inner
            .initialized
            .get_or_init(|| async {
                let mut created = 0;
                for _ in 0..self.inner.config.min_size {
                    let Some(slot) = SlotReservation::try_new(&self.inner) else {
                        break;
                    };
                    match self.inner.factory.connect().await {
                        Ok(conn) => {
                            let pooled = slot.commit(conn);
                            self.inner.put_idle(pooled, false);
                            created += 1;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to create initial connection: {}", e);
                        }
                    }
                }
                tracing::info!(
                    "Connection pool initialized with {}/{} warm connections",
                    created,
                    self.inner.config.min_size
                );
            })
            .await;
    }

    /// Check out a connection, waiting up to the configured `acquire_timeout`
    pub async fn acquire(&self) -> Result<PoolGuard, PoolError> {
        self.acquire_until(Instant::now() + self.inner.config.acquire_timeout)
            .await
    }

    /// Check out a connection, giving up at `deadline`
    pub async fn acquire_until(&self, deadline: Instant) -> Result<PoolGuard, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let budget = deadline.saturating_duration_since(Instant::now());

        if tokio::time::timeout_at(deadline, self.ensure_initialized())
            .await
            .is_err()
        {
            return Err(self.exhausted(budget));
        }

        let permit = match tokio::time::timeout_at(
            deadline,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(self.exhausted(budget)),
        };

        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(self.exhausted(budget));
            }

            let idle = self.inner.state.lock().idle.pop_front();
            if let Some(mut pooled) = idle {
                if pooled.last_used_at.elapsed() > self.inner.config.idle_timeout {
                    tracing::debug!(
                        "Closing connection {} after {:?} idle",
                        pooled.id,
                        pooled.last_used_at.elapsed()
                    );
                    self.inner.destroy(pooled);
                    continue;
                }

                match tokio::time::timeout_at(deadline, self.inner.validate(&mut pooled)).await {
                    Ok(Ok(())) => return self.inner.check_out(pooled, permit),
                    Ok(Err(e)) => {
                        tracing::warn!("Discarding connection {}: {}", pooled.id, e);
                        self.inner.destroy(pooled);
                        continue;
                    }
                    Err(_) => {
                        self.inner.destroy(pooled);
                        return Err(self.exhausted(budget));
                    }
                }
            }

            let Some(slot) = SlotReservation::try_new(&self.inner) else {
                // Every slot is held by a connection on its way back to the idle queue
                tokio::time::sleep_until(deadline.min(Instant::now() + CREATE_RETRY_INTERVAL)).await;
                continue;
            };

            match tokio::time::timeout_at(deadline, self.inner.factory.connect()).await {
                Ok(Ok(conn)) => {
                    let pooled = slot.commit(conn);
                    tracing::debug!("Opened connection {}", pooled.id);
                    // close() may have run while the connect was in flight
                    return self.inner.check_out(pooled, permit);
                }
                Ok(Err(e)) => {
                    drop(slot);
                    tracing::warn!("{}", PoolError::Connection(e.to_string()));
                    tokio::time::sleep_until(deadline.min(Instant::now() + CREATE_RETRY_INTERVAL)).await;
                }
                Err(_) => return Err(self.exhausted(budget)),
            }
        }
    }

    /// Return a connection to the pool. Dropping the guard does the same.
    pub fn release(&self, guard: PoolGuard) {
        drop(guard);
    }

    /// Close the pool.
    ///
    /// Idle connections are destroyed now, checked-out ones when they are
    /// released. Per-connection close errors are logged and never fail the
    /// caller. Returns the number of connections destroyed immediately.
    pub fn close(&self) -> usize {
        let drained: Vec<PooledConnection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        // Wakes every waiter with an error
        self.inner.permits.close();

        let count = drained.len();
        for pooled in drained {
            close_quietly(pooled);
        }
        tracing::info!("Connection pool closed ({} idle connections destroyed)", count);
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.total,
            in_use: state.in_use,
            available: state.idle.len(),
            max_size: self.inner.config.max_size,
            initialized: self.inner.initialized.initialized(),
            closed: state.closed,
        }
    }

    fn exhausted(&self, budget: Duration) -> PoolError {
        let stats = self.stats();
        tracing::warn!(
            "Connection pool exhausted after {:?} (in_use: {}, max_size: {})",
            budget,
            stats.in_use,
            stats.max_size
        );
        PoolError::Exhausted { timeout: budget }
    }
}

impl PoolInner {
    async fn validate(&self, pooled: &mut PooledConnection) -> Result<(), PoolError> {
        if pooled.last_validated_at.elapsed() < self.config.validation_interval {
            return Ok(());
        }

        pooled
            .conn
            .execute(VALIDATION_QUERY)
            .await
            .map_err(|e| PoolError::ValidationFailed(e.to_string()))?;
        pooled.last_validated_at = Instant::now();
        Ok(())
    }

    /// Hand `pooled` to a caller, or destroy it if the pool closed meanwhile
    fn check_out(
        self: &Arc<Self>,
        mut pooled: PooledConnection,
        permit: OwnedSemaphorePermit,
    ) -> Result<PoolGuard, PoolError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                state.total -= 1;
                drop(state);
                close_quietly(pooled);
                return Err(PoolError::Closed);
            }
            state.in_use += 1;
        }

        pooled.last_used_at = Instant::now();
        Ok(PoolGuard {
            id: pooled.id,
            created_at: pooled.created_at,
            conn: Some(pooled),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Park a connection in the idle queue, or destroy it if the pool has closed
    fn put_idle(&self, mut pooled: PooledConnection, was_in_use: bool) {
        pooled.last_used_at = Instant::now();
        let mut state = self.state.lock();
        if was_in_use {
            state.in_use -= 1;
        }
        if state.closed {
            state.total -= 1;
            drop(state);
            close_quietly(pooled);
        } else {
            state.idle.push_back(pooled);
        }
    }

    fn destroy(&self, pooled: PooledConnection) {
        self.state.lock().total -= 1;
        close_quietly(pooled);
    }
}

fn close_quietly(pooled: PooledConnection) {
    let id = pooled.id;
    match pooled.conn.close() {
        Ok(()) => tracing::debug!("Closed connection {}", id),
        Err(e) => tracing::warn!("Error closing connection {}: {}", id, e),
    }
}

/// A counted slot for a connection that is still being opened.
///
/// Dropping it without [`SlotReservation::commit`] gives the slot back, so a
/// failed or cancelled connect never leaks capacity.
struct SlotReservation<'a> {
    inner: &'a PoolInner,
    committed: bool,
}

impl<'a> SlotReservation<'a> {
    fn try_new(inner: &'a PoolInner) -> Option<Self> {
        let mut state = inner.state.lock();
        if state.closed || state.total >= inner.config.max_size {
            return None;
        }
        state.total += 1;
        Some(Self {
            inner,
            committed: false,
        })
    }

    fn commit(mut self, conn: Box<dyn Connection>) -> PooledConnection {
        self.committed = true;
        let id = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            state.next_id
        };
        let now = Instant::now();
        PooledConnection {
            id,
            conn,
            created_at: now,
            last_used_at: now,
            last_validated_at: now,
        }
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.state.lock().total -= 1;
        }
    }
}

/// Exclusive checkout of one pooled connection.
///
/// The connection goes back to the pool when the guard is dropped, on every
/// exit path including errors and task cancellation.
pub struct PoolGuard {
    id: u64,
    created_at: Instant,
    /// Taken only by `Drop`
    conn: Option<PooledConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    /// Pool-unique identity of the underlying connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult, AppError> {
        match self.conn.as_mut() {
            Some(pooled) => pooled.conn.execute(sql).await,
            None => Err(AppError::Internal("Connection already returned to pool".to_string())),
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so the next waiter finds this connection idle
        if let Some(pooled) = self.conn.take() {
            self.pool.put_idle(pooled, true);
        }
    }
}

#[async_trait::async_trait]
impl QueryExecutor for ConnectionPool {
    async fn execute(&self, sql: &str) -> Result<QueryResult, AppError> {
        let mut conn = self.acquire().await?;
        conn.execute(sql).await
    }
}
