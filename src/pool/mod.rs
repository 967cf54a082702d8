//! Bounded connection pool.
//!
//! The pool owns up to `capacity` connections. Startup is all-or-nothing:
//! either every connection comes up or the constructor fails and disposes
//! what it built. Checkout runs a liveness probe and replaces dead
//! connections transparently; returns never block; close is idempotent
//! and wakes every waiter with a pool-closed error.
//!
//! Internally a semaphore carries one permit per available slot and a
//! mutex guards the idle list. The mutex is never held across an await.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::transport::SmtpConnection;

/// Creates, probes and disposes pooled connections.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// The pooled connection type.
    type Connection: Send + 'static;

    /// Opens a fresh connection, ready for use.
    async fn create(&self) -> SmtpResult<Self::Connection>;

    /// Probes a connection for liveness. An error means the connection
    /// must be replaced.
    async fn check(&self, conn: &mut Self::Connection) -> SmtpResult<()>;

    /// Disposes a connection, shutting it down gracefully.
    async fn dispose(&self, conn: Self::Connection);
}

struct PoolState<C> {
    idle: VecDeque<C>,
    closed: bool,
}

/// Fixed-capacity pool of connections built by a [`ConnectionManager`].
pub struct Pool<M: ConnectionManager> {
    manager: M,
    semaphore: Semaphore,
    state: Mutex<PoolState<M::Connection>>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl<M: ConnectionManager> Pool<M> {
    /// Builds the pool and opens every connection up front. If any
    /// connection fails, the ones already opened are disposed and the
    /// error is returned.
    pub async fn new(
        manager: M,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> SmtpResult<Arc<Self>> {
        if capacity == 0 {
            return Err(SmtpError::configuration("pool capacity must be positive"));
        }

        let mut idle = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            match manager.create().await {
                Ok(conn) => idle.push_back(conn),
                Err(err) => {
                    warn!(slot = i, error = %err, "pool startup failed, rolling back");
                    for conn in idle {
                        manager.dispose(conn).await;
                    }
                    return Err(err);
                }
            }
        }
        debug!(capacity, "pool ready");

        Ok(Arc::new(Self {
            manager,
            semaphore: Semaphore::new(capacity),
            state: Mutex::new(PoolState { idle, closed: false }),
            capacity,
            acquire_timeout,
        }))
    }

    /// Returns the pool capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    /// Checks a connection out of the pool.
    ///
    /// Waits up to the acquire timeout for a slot. The checked-out
    /// connection has passed a liveness probe; dead connections are
    /// disposed and replaced before being handed out. Cancellation is
    /// honored while waiting.
    pub async fn get(&self, cancel: &CancellationToken) -> SmtpResult<M::Connection> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SmtpError::cancelled()),
            acquired = timeout(self.acquire_timeout, self.semaphore.acquire()) => {
                match acquired {
                    Err(_) => {
                        return Err(SmtpError::pool(
                            SmtpErrorKind::AcquireTimeout,
                            format!(
                                "no connection available within {:?}",
                                self.acquire_timeout
                            ),
                        ))
                    }
                    Ok(Err(_)) => {
                        return Err(SmtpError::pool(SmtpErrorKind::PoolClosed, "pool is closed"))
                    }
                    Ok(Ok(permit)) => permit,
                }
            }
        };
        // The slot travels with the connection; `put` or `discard`
        // hands it back.
        permit.forget();

        let idle = self.lock_state().idle.pop_front();
        let result = match idle {
            Some(mut conn) => match self.manager.check(&mut conn).await {
                Ok(()) => Ok(conn),
                Err(err) => {
                    warn!(error = %err, "pooled connection failed probe, replacing");
                    self.manager.dispose(conn).await;
                    self.manager.create().await
                }
            },
            // The slot was emptied by an earlier failure; refill it.
            None => self.manager.create().await,
        };

        match result {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.semaphore.add_permits(1);
                Err(err)
            }
        }
    }

    /// Returns a connection to the pool. Never blocks. If the pool has
    /// closed in the meantime the connection is disposed instead.
    pub async fn put(&self, conn: M::Connection) {
        let rejected = {
            let mut state = self.lock_state();
            if state.closed {
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            }
        };

        match rejected {
            Some(conn) => self.manager.dispose(conn).await,
            None => self.semaphore.add_permits(1),
        }
    }

    /// Disposes a connection known to be broken and frees its slot. The
    /// next checkout of that slot opens a fresh connection.
    pub async fn discard(&self, conn: M::Connection) {
        self.manager.dispose(conn).await;
        if !self.lock_state().closed {
            self.semaphore.add_permits(1);
        }
    }

    /// Closes the pool: wakes all waiters with a pool-closed error and
    /// disposes every idle connection. Calling it again is a no-op.
    pub async fn close(&self) {
        let drained: Vec<M::Connection> = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };

        self.semaphore.close();
        for conn in drained {
            self.manager.dispose(conn).await;
        }
        debug!("pool closed");
    }

    /// Returns true once the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Manager producing live [`SmtpConnection`] sessions.
pub struct SmtpConnectionManager {
    config: Arc<SmtpConfig>,
}

impl SmtpConnectionManager {
    /// Creates a manager for the given server configuration.
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl ConnectionManager for SmtpConnectionManager {
    type Connection = SmtpConnection;

    async fn create(&self) -> SmtpResult<SmtpConnection> {
        SmtpConnection::establish(&self.config).await
    }

    async fn check(&self, conn: &mut SmtpConnection) -> SmtpResult<()> {
        conn.health_check().await
    }

    async fn dispose(&self, mut conn: SmtpConnection) {
        conn.close().await;
    }
}

/// Pool of live SMTP sessions.
pub type SmtpPool = Pool<SmtpConnectionManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory manager handing out numbered connections.
    struct TestManager {
        created: AtomicUsize,
        disposed: AtomicUsize,
        fail_create_at: Option<usize>,
        fail_checks: AtomicUsize,
    }

    impl TestManager {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                disposed: AtomicUsize::new(0),
                fail_create_at: None,
                fail_checks: AtomicUsize::new(0),
            }
        }

        fn failing_create_at(n: usize) -> Self {
            Self {
                fail_create_at: Some(n),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ConnectionManager for TestManager {
        type Connection = usize;

        async fn create(&self) -> SmtpResult<usize> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail_create_at == Some(n) {
                return Err(SmtpError::connection("dial failed"));
            }
            Ok(n)
        }

        async fn check(&self, _conn: &mut usize) -> SmtpResult<()> {
            let remaining = self
                .fail_checks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if remaining {
                Err(SmtpError::pool(
                    SmtpErrorKind::ConnectionUnhealthy,
                    "probe failed",
                ))
            } else {
                Ok(())
            }
        }

        async fn dispose(&self, _conn: usize) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn startup_is_all_or_nothing() {
        let err = Pool::new(TestManager::failing_create_at(2), 4, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn startup_rollback_disposes_partial_connections() {
        let manager = TestManager::failing_create_at(2);
        // Peek at the counters through a second pool attempt is not
        // possible once the manager is consumed, so count via a wrapper.
        let disposed = Arc::new(AtomicUsize::new(0));

        struct Spy {
            inner: TestManager,
            disposed: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl ConnectionManager for Spy {
            type Connection = usize;
            async fn create(&self) -> SmtpResult<usize> {
                self.inner.create().await
            }
            async fn check(&self, conn: &mut usize) -> SmtpResult<()> {
                self.inner.check(conn).await
            }
            async fn dispose(&self, conn: usize) {
                self.disposed.fetch_add(1, Ordering::SeqCst);
                self.inner.dispose(conn).await;
            }
        }

        let spy = Spy {
            inner: manager,
            disposed: disposed.clone(),
        };
        assert!(Pool::new(spy, 4, Duration::from_secs(1)).await.is_err());
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn checkout_and_return_cycle() {
        let pool = Pool::new(TestManager::new(), 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.idle_count(), 2);

        let conn = pool.get(&token()).await.unwrap();
        assert_eq!(pool.idle_count(), 1);

        pool.put(conn).await;
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_replaced_on_checkout() {
        let mut manager = TestManager::new();
        manager.fail_checks = AtomicUsize::new(1);
        let pool = Pool::new(manager, 1, Duration::from_secs(1)).await.unwrap();

        // Connection 0 fails its probe; a replacement (1) is handed out.
        let conn = pool.get(&token()).await.unwrap();
        assert_eq!(conn, 1);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded_under_load() {
        let pool = Pool::new(TestManager::new(), 3, Duration::from_secs(5))
            .await
            .unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.get(&CancellationToken::new()).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                pool.put(conn).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out_the_waiter() {
        let pool = Pool::new(TestManager::new(), 1, Duration::from_millis(100))
            .await
            .unwrap();
        let held = pool.get(&token()).await.unwrap();

        let err = pool.get(&token()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::AcquireTimeout);

        pool.put(held).await;
    }

    #[tokio::test]
    async fn cancelled_waiter_returns_promptly() {
        let pool = Pool::new(TestManager::new(), 1, Duration::from_secs(60))
            .await
            .unwrap();
        let _held = pool.get(&token()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool.get(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_checkouts() {
        let pool = Pool::new(TestManager::new(), 2, Duration::from_secs(1))
            .await
            .unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);

        let err = pool.get(&token()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
    }

    #[tokio::test]
    async fn close_wakes_pending_waiters() {
        let pool = Pool::new(TestManager::new(), 1, Duration::from_secs(60))
            .await
            .unwrap();
        let _held = pool.get(&token()).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;

        pool.close().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
    }

    #[tokio::test]
    async fn return_after_close_disposes_the_connection() {
        let pool = Pool::new(TestManager::new(), 1, Duration::from_secs(1))
            .await
            .unwrap();
        let conn = pool.get(&token()).await.unwrap();
        pool.close().await;

        pool.put(conn).await;
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn discarded_slot_is_refilled_on_next_checkout() {
        let pool = Pool::new(TestManager::new(), 1, Duration::from_secs(1))
            .await
            .unwrap();
        let conn = pool.get(&token()).await.unwrap();
        pool.discard(conn).await;

        // Fresh connection, not the disposed one.
        let conn = pool.get(&token()).await.unwrap();
        assert_eq!(conn, 1);
        pool.put(conn).await;
    }
}
