//! Connection pool with per-connection IAM credentials.
//!
//! Every physical connection authenticates with its own freshly minted token,
//! obtained from the [`CredentialProvider`] at the moment the connection is
//! opened. Checked-out connections each hold a semaphore permit, so at most
//! `max_connections` physical connections exist at any time and no two callers
//! can ever hold the same one.
//!
//! Lifecycle of one connection:
//!
//! ```text
//! Connecting ──► InUse ──► Idle ──► InUse ──► ... ──► Closed
//!      │            │                  │
//!      └─ (failed)  └──── Errored ◄────┘ ──► Closed
//! ```
//!
//! A failed `Connecting` never produces a pooled connection.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connector::{Connector, SqlParam};
use super::credential::CredentialProvider;
use super::error::{ConnectError, PoolError, PoolFault, QueryError, ShutdownError};
use crate::error::error_chain;

/// What to do when an idle connection turns out to be broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleErrorPolicy {
    /// Evict the connection and report a [`PoolFault`] so the supervisor can
    /// stop the process.
    #[default]
    Fatal,
    /// Evict the connection, log, and keep serving.
    Evict,
}

impl FromStr for IdleErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fatal" => Ok(IdleErrorPolicy::Fatal),
            "evict" => Ok(IdleErrorPolicy::Evict),
            other => Err(format!("expected \"fatal\" or \"evict\", got {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Bounds token generation plus handshake for one new connection.
    pub connect_timeout: Option<Duration>,
    /// How long `acquire` waits for capacity before giving up.
    pub acquire_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
    /// Idle connections older than this are closed by maintenance.
    pub idle_timeout: Option<Duration>,
    pub idle_check_interval: Duration,
    pub shutdown_grace: Duration,
    pub idle_error_policy: IdleErrorPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Some(Duration::from_secs(30)),
            acquire_timeout: Some(Duration::from_secs(30)),
            query_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(10)),
            idle_check_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            idle_error_policy: IdleErrorPolicy::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Physical connections: idle, checked out, or being opened.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_connections: usize,
}

struct IdleConnection<T> {
    id: u64,
    conn: T,
    created_at: Instant,
    idle_since: Instant,
}

struct Inner<C: Connector> {
    connector: C,
    credentials: CredentialProvider,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    size: AtomicUsize,
    in_use: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    released: Notify,
    closing: watch::Sender<bool>,
    faults: mpsc::UnboundedSender<PoolFault>,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<PoolFault>>>,
}

/// Shared handle to the pool; clones refer to the same connections.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, credentials: CredentialProvider, config: PoolConfig) -> Self {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);

        info!(
            max_connections = config.max_connections,
            idle_error_policy = ?config.idle_error_policy,
            "configured database pool for IAM token authentication"
        );

        Self {
            inner: Arc::new(Inner {
                connector,
                credentials,
                permits: Arc::new(Semaphore::new(config.max_connections)),
                config,
                idle: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                released: Notify::new(),
                closing,
                faults,
                fault_rx: Mutex::new(Some(fault_rx)),
            }),
        }
    }

    /// Take the receiving end of the fault channel. Only the first call gets it.
    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<PoolFault>> {
        lock(&self.inner.fault_rx).take()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.size.load(Ordering::SeqCst),
            idle: lock(&self.inner.idle).len(),
            in_use: self.inner.in_use.load(Ordering::SeqCst),
            max_connections: self.inner.config.max_connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Check out a connection, opening a new one if none is idle.
    ///
    /// Waits for capacity when the pool is full, up to `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permits = Arc::clone(&self.inner.permits);
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, permits.acquire_owned()).await {
                Ok(permit) => permit.map_err(|_| PoolError::Closed)?,
                Err(_) => {
                    warn!(
                        waited = ?limit,
                        max_connections = self.inner.config.max_connections,
                        "database pool exhausted"
                    );
                    return Err(PoolError::Exhausted(limit));
                }
            },
            None => permits.acquire_owned().await.map_err(|_| PoolError::Closed)?,
        };

        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        while let Some(entry) = self.inner.pop_idle() {
            let stale = self
                .inner
                .config
                .idle_timeout
                .is_some_and(|limit| entry.idle_since.elapsed() >= limit);
            if stale {
                self.inner.size.fetch_sub(1, Ordering::SeqCst);
                debug!(connection_id = entry.id, "closing stale idle connection");
                self.inner.close_quietly(entry.id, entry.conn).await;
                continue;
            }
            return Ok(PooledConnection::checkout(
                Arc::clone(&self.inner),
                entry.id,
                entry.conn,
                entry.created_at,
                permit,
            ));
        }

        let slot = Slot::reserve(&self.inner.size);
        let (id, conn) = self.inner.open().await?;
        slot.commit();

        Ok(PooledConnection::checkout(
            Arc::clone(&self.inner),
            id,
            conn,
            Instant::now(),
            permit,
        ))
    }

    /// Return a connection. Errored connections are closed instead of reused.
    pub async fn release(&self, conn: PooledConnection<C>) {
        conn.release().await;
    }

    /// Acquire, run one statement, release. The connection goes back exactly
    /// once whether the statement succeeds, fails, or times out.
    pub async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<C::Row>, QueryError> {
        let mut conn = self.acquire().await?;
        let result = conn.query(sql, params).await;
        conn.release().await;
        result
    }

    /// Stop handing out connections, let checked-out ones come back (up to
    /// `shutdown_grace`), then close every idle connection.
    ///
    /// Connections returned after this point are closed on release. Calling
    /// again after the first call is a no-op.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        {
            let _idle = lock(&self.inner.idle);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                debug!("database pool already shut down");
                return Ok(());
            }
        }
        self.inner.permits.close();
        self.inner.closing.send_replace(true);

        info!(
            in_use = self.inner.in_use.load(Ordering::SeqCst),
            "closing database pool"
        );

        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let released = self.inner.released.notified();
            let in_use = self.inner.in_use.load(Ordering::SeqCst);
            if in_use == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(
                    in_use,
                    "shutdown grace period elapsed with connections still checked out"
                );
                break;
            }
        }

        let idle: Vec<_> = lock(&self.inner.idle).drain(..).collect();
        self.inner.size.fetch_sub(idle.len(), Ordering::SeqCst);

        let total = idle.len();
        let mut failed = 0;
        let mut last = None;
        for entry in idle {
            if let Err(e) = self.inner.connector.close(entry.conn).await {
                warn!(connection_id = entry.id, error = %e, "failed to close database connection");
                failed += 1;
                last = Some(e.to_string());
            }
        }

        match last {
            Some(last) => Err(ShutdownError::Close {
                failed,
                total,
                last,
            }),
            None => {
                info!(closed = total, "database pool closed");
                Ok(())
            }
        }
    }

    /// Run idle-connection maintenance every `idle_check_interval` until shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let mut closing = self.inner.closing.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.config.idle_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                if *closing.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => pool.run_maintenance().await,
                    _ = closing.changed() => break,
                }
            }
            debug!("database pool maintenance stopped");
        })
    }

    /// One maintenance pass: close expired idle connections, then ping the
    /// rest and apply the idle error policy to any that fail.
    pub async fn run_maintenance(&self) {
        if self.is_closed() {
            return;
        }

        if let Some(limit) = self.inner.config.idle_timeout {
            let expired: VecDeque<_> = {
                let mut idle = lock(&self.inner.idle);
                let (keep, expired): (VecDeque<_>, VecDeque<_>) = idle
                    .drain(..)
                    .partition(|entry| entry.idle_since.elapsed() < limit);
                *idle = keep;
                expired
            };
            if !expired.is_empty() {
                self.inner.size.fetch_sub(expired.len(), Ordering::SeqCst);
                debug!(count = expired.len(), "closing idle database connections");
            }
            for entry in expired {
                self.inner.close_quietly(entry.id, entry.conn).await;
            }
        }

        // Inspected connections hold a permit so the pool can't overshoot its
        // size while they are out of the idle set.
        let candidates = lock(&self.inner.idle).len();
        let available = candidates.min(self.inner.permits.available_permits());
        if available == 0 {
            return;
        }
        let Ok(_permits) = Arc::clone(&self.inner.permits).try_acquire_many_owned(available as u32)
        else {
            return;
        };

        let mut checking: Vec<_> = {
            let mut idle = lock(&self.inner.idle);
            let take = available.min(idle.len());
            idle.drain(..take).collect()
        };

        let mut healthy = Vec::with_capacity(checking.len());
        for mut entry in checking.drain(..) {
            let ping = self.inner.connector.ping(&mut entry.conn);
            let outcome = match self.inner.config.query_timeout {
                Some(limit) => tokio::time::timeout(limit, ping)
                    .await
                    .unwrap_or(Err(QueryError::Timeout(limit))),
                None => ping.await,
            };
            match outcome {
                Ok(()) => healthy.push(entry),
                Err(e) => self.inner.idle_error(entry, e).await,
            }
        }

        let rejected: Vec<_> = {
            let mut idle = lock(&self.inner.idle);
            if self.inner.closed.load(Ordering::SeqCst) {
                healthy
            } else {
                for entry in healthy.into_iter().rev() {
                    idle.push_front(entry);
                }
                Vec::new()
            }
        };
        self.inner.size.fetch_sub(rejected.len(), Ordering::SeqCst);
        for entry in rejected {
            self.inner.close_quietly(entry.id, entry.conn).await;
        }
    }
}

impl<C: Connector> Inner<C> {
    fn pop_idle(&self) -> Option<IdleConnection<C::Connection>> {
        lock(&self.idle).pop_back()
    }

    /// Mint a token and open one physical connection with it.
    async fn open(&self) -> Result<(u64, C::Connection), ConnectError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let attempt = async {
            let password = self.credentials.password().await?;
            self.connector.connect(password).await
        };

        let result = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or(Err(ConnectError::Timeout(limit))),
            None => attempt.await,
        };

        match result {
            Ok(conn) => {
                info!(connection_id = id, "database pool connected a client using IAM token");
                Ok((id, conn))
            }
            Err(e) => {
                warn!(connection_id = id, error = %error_chain(&e), "failed to open database connection");
                Err(e)
            }
        }
    }

    /// Put a connection back, or hand it back to the caller for closing when
    /// it is errored or the pool is shut.
    fn check_in(
        &self,
        id: u64,
        conn: C::Connection,
        created_at: Instant,
        errored: bool,
    ) -> Option<C::Connection> {
        let discarded = {
            let mut idle = lock(&self.idle);
            if errored || self.closed.load(Ordering::SeqCst) {
                Some(conn)
            } else {
                idle.push_back(IdleConnection {
                    id,
                    conn,
                    created_at,
                    idle_since: Instant::now(),
                });
                None
            }
        };

        if discarded.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
            if errored {
                warn!(connection_id = id, "discarding errored database connection");
            }
        }
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_waiters();
        discarded
    }

    async fn idle_error(&self, entry: IdleConnection<C::Connection>, err: QueryError) {
        self.size.fetch_sub(1, Ordering::SeqCst);
        let reason = err.to_string();

        match self.config.idle_error_policy {
            IdleErrorPolicy::Evict => {
                warn!(connection_id = entry.id, error = %reason, "evicting broken idle database connection");
            }
            IdleErrorPolicy::Fatal => {
                error!(connection_id = entry.id, error = %reason, "unexpected error on idle database connection");
                let fault = PoolFault::IdleConnection {
                    connection_id: entry.id,
                    reason,
                };
                if self.faults.send(fault).is_err() {
                    warn!("no supervisor is listening for database pool faults");
                }
            }
        }

        self.close_quietly(entry.id, entry.conn).await;
    }

    async fn close_quietly(&self, id: u64, conn: C::Connection) {
        if let Err(e) = self.connector.close(conn).await {
            debug!(connection_id = id, error = %e, "error while closing database connection");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts a connection being opened; uncounted again unless committed, which
/// covers both failures and a cancelled `acquire`.
struct Slot<'a> {
    size: &'a AtomicUsize,
    committed: bool,
}

impl<'a> Slot<'a> {
    fn reserve(size: &'a AtomicUsize) -> Self {
        size.fetch_add(1, Ordering::SeqCst);
        Self {
            size,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A checked-out connection. Goes back to the pool on [`release`] or drop.
///
/// [`release`]: ConnectionPool::release
pub struct PooledConnection<C: Connector> {
    pool: Arc<Inner<C>>,
    conn: Option<C::Connection>,
    id: u64,
    created_at: Instant,
    errored: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("errored", &self.errored)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    fn checkout(
        pool: Arc<Inner<C>>,
        id: u64,
        conn: C::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        Self {
            pool,
            conn: Some(conn),
            id,
            created_at,
            errored: false,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// How long ago this physical connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Force the connection to be discarded on release.
    pub fn mark_errored(&mut self) {
        self.errored = true;
    }

    /// Run one statement on this connection.
    ///
    /// Connection failures and timeouts mark the connection errored.
    pub async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<C::Row>, QueryError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(QueryError::Connection("connection already released".into()));
        };

        // Stays set if this future is dropped mid-query; the connection's
        // protocol state is unknown then.
        let was_errored = self.errored;
        self.errored = true;

        let pending = self.pool.connector.query(conn, sql, params);
        let result = match self.pool.config.query_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .unwrap_or(Err(QueryError::Timeout(limit))),
            None => pending.await,
        };

        self.errored = was_errored || matches!(&result, Err(e) if e.is_connection_error());
        result
    }

    async fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Some(conn) = self.pool.check_in(self.id, conn, self.created_at, self.errored) {
            self.pool.close_quietly(self.id, conn).await;
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(conn) = self.pool.check_in(self.id, conn, self.created_at, self.errored) else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(&self.pool);
            let id = self.id;
            runtime.spawn(async move { pool.close_quietly(id, conn).await });
        }
    }
}
