//! The connection pool and its consumer-facing guards.
//!
//! [`Pool`] is a cheaply clonable handle over shared state. Connections are
//! checked out as [`PooledConnection`] guards that behave like a raw driver
//! connection, except that closing (or dropping) one returns the underlying
//! connection to the pool instead of destroying it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Prepared;
use crate::conn::ManagedConn;
use crate::driver::{
    Driver, DriverError, FetchDirection, PhysicalStatement, ResultSetConcurrency, ResultSetType,
};
use crate::isolation::TransactionIsolation;
use crate::reference::PoolReference;
use crate::tx::{Transaction, TransactionResource};

pub(crate) mod inner;
mod metrics;
mod options;

pub use self::metrics::PoolStatus;
pub use self::options::{CheckLevel, PoolOptions, POOL_MAX_UNBOUNDED};

use self::inner::PoolInner;

const RELEASED: &str = "(bug) connection already released to pool";

/// A pool of database connections.
///
/// The pool arbitrates a bounded set of physical connections: it revalidates
/// and reuses idle ones, opens new ones while under the cap, parks callers
/// when saturated, and keeps every acquisition inside one global transaction
/// on the same physical connection.
pub struct Pool(Arc<PoolInner>);

impl Pool {
    /// Returns a [`PoolOptions`] builder.
    pub fn builder() -> PoolOptions {
        PoolOptions::new()
    }

    /// Opens a pool with the default configuration.
    pub fn open(driver: Arc<dyn Driver>, url: &str) -> crate::Result<Self> {
        PoolOptions::new().open(driver, url)
    }

    pub(crate) fn new_with(
        driver: Arc<dyn Driver>,
        url: &str,
        options: PoolOptions,
    ) -> crate::Result<Self> {
        Ok(Pool(PoolInner::new_arc(driver, url, options)?))
    }

    /// Retrieves a connection, enlisting it into the ambient transaction if
    /// the configured transaction manager reports one.
    pub fn get_connection(&self) -> crate::Result<PooledConnection> {
        let tx = self.0.ambient_tx();
        self.acquire(tx)
    }

    /// Credential-carrying variant of [`get_connection`][Self::get_connection].
    /// The pool is configured per datasource, so per-call credentials do not
    /// re-key pooled physical connections.
    pub fn get_connection_as(
        &self,
        username: &str,
        _password: &str,
    ) -> crate::Result<PooledConnection> {
        log::debug!(
            target: "aquifer::pool",
            "per-call credentials for {username:?} do not re-key pooled connections"
        );
        self.get_connection()
    }

    /// Retrieves a connection with its transactional facets exposed, for
    /// callers that do their own enlistment and completion handling.
    pub fn get_xa_connection(&self) -> crate::Result<XaConnection> {
        Ok(XaConnection {
            inner: self.get_connection()?,
        })
    }

    /// Credential-carrying variant of
    /// [`get_xa_connection`][Self::get_xa_connection].
    pub fn get_xa_connection_as(
        &self,
        username: &str,
        password: &str,
    ) -> crate::Result<XaConnection> {
        Ok(XaConnection {
            inner: self.get_connection_as(username, password)?,
        })
    }

    /// Retrieves a connection reserved for `tx` (or untransacted when
    /// `None`). All acquisitions within one transaction return the same
    /// underlying connection until the transaction completes.
    pub fn acquire(&self, tx: Option<Arc<dyn Transaction>>) -> crate::Result<PooledConnection> {
        let conn = self.0.acquire(tx)?;

        Ok(PooledConnection {
            _pool: Arc::clone(&self.0),
            conn: Some(conn),
        })
    }

    /// Diagnostic probe: runs `sql` on a free connection, or on a scratch
    /// connection when none is idle. Returns the driver's error when the
    /// probe fails.
    pub fn check_connection(&self, sql: &str) -> crate::Result<()> {
        self.0.check_connection(sql)
    }

    /// Runs one housekeeping pass: evict aged idles, reclaim leaks, honor a
    /// lowered cap, grow to the floor. Also runs periodically in the
    /// background.
    pub fn adjust(&self) {
        self.0.adjust();
    }

    /// Rolls the sampling-period counters into their "recent" snapshots.
    /// Also runs periodically in the background.
    pub fn sample(&self) {
        self.0.sample();
    }

    /// Raise or lower the kept-warm floor; takes effect immediately.
    pub fn set_pool_min(&self, pool_min: u32) {
        self.0.set_pool_min(pool_min);
    }

    /// Raise or lower the connection cap; negative means unbounded. Excess
    /// idle connections are shed immediately, busy ones as they come back.
    pub fn set_pool_max(&self, pool_max: i64) {
        self.0.set_pool_max(pool_max);
    }

    /// Destroys every pooled connection and refuses all future acquires.
    /// Parked callers are woken and fail with
    /// [`Error::PoolClosed`](crate::Error::PoolClosed).
    pub fn shutdown(&self) {
        self.0.shutdown();
    }

    /// Point-in-time counters and gauges.
    pub fn status(&self) -> PoolStatus {
        self.0.status()
    }

    /// Returns the number of connections currently managed by the pool.
    pub fn size(&self) -> u32 {
        self.0.size()
    }

    /// Returns the number of idle connections.
    pub fn idle(&self) -> u32 {
        self.0.num_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn url(&self) -> &str {
        self.0.url()
    }

    /// Name the pool was configured with, if any.
    pub fn name(&self) -> Option<&str> {
        self.0.options.name.as_deref()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.0.options
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.0
    }

    /// Serializes this pool's configuration into a name-bindable reference.
    /// Fails when the pool has no name.
    pub fn reference(&self) -> crate::Result<PoolReference> {
        PoolReference::export(self)
    }
}

/// Returns a new [`Pool`] tied to the same shared state.
impl Clone for Pool {
    fn clone(&self) -> Self {
        Pool(Arc::clone(&self.0))
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("url", &self.url())
            .field("size", &self.size())
            .field("num_idle", &self.idle())
            .field("is_closed", &self.is_closed())
            .field("options", self.options())
            .finish()
    }
}

/// A connection checked out of a [`Pool`].
///
/// Behaves like the raw driver connection it wraps; [`close`][Self::close]
/// (or dropping the guard) returns the connection to the pool. Driver errors
/// surfaced through this guard are propagated to the caller and also
/// reported to the pool, which quarantines the connection.
pub struct PooledConnection {
    /// Keeps the allocator (and its maintenance thread) alive while guards
    /// are out; events reach it through the connection's back reference.
    _pool: Arc<PoolInner>,
    conn: Option<Arc<ManagedConn>>,
}

impl PooledConnection {
    fn conn(&self) -> &Arc<ManagedConn> {
        self.conn.as_ref().expect(RELEASED)
    }

    /// Pool-assigned identifier of the underlying managed connection.
    pub fn id(&self) -> u64 {
        self.conn().id()
    }

    /// Prepare `sql` with default result-set characteristics, consulting the
    /// per-connection statement cache.
    pub fn prepare(&self, sql: &str) -> crate::Result<PooledStatement> {
        self.prepare_with(sql, ResultSetType::default(), ResultSetConcurrency::default())
    }

    /// Prepare `sql` with explicit result-set characteristics.
    pub fn prepare_with(
        &self,
        sql: &str,
        rs_type: ResultSetType,
        rs_concurrency: ResultSetConcurrency,
    ) -> crate::Result<PooledStatement> {
        let conn = self.conn();

        match conn.prepare(sql, rs_type, rs_concurrency) {
            Ok(Prepared::Cached { .. }) => Ok(PooledStatement {
                conn: Arc::clone(conn),
                target: StatementTarget::Cached {
                    sql: sql.to_owned(),
                    closed: false,
                },
            }),
            Ok(Prepared::OneShot(stmt)) => Ok(PooledStatement {
                conn: Arc::clone(conn),
                target: StatementTarget::OneShot { stmt: Some(stmt) },
            }),
            Err(err) => {
                conn.notify_error(&err);
                Err(err.into())
            }
        }
    }

    /// Prepare, execute, and close in one step; returns the affected row
    /// count.
    pub fn execute(&self, sql: &str) -> crate::Result<u64> {
        let mut stmt = self.prepare(sql)?;
        stmt.execute()
    }

    pub fn commit(&self) -> crate::Result<()> {
        self.driver_call(|conn| conn.commit())
    }

    pub fn rollback(&self) -> crate::Result<()> {
        self.driver_call(|conn| conn.rollback())
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> crate::Result<()> {
        self.driver_call(|conn| conn.set_auto_commit(auto_commit))
    }

    pub fn set_transaction_isolation(
        &self,
        isolation: TransactionIsolation,
    ) -> crate::Result<()> {
        self.driver_call(|conn| conn.set_transaction_isolation(isolation))
    }

    /// Whether the driver reports the underlying physical session closed.
    pub fn is_closed(&self) -> bool {
        !self.conn().is_open()
    }

    /// Returns the connection to the pool.
    pub fn close(mut self) {
        self.release();
    }

    fn driver_call<R>(
        &self,
        f: impl FnOnce(&ManagedConn) -> Result<R, DriverError>,
    ) -> crate::Result<R> {
        let conn = self.conn();

        match f(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                conn.notify_error(&err);
                Err(err.into())
            }
        }
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.notify_close();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(|c| c.id()))
            .finish()
    }
}

enum StatementTarget {
    /// Tracked by the owning connection's statement cache under its SQL key.
    Cached { sql: String, closed: bool },
    /// Owned outright; caching was disabled or bypassed.
    OneShot { stmt: Option<Box<dyn PhysicalStatement>> },
}

/// A prepared statement checked out of a pooled connection.
///
/// Closing (or dropping) the guard hands the statement back to the
/// per-connection cache; the physical handle is only closed when the cache
/// evicts it.
pub struct PooledStatement {
    conn: Arc<ManagedConn>,
    target: StatementTarget,
}

impl PooledStatement {
    /// Execute the prepared text, returning the affected row count.
    pub fn execute(&mut self) -> crate::Result<u64> {
        self.with_target(false, |stmt| stmt.execute())
    }

    /// Execute a different SQL text through this statement handle. Marks the
    /// statement dirty: its mutated properties are reset on the next cache
    /// reuse.
    pub fn execute_sql(&mut self, sql: &str) -> crate::Result<u64> {
        self.with_target(true, |stmt| stmt.execute_sql(sql))
    }

    pub fn add_batch(&mut self) -> crate::Result<()> {
        self.with_target(true, |stmt| stmt.add_batch())
    }

    pub fn clear_batch(&mut self) -> crate::Result<()> {
        self.with_target(false, |stmt| {
            stmt.clear_batch();
            Ok(())
        })
    }

    pub fn clear_parameters(&mut self) -> crate::Result<()> {
        self.with_target(false, |stmt| {
            stmt.clear_parameters();
            Ok(())
        })
    }

    pub fn set_fetch_direction(&mut self, direction: FetchDirection) -> crate::Result<()> {
        self.with_target(true, |stmt| stmt.set_fetch_direction(direction))
    }

    pub fn set_fetch_size(&mut self, rows: u32) -> crate::Result<()> {
        self.with_target(true, |stmt| stmt.set_fetch_size(rows))
    }

    pub fn set_max_field_size(&mut self, bytes: u32) -> crate::Result<()> {
        self.with_target(true, |stmt| stmt.set_max_field_size(bytes))
    }

    pub fn set_max_rows(&mut self, rows: u32) -> crate::Result<()> {
        self.with_target(true, |stmt| stmt.set_max_rows(rows))
    }

    pub fn set_query_timeout(&mut self, timeout: Duration) -> crate::Result<()> {
        self.with_target(true, |stmt| stmt.set_query_timeout(timeout))
    }

    /// Hands the statement back; cached entries stay cached for reuse.
    pub fn close(mut self) {
        self.shut();
    }

    fn with_target<R>(
        &mut self,
        dirties: bool,
        f: impl FnOnce(&mut dyn PhysicalStatement) -> Result<R, DriverError>,
    ) -> crate::Result<R> {
        let result = match &mut self.target {
            StatementTarget::Cached { sql, closed } => {
                if *closed {
                    Err(DriverError::new("prepared statement has been closed"))
                } else {
                    match self.conn.with_cached_statement(sql, |entry| {
                        if dirties {
                            entry.mark_dirty();
                        }
                        f(entry.stmt_mut())
                    }) {
                        Some(result) => result,
                        // Evicted underneath us; only possible after this
                        // handle (or a double-use sibling) closed it.
                        None => Err(DriverError::new("prepared statement has been closed")),
                    }
                }
            }
            StatementTarget::OneShot { stmt } => match stmt.as_mut() {
                Some(stmt) => f(stmt.as_mut()),
                None => Err(DriverError::new("prepared statement has been closed")),
            },
        };

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.conn.notify_error(&err);
                Err(err.into())
            }
        }
    }

    fn shut(&mut self) {
        match &mut self.target {
            StatementTarget::Cached { sql, closed } => {
                if !*closed {
                    *closed = true;
                    self.conn.statement_closed(sql);
                }
            }
            StatementTarget::OneShot { stmt } => {
                if let Some(mut stmt) = stmt.take() {
                    if let Err(err) = stmt.close() {
                        log::debug!(
                            target: "aquifer::pool",
                            "error closing one-shot statement: {err}"
                        );
                    }
                }
            }
        }
    }
}

impl Drop for PooledStatement {
    fn drop(&mut self) {
        self.shut();
    }
}

/// A managed connection handed out with its transactional facets exposed,
/// for callers that want explicit XA handling instead of the pool's ambient
/// enlistment.
///
/// Dereferences to [`PooledConnection`] for ordinary driver work.
pub struct XaConnection {
    inner: PooledConnection,
}

impl XaConnection {
    /// The single-phase transactional resource facet of this connection.
    /// Each pooled connection is a distinct resource (a distinct branch).
    pub fn resource(&self) -> Arc<dyn TransactionResource> {
        Arc::clone(self.inner.conn()) as _
    }

    /// Returns the connection to the pool.
    pub fn close(self) {
        self.inner.close();
    }
}

impl Deref for XaConnection {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for XaConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl fmt::Debug for XaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaConnection")
            .field("id", &self.inner.conn.as_ref().map(|c| c.id()))
            .finish()
    }
}
