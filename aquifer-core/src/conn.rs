//! The managed connection: the pool-owned wrapper around one physical
//! driver connection.
//!
//! A `ManagedConn` carries two locks. Pool-visible bookkeeping (hold count,
//! bound transaction, deadlines) sits under a small state mutex taken only
//! for short, non-blocking sections. Driver-side state (the physical
//! connection and its statement cache) sits under a separate mutex so caller
//! I/O is serialized per connection without involving the pool region.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::{CachedStatement, Prepared, StatementCache};
use crate::driver::{
    DriverError, PhysicalConnection, ResultSetConcurrency, ResultSetType,
};
use crate::isolation::TransactionIsolation;
use crate::pool::inner::PoolInner;
use crate::tx::{Transaction, TransactionResource, Vote};

pub(crate) struct ManagedConn {
    id: u64,
    age_deadline: Instant,
    max_open_time: Duration,
    /// Non-owning back reference; the pool owns its connections, events are
    /// delivered as direct calls.
    pool: Weak<PoolInner>,
    state: Mutex<ConnState>,
    driver: Mutex<DriverState>,
}

pub(crate) struct ConnState {
    pub(crate) hold_count: u32,
    pub(crate) bound_tx: Option<Arc<dyn Transaction>>,
    pub(crate) idle_deadline: Instant,
    pub(crate) reuse_count: u32,
    /// An error event fired against this connection; destroy it once idle.
    pub(crate) broken: bool,
    /// Already removed from the pool (leak reclaim, shutdown, destruction).
    pub(crate) removed: bool,
}

struct DriverState {
    physical: Box<dyn PhysicalConnection>,
    statements: StatementCache,
}

impl ManagedConn {
    pub(crate) fn new(
        id: u64,
        physical: Box<dyn PhysicalConnection>,
        pool: Weak<PoolInner>,
        max_age: Duration,
        max_open_time: Duration,
        pstmt_max: usize,
    ) -> Self {
        let now = Instant::now();

        ManagedConn {
            id,
            age_deadline: now + max_age,
            max_open_time,
            pool,
            state: Mutex::new(ConnState {
                hold_count: 0,
                bound_tx: None,
                idle_deadline: now + max_open_time,
                reuse_count: 0,
                broken: false,
                removed: false,
            }),
            driver: Mutex::new(DriverState {
                physical,
                statements: StatementCache::new(pstmt_max),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Free-set key: `(reuse_count, id)`, ascending. The warmest statement
    /// cache sorts last and is acquired first.
    pub(crate) fn key(&self) -> (u32, u64) {
        (self.state.lock().reuse_count, self.id)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ConnState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Record one more outstanding acquisition and refresh the idle deadline.
    pub(crate) fn hold(&self) -> u32 {
        let mut state = self.state.lock();
        state.hold_count += 1;
        state.idle_deadline = Instant::now() + self.max_open_time;
        state.hold_count
    }

    /// Drop one acquisition; `None` signals a double release.
    pub(crate) fn release(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if state.hold_count == 0 {
            return None;
        }
        state.hold_count -= 1;
        Some(state.hold_count)
    }

    pub(crate) fn is_aged(&self, now: Instant) -> bool {
        now > self.age_deadline
    }

    /// Leak predicate: held, untransacted, and idle past the deadline.
    pub(crate) fn inactive(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state.hold_count > 0 && state.bound_tx.is_none() && now > state.idle_deadline
    }

    pub(crate) fn set_tx(&self, tx: Arc<dyn Transaction>) {
        self.state.lock().bound_tx = Some(tx);
    }

    pub(crate) fn clear_tx(&self) -> Option<Arc<dyn Transaction>> {
        self.state.lock().bound_tx.take()
    }

    pub(crate) fn bound_tx(&self) -> Option<Arc<dyn Transaction>> {
        self.state.lock().bound_tx.clone()
    }

    pub(crate) fn mark_broken(&self) {
        self.state.lock().broken = true;
    }

    /// Whether the driver still reports the physical session open.
    pub(crate) fn is_open(&self) -> bool {
        !self.driver.lock().physical.is_closed()
    }

    /// Prepare through the statement cache; a cache hit bumps `reuse_count`.
    pub(crate) fn prepare(
        &self,
        sql: &str,
        rs_type: ResultSetType,
        rs_concurrency: ResultSetConcurrency,
    ) -> Result<Prepared, DriverError> {
        let mut driver = self.driver.lock();
        let DriverState {
            physical,
            statements,
        } = &mut *driver;

        let prepared = statements.prepare(physical.as_mut(), sql, rs_type, rs_concurrency)?;

        if matches!(prepared, Prepared::Cached { reused: true }) {
            self.state.lock().reuse_count += 1;
        }

        Ok(prepared)
    }

    pub(crate) fn with_cached_statement<R>(
        &self,
        sql: &str,
        f: impl FnOnce(&mut CachedStatement) -> R,
    ) -> Option<R> {
        self.driver.lock().statements.with_statement(sql, f)
    }

    pub(crate) fn statement_closed(&self, sql: &str) {
        self.driver.lock().statements.statement_closed(sql);
    }

    /// Logically close any cached statements the caller left open; returns
    /// how many there were.
    pub(crate) fn close_open_statements(&self) -> usize {
        self.driver.lock().statements.close_open()
    }

    pub(crate) fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DriverError> {
        self.driver.lock().physical.set_auto_commit(auto_commit)
    }

    pub(crate) fn set_transaction_isolation(
        &self,
        isolation: TransactionIsolation,
    ) -> Result<(), DriverError> {
        self.driver.lock().physical.set_transaction_isolation(isolation)
    }

    pub(crate) fn commit(&self) -> Result<(), DriverError> {
        self.driver.lock().physical.commit()
    }

    pub(crate) fn rollback(&self) -> Result<(), DriverError> {
        self.driver.lock().physical.rollback()
    }

    /// One-shot probe used by validation and `check_connection`: prepare
    /// outside the cache, execute, close.
    pub(crate) fn run_statement(&self, sql: &str) -> Result<(), DriverError> {
        let mut driver = self.driver.lock();
        let mut stmt = driver.physical.prepare(
            sql,
            ResultSetType::ForwardOnly,
            ResultSetConcurrency::ReadOnly,
        )?;
        let result = stmt.execute().map(drop);
        if let Err(err) = stmt.close() {
            log::debug!(target: "aquifer::conn", "error closing probe statement: {err}");
        }
        result
    }

    /// The caller's logical close: close statements it left open, then tell
    /// the pool, which releases the hold with a normal disposition.
    pub(crate) fn notify_close(self: &Arc<Self>) {
        let open = self.close_open_statements();
        if open > 0 {
            log::warn!(
                target: "aquifer::conn",
                "connection #{} released with {open} statement(s) still open",
                self.id
            );
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.connection_closed(self);
        }
    }

    /// A fatal driver error surfaced through this connection; the pool
    /// releases the hold with an error disposition and quarantines it.
    pub(crate) fn notify_error(self: &Arc<Self>, err: &DriverError) {
        if let Some(pool) = self.pool.upgrade() {
            pool.connection_error(self, err);
        }
    }

    /// Physically tear down: drop every cached statement, close the driver
    /// session, swallow errors.
    pub(crate) fn remove(&self) {
        let mut driver = self.driver.lock();
        driver.statements.clear();
        if let Err(err) = driver.physical.close() {
            log::debug!(
                target: "aquifer::conn",
                "error closing physical connection #{}: {err}",
                self.id
            );
        }
    }
}

impl TransactionResource for ManagedConn {
    fn resource_id(&self) -> u64 {
        self.id
    }

    fn prepare(&self) -> Vote {
        Vote::Ok
    }

    fn commit(&self) -> Result<(), DriverError> {
        ManagedConn::commit(self)
    }

    fn rollback(&self) -> Result<(), DriverError> {
        ManagedConn::rollback(self)
    }
}
