//! The pool allocator.
//!
//! All pool state transitions — free set, connection roster, transaction
//! map, counters, waiter accounting — happen under one mutex region per
//! pool. Waiters park on the condvar tied to that region; each release or
//! destruction signals exactly one waiter. Spurious wakes and barging are
//! tolerated: the acquire loop always re-examines the world after waking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::conn::ManagedConn;
use crate::driver::{Driver, DriverError, ResultSetConcurrency, ResultSetType};
use crate::error::Error;
use crate::isolation::TransactionIsolation;
use crate::pool::metrics::{PoolMetrics, PoolStatus};
use crate::pool::options::{CheckLevel, PoolOptions, POOL_MAX_UNBOUNDED};
use crate::tx::{CompletionHook, EnlistError, Transaction, TransactionResource, TxId};

/// Ceiling on aged evictions per `adjust` pass.
const MAX_REMOVE_FREELIST: usize = 10;

/// Cadence of the background `adjust` pass.
const ADJUST_PERIOD: Duration = Duration::from_secs(1);

/// How a caller finished with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Normal,
    Error,
}

pub(crate) struct PoolInner {
    driver: Arc<dyn Driver>,
    url: String,
    pub(crate) options: PoolOptions,
    state: Mutex<PoolState>,
    waiters: Condvar,
}

struct PoolState {
    /// Idle, untransacted connections keyed by `(reuse_count, id)`. The last
    /// entry (warmest cache, then youngest) is acquired first; the first is
    /// evicted first when shrinking.
    free: BTreeMap<(u32, u64), Arc<ManagedConn>>,
    /// Every connection currently owned, busy or idle.
    all: Vec<Arc<ManagedConn>>,
    /// Active transaction -> the connection reserved for it.
    tx_map: HashMap<TxId, Arc<ManagedConn>>,
    current_waiters: u32,
    /// Connections with at least one outstanding hold.
    busy: u32,
    pool_min: u32,
    pool_max: u32,
    next_id: u64,
    closed: bool,
    metrics: PoolMetrics,
}

impl PoolInner {
    pub(crate) fn new_arc(
        driver: Arc<dyn Driver>,
        url: &str,
        options: PoolOptions,
    ) -> crate::Result<Arc<Self>> {
        let sampling_period = options.sampling_period;
        let pool = Arc::new(PoolInner {
            driver,
            url: url.to_owned(),
            state: Mutex::new(PoolState {
                free: BTreeMap::new(),
                all: Vec::new(),
                tx_map: HashMap::new(),
                current_waiters: 0,
                busy: 0,
                pool_min: options.pool_min,
                pool_max: options.pool_max,
                next_id: 1,
                closed: false,
                metrics: PoolMetrics::default(),
            }),
            waiters: Condvar::new(),
            options,
        });

        // Warm the floor; a driver outage here is logged, not fatal.
        pool.adjust();

        spawn_maintenance(Arc::downgrade(&pool), sampling_period);

        Ok(pool)
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn size(&self) -> u32 {
        self.state.lock().all.len() as u32
    }

    pub(crate) fn num_idle(&self) -> u32 {
        self.state.lock().free.len() as u32
    }

    pub(crate) fn pool_min(&self) -> u32 {
        self.state.lock().pool_min
    }

    pub(crate) fn pool_max(&self) -> u32 {
        self.state.lock().pool_max
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        state.metrics.snapshot(
            state.all.len() as u32,
            state.free.len() as u32,
            state.busy,
            state.current_waiters,
        )
    }

    /// The transaction ambient to the calling thread, if a transaction
    /// manager was configured.
    pub(crate) fn ambient_tx(&self) -> Option<Arc<dyn Transaction>> {
        self.options
            .transaction_manager
            .as_ref()
            .and_then(|tm| tm.current())
    }

    /// Get a connection: reuse the one bound to `tx`, take from the free
    /// set, open a new one, or wait for a release.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        tx: Option<Arc<dyn Transaction>>,
    ) -> crate::Result<Arc<ManagedConn>> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(Error::PoolClosed);
        }

        // Transaction-affinity fast path: a connection is already reserved
        // for this transaction. No allocation, no waiting.
        if let Some(ref tx) = tx {
            if let Some(conn) = state.tx_map.get(&tx.id()).cloned() {
                if conn.hold() == 1 {
                    state.busy += 1;
                    let busy = state.busy;
                    state.metrics.note_busy(busy);
                }
                state.metrics.served += 1;
                return Ok(conn);
            }
        }

        let mut started: Option<Instant> = None;

        let selected = loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }

            // Free path: warmest statement cache first.
            if let Some((_, conn)) = state.free.pop_last() {
                match self.validate(&conn) {
                    Ok(()) => break conn,
                    Err(err) => {
                        log::info!(
                            target: "aquifer::pool",
                            "connection #{} failed validation: {err}",
                            conn.id()
                        );
                        self.destroy_locked(&mut state, &conn);
                        // Validation I/O is not charged against the caller's
                        // waiting budget.
                        started = None;
                        continue;
                    }
                }
            }

            // Expand path.
            if (state.all.len() as u32) < state.pool_max {
                match self.open_physical(&mut state) {
                    Ok(conn) => break conn,
                    Err(err) => {
                        state.metrics.connection_failures += 1;
                        state.metrics.rejected_other += 1;
                        return Err(err.into());
                    }
                }
            }

            // Wait path, with a residual budget measured from the first park.
            let start = started.unwrap_or_else(Instant::now);
            let residual = self.options.waiter_timeout.saturating_sub(start.elapsed());

            if residual > Duration::ZERO && state.current_waiters < self.options.max_waiters {
                started = Some(start);
                state.current_waiters += 1;
                let waiting = state.current_waiters;
                state.metrics.note_waiters(waiting);

                let _ = self.waiters.wait_for(&mut state, residual);

                state.current_waiters -= 1;
                state.metrics.note_waiting_time(start.elapsed());
                continue;
            }

            // Reject.
            return Err(if started.is_some() {
                state.metrics.rejected_timeout += 1;
                Error::PoolTimedOut
            } else {
                state.metrics.rejected_full += 1;
                Error::PoolFull
            });
        };

        selected.hold();
        state.busy += 1;
        let busy = state.busy;
        state.metrics.note_busy(busy);

        let mut transacted = false;
        if let Some(ref tx) = tx {
            match tx.register_completion(self.completion_hook(tx.id())) {
                Ok(()) => {
                    selected.set_tx(Arc::clone(tx));
                    state.tx_map.insert(tx.id(), Arc::clone(&selected));
                    transacted = true;
                }
                Err(err) => {
                    log::info!(
                        target: "aquifer::pool",
                        "completion registration for {} refused ({err}); serving untransacted",
                        tx.id()
                    );
                }
            }
        }

        drop(state);

        // Driver-side mode setup and enlistment happen outside the region;
        // the connection is held, so nothing else can touch it.
        if transacted {
            if let Some(ref tx) = tx {
                if let Err(err) = self.enter_transacted(&selected, tx) {
                    return self.fail_setup(&selected, err);
                }
            }
        } else if let Err(err) = selected.set_auto_commit(true) {
            return self.fail_setup(&selected, err);
        }

        self.state.lock().metrics.served += 1;

        Ok(selected)
    }

    /// First hold for `tx`: autocommit off and enlist this connection's
    /// resource facet. An already-completed transaction demotes the
    /// connection back to untransacted mode; rollback-only is logged and
    /// swallowed because the enlistment itself stands.
    fn enter_transacted(
        &self,
        conn: &Arc<ManagedConn>,
        tx: &Arc<dyn Transaction>,
    ) -> Result<(), DriverError> {
        conn.set_auto_commit(false)?;

        let resource: Arc<dyn TransactionResource> = Arc::clone(conn) as _;
        match tx.enlist(resource) {
            Ok(()) => Ok(()),
            Err(EnlistError::RollbackOnly) => {
                log::info!(
                    target: "aquifer::pool",
                    "{} is rollback-only; connection #{} stays enlisted",
                    tx.id(),
                    conn.id()
                );
                Ok(())
            }
            Err(EnlistError::AlreadyCompleted) => {
                self.state.lock().tx_map.remove(&tx.id());
                conn.clear_tx();
                conn.set_auto_commit(true)
            }
        }
    }

    /// Mode setup failed after selection; unwind the hold and destroy the
    /// connection.
    fn fail_setup(
        &self,
        conn: &Arc<ManagedConn>,
        err: DriverError,
    ) -> crate::Result<Arc<ManagedConn>> {
        let mut state = self.state.lock();

        if conn.release() == Some(0) {
            state.busy = state.busy.saturating_sub(1);
            let busy = state.busy;
            state.metrics.note_busy(busy);
        }
        if let Some(tx) = conn.clear_tx() {
            state.tx_map.remove(&tx.id());
        }
        self.destroy_locked(&mut state, conn);
        state.metrics.rejected_other += 1;
        self.waiters.notify_one();

        Err(err.into())
    }

    fn validate(&self, conn: &Arc<ManagedConn>) -> Result<(), DriverError> {
        match self.options.check_level {
            CheckLevel::Off => Ok(()),
            CheckLevel::ClosedCheck => {
                if conn.is_open() {
                    Ok(())
                } else {
                    Err(DriverError::new("driver reports the connection closed"))
                }
            }
            CheckLevel::TestStatement => {
                if !conn.is_open() {
                    return Err(DriverError::new("driver reports the connection closed"));
                }
                let sql = self
                    .options
                    .test_statement
                    .as_deref()
                    .ok_or_else(|| DriverError::new("no test statement configured"))?;
                conn.run_statement(sql)
            }
        }
    }

    /// Open, wrap, and register a new physical connection.
    fn open_physical(
        self: &Arc<Self>,
        state: &mut PoolState,
    ) -> Result<Arc<ManagedConn>, DriverError> {
        let mut physical = self.driver.open(
            &self.url,
            self.options.username.as_deref(),
            self.options.password.as_deref(),
        )?;

        if self.options.isolation != TransactionIsolation::Default {
            physical.set_transaction_isolation(self.options.isolation)?;
        }

        let id = state.next_id;
        state.next_id += 1;

        let conn = Arc::new(ManagedConn::new(
            id,
            physical,
            Arc::downgrade(self),
            self.options.max_age,
            self.options.max_open_time,
            self.options.pstmt_max,
        ));

        state.metrics.opened += 1;
        state.all.push(Arc::clone(&conn));

        log::debug!(target: "aquifer::pool", "opened connection #{id}");

        Ok(conn)
    }

    /// A caller is done with `conn`.
    pub(crate) fn release(&self, conn: &Arc<ManagedConn>, disposition: Disposition) {
        let mut state = self.state.lock();

        let remaining = match conn.release() {
            Some(remaining) => remaining,
            None => {
                // Clamp a double release; routine when an error event already
                // force-released the hold.
                if conn.with_state(|s| s.broken || s.removed) {
                    log::debug!(
                        target: "aquifer::pool",
                        "release of already-released connection #{}",
                        conn.id()
                    );
                } else {
                    log::warn!(
                        target: "aquifer::pool",
                        "double release of connection #{}",
                        conn.id()
                    );
                }
                return;
            }
        };

        if disposition == Disposition::Error {
            conn.mark_broken();
            if let Some(tx) = conn.bound_tx() {
                tx.delist(conn.as_ref(), false);
            }
        }

        if remaining == 0 {
            // A connection already reclaimed (leak, shutdown) gave back its
            // busy slot when it was removed.
            if !conn.with_state(|s| s.removed) {
                state.busy = state.busy.saturating_sub(1);
                let busy = state.busy;
                state.metrics.note_busy(busy);
                self.park_or_retire(&mut state, conn);
            }
        }
    }

    /// An idle connection goes back to the free set, stays parked for its
    /// transaction, or is destroyed if broken or the pool is closing.
    fn park_or_retire(&self, state: &mut PoolState, conn: &Arc<ManagedConn>) {
        let (broken, removed, transacted) =
            conn.with_state(|s| (s.broken, s.removed, s.bound_tx.is_some()));

        if removed {
            return;
        }

        if broken {
            if let Some(tx) = conn.clear_tx() {
                state.tx_map.remove(&tx.id());
            }
            self.destroy_locked(state, conn);
            self.waiters.notify_one();
            return;
        }

        if transacted {
            // Affinity hold: the completion callback frees it.
            return;
        }

        if state.closed {
            self.destroy_locked(state, conn);
            return;
        }

        state.free.insert(conn.key(), Arc::clone(conn));
        self.waiters.notify_one();
    }

    /// Event target for [`ManagedConn::notify_close`].
    pub(crate) fn connection_closed(&self, conn: &Arc<ManagedConn>) {
        self.release(conn, Disposition::Normal);
    }

    /// Event target for [`ManagedConn::notify_error`]: the error itself
    /// releases the caller's hold, with an error disposition.
    pub(crate) fn connection_error(&self, conn: &Arc<ManagedConn>, err: &DriverError) {
        log::warn!(
            target: "aquifer::pool",
            "connection #{} reported an error: {err}",
            conn.id()
        );
        self.release(conn, Disposition::Error);
    }

    /// Completion callback: the transaction is over, flush its connection.
    pub(crate) fn free_after_tx(&self, tx_id: TxId) {
        let mut state = self.state.lock();

        let conn = match state.tx_map.remove(&tx_id) {
            Some(conn) => conn,
            None => return,
        };

        conn.clear_tx();

        if conn.with_state(|s| s.hold_count) == 0 {
            // The caller already released; park it now.
            self.park_or_retire(&mut state, &conn);
        }
    }

    fn completion_hook(self: &Arc<Self>, tx_id: TxId) -> CompletionHook {
        let pool = Arc::downgrade(self);
        Box::new(move |_status| {
            if let Some(pool) = pool.upgrade() {
                pool.free_after_tx(tx_id);
            }
        })
    }

    /// Diagnostic probe: run `sql` on a free connection, or on a scratch
    /// connection when the free set is empty.
    pub(crate) fn check_connection(&self, sql: &str) -> crate::Result<()> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(Error::PoolClosed);
        }

        if let Some((key, conn)) = state.free.pop_last() {
            let result = conn.run_statement(sql);
            state.free.insert(key, conn);
            return result.map_err(Error::from);
        }

        drop(state);

        let mut physical = self.driver.open(
            &self.url,
            self.options.username.as_deref(),
            self.options.password.as_deref(),
        )?;

        let result = (|| {
            let mut stmt = physical.prepare(
                sql,
                ResultSetType::ForwardOnly,
                ResultSetConcurrency::ReadOnly,
            )?;
            let outcome = stmt.execute().map(drop);
            let _ = stmt.close();
            outcome
        })();

        let _ = physical.close();

        result.map_err(Error::from)
    }

    /// Housekeeping: evict aged idles, reclaim leaks, honor a lowered cap,
    /// grow to the floor. Invoked on configuration changes and periodically
    /// from the maintenance thread.
    pub(crate) fn adjust(self: &Arc<Self>) {
        let mut state = self.state.lock();

        if state.closed {
            return;
        }

        let now = Instant::now();

        // Aged idle connections, bounded per pass, never below the floor.
        let mut evicted = 0;
        while evicted < MAX_REMOVE_FREELIST && (state.all.len() as u32) > state.pool_min {
            let aged = state
                .free
                .iter()
                .find(|(_, conn)| conn.is_aged(now))
                .map(|(key, conn)| (*key, Arc::clone(conn)));

            let (_, conn) = match aged {
                Some(found) => found,
                None => break,
            };

            log::debug!(target: "aquifer::pool", "evicting aged connection #{}", conn.id());
            self.destroy_locked(&mut state, &conn);
            self.waiters.notify_one();
            evicted += 1;
        }

        // Leaked connections: held, untransacted, idle past the deadline.
        let leaked: Vec<Arc<ManagedConn>> = state
            .all
            .iter()
            .filter(|conn| conn.inactive(now))
            .cloned()
            .collect();

        for conn in leaked {
            log::warn!(
                target: "aquifer::pool",
                "connection #{} leaked (held past max open time); reclaiming",
                conn.id()
            );
            state.metrics.connection_leaks += 1;
            state.busy = state.busy.saturating_sub(1);
            let busy = state.busy;
            state.metrics.note_busy(busy);
            self.destroy_locked(&mut state, &conn);
            self.waiters.notify_one();
        }

        // An admin lowered the cap: shed idles starting at the coldest key.
        while (state.all.len() as u32) > state.pool_max
            && (state.free.len() as u32) > state.pool_min
        {
            let (_, conn) = match state.free.pop_first() {
                Some(entry) => entry,
                None => break,
            };
            self.destroy_locked(&mut state, &conn);
        }

        // Grow to the floor.
        while (state.all.len() as u32) < state.pool_min {
            match self.open_physical(&mut state) {
                Ok(conn) => {
                    state.free.insert(conn.key(), conn);
                    self.waiters.notify_one();
                }
                Err(err) => {
                    state.metrics.connection_failures += 1;
                    log::warn!(
                        target: "aquifer::pool",
                        "could not open a connection while growing to the pool floor: {err}"
                    );
                    break;
                }
            }
        }
    }

    /// Roll the sampling-period counters.
    pub(crate) fn sample(&self) {
        let mut state = self.state.lock();
        let busy = state.busy;
        state.metrics.sample(busy);
    }

    pub(crate) fn set_pool_min(self: &Arc<Self>, pool_min: u32) {
        self.state.lock().pool_min = pool_min;
        self.adjust();
    }

    pub(crate) fn set_pool_max(self: &Arc<Self>, pool_max: i64) {
        {
            let mut state = self.state.lock();
            state.pool_max = if pool_max < 0 {
                POOL_MAX_UNBOUNDED
            } else {
                pool_max.min(i64::from(POOL_MAX_UNBOUNDED)) as u32
            };
        }
        self.adjust();
        // A raised cap may unblock waiters on the expand path.
        self.waiters.notify_one();
    }

    /// Destroy every connection and refuse all future acquires.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();

        if state.closed {
            return;
        }
        state.closed = true;

        for conn in state.all.drain(..) {
            conn.with_state(|s| s.removed = true);
            conn.remove();
        }
        state.free.clear();
        state.tx_map.clear();
        state.busy = 0;

        self.waiters.notify_all();
    }

    /// Remove `conn` from the pool and close it. Callers hold the region.
    fn destroy_locked(&self, state: &mut PoolState, conn: &Arc<ManagedConn>) {
        conn.with_state(|s| s.removed = true);
        state.free.remove(&conn.key());
        state.all.retain(|c| c.id() != conn.id());
        conn.remove();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Last handle gone; close whatever is left, swallowing errors.
        let state = self.state.get_mut();
        for conn in state.all.drain(..) {
            conn.remove();
        }
    }
}

/// Periodic `adjust` plus metric sampling, on a thread that holds only a
/// weak pool reference so it exits once the last handle is dropped.
fn spawn_maintenance(pool: Weak<PoolInner>, sampling_period: Duration) {
    let tick = ADJUST_PERIOD.min(sampling_period.max(Duration::from_millis(100)));

    let spawned = thread::Builder::new()
        .name("aquifer-maintenance".into())
        .spawn(move || {
            let mut last_sample = Instant::now();

            loop {
                thread::sleep(tick);

                let pool = match pool.upgrade() {
                    Some(pool) => pool,
                    None => return,
                };

                if pool.is_closed() {
                    return;
                }

                pool.adjust();

                if last_sample.elapsed() >= pool.options.sampling_period {
                    pool.sample();
                    last_sample = Instant::now();
                }
            }
        });

    if let Err(err) = spawned {
        log::error!(target: "aquifer::pool", "failed to spawn maintenance thread: {err}");
    }
}
