//! Transaction affinity, enlistment edge cases, and completion handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use aquifer_core::mock::MockDriver;
use aquifer_core::pool::{Pool, PoolOptions};
use aquifer_core::tx::{
    CompletionHook, EnlistError, Transaction, TransactionManager, TransactionResource, TxId,
    TxStatus, Vote,
};
use aquifer_core::Error;

struct MockTx {
    id: TxId,
    rollback_only: AtomicBool,
    completed: AtomicBool,
    refuse_enlist: Mutex<Option<EnlistError>>,
    resources: Mutex<Vec<Arc<dyn TransactionResource>>>,
    delisted: Mutex<Vec<(u64, bool)>>,
    hooks: Mutex<Vec<CompletionHook>>,
}

impl MockTx {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(MockTx {
            id: TxId(id),
            rollback_only: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            refuse_enlist: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
            delisted: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        })
    }

    fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn refuse_enlist_with(&self, err: EnlistError) {
        *self.refuse_enlist.lock() = Some(err);
    }

    fn enlisted(&self) -> Vec<u64> {
        self.resources.lock().iter().map(|r| r.resource_id()).collect()
    }

    fn delisted(&self) -> Vec<(u64, bool)> {
        self.delisted.lock().clone()
    }

    /// Drive completion: commit or roll back every enlisted resource, then
    /// deliver the registered hooks.
    fn complete(&self, status: TxStatus) {
        self.completed.store(true, Ordering::SeqCst);

        for resource in self.resources.lock().iter() {
            assert_eq!(resource.prepare(), Vote::Ok);
            let result = match status {
                TxStatus::Committed => resource.commit(),
                TxStatus::RolledBack => resource.rollback(),
            };
            result.expect("resource completion");
        }

        let hooks: Vec<CompletionHook> = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook(status);
        }
    }
}

impl Transaction for MockTx {
    fn id(&self) -> TxId {
        self.id
    }

    fn enlist(&self, resource: Arc<dyn TransactionResource>) -> Result<(), EnlistError> {
        if let Some(err) = *self.refuse_enlist.lock() {
            return Err(err);
        }
        if self.completed.load(Ordering::SeqCst) {
            return Err(EnlistError::AlreadyCompleted);
        }
        if self.rollback_only.load(Ordering::SeqCst) {
            return Err(EnlistError::RollbackOnly);
        }
        self.resources.lock().push(resource);
        Ok(())
    }

    fn delist(&self, resource: &dyn TransactionResource, success: bool) {
        self.delisted.lock().push((resource.resource_id(), success));
    }

    fn register_completion(&self, hook: CompletionHook) -> Result<(), EnlistError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(EnlistError::AlreadyCompleted);
        }
        self.hooks.lock().push(hook);
        Ok(())
    }
}

struct MockTm {
    current: Mutex<Option<Arc<MockTx>>>,
}

impl MockTm {
    fn new() -> Arc<Self> {
        Arc::new(MockTm {
            current: Mutex::new(None),
        })
    }

    fn set_current(&self, tx: Option<Arc<MockTx>>) {
        *self.current.lock() = tx;
    }
}

impl TransactionManager for MockTm {
    fn current(&self) -> Option<Arc<dyn Transaction>> {
        self.current.lock().clone().map(|tx| tx as _)
    }
}

fn pool_with(driver: &Arc<MockDriver>, options: PoolOptions) -> Pool {
    options
        .open(Arc::clone(driver) as _, "aquifer://db.internal/test")
        .expect("pool construction")
}

fn as_tx(tx: &Arc<MockTx>) -> Option<Arc<dyn Transaction>> {
    Some(Arc::clone(tx) as _)
}

#[test]
fn acquires_within_one_transaction_share_a_connection() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(5));
    let tx = MockTx::new(1);

    let first = pool.acquire(as_tx(&tx)).unwrap();
    let second = pool.acquire(as_tx(&tx)).unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(pool.size(), 1);
    assert_eq!(tx.enlisted().len(), 1);

    // Both holds released, but the connection stays reserved for the
    // transaction: an untransacted acquire must open a new one.
    drop(first);
    drop(second);
    assert_eq!(pool.idle(), 0);

    let other = pool.get_connection().unwrap();
    assert_eq!(pool.size(), 2);
    drop(other);

    // Completion flushes the reserved connection back to the free set.
    tx.complete(TxStatus::Committed);
    assert_eq!(pool.idle(), 2);

    let status = pool.status();
    assert_eq!(status.served, 3);
}

#[test]
fn transacted_connections_run_with_autocommit_off() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));
    let tx = MockTx::new(7);

    let conn = pool.acquire(as_tx(&tx)).unwrap();
    assert!(!driver.connections()[0].auto_commit());
    drop(conn);

    tx.complete(TxStatus::Committed);

    // Untransacted use flips autocommit back on.
    let conn = pool.get_connection().unwrap();
    assert!(driver.connections()[0].auto_commit());
    drop(conn);
}

#[test]
fn ambient_transaction_is_consulted_on_get_connection() {
    let driver = Arc::new(MockDriver::new());
    let tm = MockTm::new();
    let tx = MockTx::new(3);
    tm.set_current(Some(Arc::clone(&tx)));

    let pool = pool_with(
        &driver,
        PoolOptions::new()
            .pool_max(4)
            .transaction_manager(Arc::clone(&tm) as _),
    );

    let first = pool.get_connection().unwrap();
    let second = pool.get_connection().unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(tx.enlisted().len(), 1);

    drop(first);
    drop(second);
    tm.set_current(None);
    tx.complete(TxStatus::Committed);
}

#[test]
fn rollback_only_enlistment_is_logged_and_swallowed() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));
    let tx = MockTx::new(11);
    tx.mark_rollback_only();

    // Enlist is refused, but the connection is still handed back and stays
    // bound to the transaction.
    let conn = pool.acquire(as_tx(&tx)).unwrap();
    assert!(!driver.connections()[0].auto_commit());

    let affine = pool.acquire(as_tx(&tx)).unwrap();
    assert_eq!(conn.id(), affine.id());

    drop(conn);
    drop(affine);
    tx.complete(TxStatus::RolledBack);
    assert_eq!(pool.idle(), 1);
}

#[test]
fn completed_transaction_demotes_to_untransacted() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));
    let tx = MockTx::new(13);
    tx.complete(TxStatus::Committed);

    let conn = pool.acquire(as_tx(&tx)).unwrap();
    assert!(driver.connections()[0].auto_commit());

    // Untransacted: the release parks it in the free set immediately.
    drop(conn);
    assert_eq!(pool.idle(), 1);
}

#[test]
fn enlistment_into_a_just_committed_transaction_demotes() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));

    // Completion registration succeeds but the enlistment itself finds the
    // transaction already over: the connection is re-placed into
    // non-transactional mode and handed back.
    let tx = MockTx::new(29);
    tx.refuse_enlist_with(EnlistError::AlreadyCompleted);

    let conn = pool.acquire(as_tx(&tx)).unwrap();
    assert!(driver.connections()[0].auto_commit());

    drop(conn);
    assert_eq!(pool.idle(), 1);
}

#[test]
fn completion_commits_through_the_pooled_resource() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));
    let tx = MockTx::new(17);

    let conn = pool.acquire(as_tx(&tx)).unwrap();
    conn.execute("UPDATE t SET x = 1").unwrap();
    drop(conn);

    tx.complete(TxStatus::Committed);
    assert_eq!(driver.connections()[0].commits(), 1);

    let tx2 = MockTx::new(18);
    let conn = pool.acquire(as_tx(&tx2)).unwrap();
    drop(conn);

    tx2.complete(TxStatus::RolledBack);
    assert_eq!(driver.connections()[0].rollbacks(), 1);
}

#[test]
fn statement_error_inside_a_transaction_delists_with_failure() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));
    let tx = MockTx::new(19);

    let conn = pool.acquire(as_tx(&tx)).unwrap();
    let conn_id = conn.id();
    driver.connections()[0].fail_statements_matching("BOOM");

    match conn.execute("BOOM") {
        Err(Error::Driver(_)) => {}
        other => panic!("expected a driver error, got {other:?}"),
    }

    assert_eq!(tx.delisted(), vec![(conn_id, false)]);

    // The error released and destroyed the connection; completion later
    // finds nothing to flush.
    assert_eq!(pool.size(), 0);
    drop(conn);
    tx.complete(TxStatus::RolledBack);
    assert_eq!(pool.size(), 0);
}

#[test]
fn each_pooled_connection_is_a_distinct_branch() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));

    let first = pool.get_xa_connection().unwrap();
    let second = pool.get_xa_connection().unwrap();

    let r1 = first.resource();
    let r2 = second.resource();

    assert!(r1.same_resource(r1.as_ref()));
    assert!(!r1.same_resource(r2.as_ref()));
    assert_eq!(r1.prepare(), Vote::Ok);
}

#[test]
fn xa_resource_drives_the_physical_connection() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(&driver, PoolOptions::new().pool_max(2));

    let xa = pool.get_xa_connection().unwrap();
    xa.execute("UPDATE t SET x = 2").unwrap();

    let resource = xa.resource();
    resource.commit().unwrap();
    resource.rollback().unwrap();

    let ctl = &driver.connections()[0];
    assert_eq!(ctl.commits(), 1);
    assert_eq!(ctl.rollbacks(), 1);

    xa.close();
    assert_eq!(pool.idle(), 1);
}

#[test]
fn late_waiter_gets_the_connection_after_completion() {
    let driver = Arc::new(MockDriver::new());
    let pool = pool_with(
        &driver,
        PoolOptions::new()
            .pool_max(1)
            .waiter_timeout(Duration::from_millis(500)),
    );
    let tx = MockTx::new(23);

    let conn = pool.acquire(as_tx(&tx)).unwrap();
    let conn_id = conn.id();
    drop(conn);

    // Still reserved: an untransacted acquire at the cap must wait until
    // the transaction completes.
    let waiter_pool = pool.clone();
    let waiter = std::thread::spawn(move || {
        let conn = waiter_pool.get_connection().unwrap();
        conn.id()
    });

    for _ in 0..200 {
        if pool.status().waiters >= 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    tx.complete(TxStatus::Committed);

    assert_eq!(waiter.join().unwrap(), conn_id);
}
