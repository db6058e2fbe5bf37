//! A scriptable in-memory driver for exercising the pool without a
//! database.
//!
//! The driver side hands the pool ordinary boxed trait objects; the control
//! side ([`MockDriver`] plus the [`MockConn`] / [`MockStatementState`]
//! handles it exposes) lets tests fail opens, kill live connections, fail
//! statements by SQL substring, and inspect everything afterwards.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::driver::{
    Driver, DriverError, FetchDirection, PhysicalConnection, PhysicalStatement,
    ResultSetConcurrency, ResultSetType,
};
use crate::isolation::TransactionIsolation;

/// The driver handle. Clone it (or keep it in an `Arc`) to retain the
/// control side after handing it to a pool.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<DriverState>,
}

#[derive(Default)]
struct DriverState {
    opened: AtomicUsize,
    fail_opens: AtomicUsize,
    fail_sql: Mutex<Option<String>>,
    connections: Mutex<Vec<Arc<MockConn>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical connections opened so far.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` opens.
    pub fn fail_next_opens(&self, n: usize) {
        self.state.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Every connection opened from now on fails statements whose SQL
    /// contains `pattern`.
    pub fn fail_statements_matching(&self, pattern: &str) {
        *self.state.fail_sql.lock() = Some(pattern.to_owned());
    }

    /// Control handles for every connection opened so far.
    pub fn connections(&self) -> Vec<Arc<MockConn>> {
        self.state.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConn>> {
        self.state.connections.lock().last().cloned()
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(
        &self,
        _url: &str,
        username: Option<&str>,
        _password: Option<&str>,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError> {
        let remaining = self.state.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new("mock: connection refused"));
        }

        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(MockConn {
            id,
            username: username.map(str::to_owned),
            fail_sql: Mutex::new(self.state.fail_sql.lock().clone()),
            ..MockConn::blank()
        });

        self.state.connections.lock().push(Arc::clone(&conn));

        Ok(Box::new(MockPhysical { conn }))
    }
}

/// Control handle for one mock connection.
pub struct MockConn {
    id: usize,
    username: Option<String>,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    isolation: Mutex<TransactionIsolation>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    executed: Mutex<Vec<String>>,
    fail_sql: Mutex<Option<String>>,
    statements: Mutex<Vec<Arc<MockStatementState>>>,
}

impl MockConn {
    fn blank() -> Self {
        MockConn {
            id: 0,
            username: None,
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            isolation: Mutex::new(TransactionIsolation::Default),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            fail_sql: Mutex::new(None),
            statements: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Simulate the server dropping this session: `is_closed` starts
    /// reporting true and further driver calls fail.
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    pub fn isolation(&self) -> TransactionIsolation {
        *self.isolation.lock()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Every SQL text executed through this connection, probes included.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Statements whose SQL contains `pattern` fail from now on.
    pub fn fail_statements_matching(&self, pattern: &str) {
        *self.fail_sql.lock() = Some(pattern.to_owned());
    }

    /// Control handles for every statement prepared on this connection.
    pub fn statements(&self) -> Vec<Arc<MockStatementState>> {
        self.statements.lock().clone()
    }

    fn check_live(&self) -> Result<(), DriverError> {
        if self.is_closed() {
            Err(DriverError::new("mock: connection is closed"))
        } else {
            Ok(())
        }
    }

    fn run(&self, sql: &str) -> Result<u64, DriverError> {
        self.check_live()?;

        if let Some(pattern) = self.fail_sql.lock().as_deref() {
            if sql.contains(pattern) {
                return Err(DriverError::with_code(
                    format!("mock: statement failure for {sql:?}"),
                    1,
                ));
            }
        }

        self.executed.lock().push(sql.to_owned());
        Ok(1)
    }
}

/// A standalone mock connection, for tests that drive [`PhysicalConnection`]
/// directly rather than through a pool.
pub fn connection() -> (Box<dyn PhysicalConnection>, Arc<MockConn>) {
    let conn = Arc::new(MockConn::blank());
    (Box::new(MockPhysical { conn: Arc::clone(&conn) }), conn)
}

struct MockPhysical {
    conn: Arc<MockConn>,
}

impl PhysicalConnection for MockPhysical {
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError> {
        self.conn.check_live()?;
        self.conn.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    fn set_transaction_isolation(
        &mut self,
        isolation: TransactionIsolation,
    ) -> Result<(), DriverError> {
        self.conn.check_live()?;
        *self.conn.isolation.lock() = isolation;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.conn.check_live()?;
        self.conn.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.conn.check_live()?;
        self.conn.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.conn.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn prepare(
        &mut self,
        sql: &str,
        _rs_type: ResultSetType,
        _rs_concurrency: ResultSetConcurrency,
    ) -> Result<Box<dyn PhysicalStatement>, DriverError> {
        self.conn.check_live()?;

        let state = Arc::new(MockStatementState::new(sql));
        self.conn.statements.lock().push(Arc::clone(&state));

        Ok(Box::new(MockStatement {
            conn: Arc::clone(&self.conn),
            state,
        }))
    }
}

/// Control handle for one mock statement.
pub struct MockStatementState {
    sql: String,
    fetch_direction: Mutex<FetchDirection>,
    fetch_size: AtomicU32,
    max_field_size: AtomicU32,
    max_rows: AtomicU32,
    query_timeout: Mutex<Duration>,
    batch_len: AtomicUsize,
    batch_cleared: AtomicUsize,
    params_cleared: AtomicUsize,
    warnings_cleared: AtomicUsize,
    executes: AtomicUsize,
    closed: AtomicBool,
}

impl MockStatementState {
    fn new(sql: &str) -> Self {
        MockStatementState {
            sql: sql.to_owned(),
            fetch_direction: Mutex::new(FetchDirection::Forward),
            fetch_size: AtomicU32::new(0),
            max_field_size: AtomicU32::new(0),
            max_rows: AtomicU32::new(0),
            query_timeout: Mutex::new(Duration::ZERO),
            batch_len: AtomicUsize::new(0),
            batch_cleared: AtomicUsize::new(0),
            params_cleared: AtomicUsize::new(0),
            warnings_cleared: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn fetch_direction(&self) -> FetchDirection {
        *self.fetch_direction.lock()
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size.load(Ordering::SeqCst)
    }

    pub fn max_field_size(&self) -> u32 {
        self.max_field_size.load(Ordering::SeqCst)
    }

    pub fn max_rows(&self) -> u32 {
        self.max_rows.load(Ordering::SeqCst)
    }

    pub fn query_timeout(&self) -> Duration {
        *self.query_timeout.lock()
    }

    pub fn batch_len(&self) -> usize {
        self.batch_len.load(Ordering::SeqCst)
    }

    pub fn batch_cleared(&self) -> usize {
        self.batch_cleared.load(Ordering::SeqCst)
    }

    pub fn params_cleared(&self) -> usize {
        self.params_cleared.load(Ordering::SeqCst)
    }

    pub fn warnings_cleared(&self) -> usize {
        self.warnings_cleared.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockStatement {
    conn: Arc<MockConn>,
    state: Arc<MockStatementState>,
}

impl MockStatement {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.state.is_closed() {
            Err(DriverError::new("mock: statement is closed"))
        } else {
            Ok(())
        }
    }
}

impl PhysicalStatement for MockStatement {
    fn execute(&mut self) -> Result<u64, DriverError> {
        self.check_open()?;
        let rows = self.conn.run(&self.state.sql)?;
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        Ok(rows)
    }

    fn execute_sql(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.check_open()?;
        let rows = self.conn.run(sql)?;
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        Ok(rows)
    }

    fn add_batch(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        self.state.batch_len.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_batch(&mut self) {
        self.state.batch_len.store(0, Ordering::SeqCst);
        self.state.batch_cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_parameters(&mut self) {
        self.state.params_cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_warnings(&mut self) {
        self.state.warnings_cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn set_fetch_direction(&mut self, direction: FetchDirection) -> Result<(), DriverError> {
        self.check_open()?;
        *self.state.fetch_direction.lock() = direction;
        Ok(())
    }

    fn set_fetch_size(&mut self, rows: u32) -> Result<(), DriverError> {
        self.check_open()?;
        self.state.fetch_size.store(rows, Ordering::SeqCst);
        Ok(())
    }

    fn set_max_field_size(&mut self, bytes: u32) -> Result<(), DriverError> {
        self.check_open()?;
        self.state.max_field_size.store(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn set_max_rows(&mut self, rows: u32) -> Result<(), DriverError> {
        self.check_open()?;
        self.state.max_rows.store(rows, Ordering::SeqCst);
        Ok(())
    }

    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.check_open()?;
        *self.state.query_timeout.lock() = timeout;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
