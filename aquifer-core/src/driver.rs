//! The seam between the pool and a concrete database driver.
//!
//! The pool never talks to a database directly; it opens physical
//! connections through a [`Driver`] and drives them through the
//! [`PhysicalConnection`] and [`PhysicalStatement`] traits. Implement these
//! three traits to put any blocking client library behind the pool.

use std::time::Duration;

use crate::isolation::TransactionIsolation;

/// An error surfaced by the underlying database driver.
#[derive(Debug, Clone, thiserror::Error)]
#[error("driver error: {message}")]
pub struct DriverError {
    /// Driver-provided message text.
    pub message: String,
    /// Vendor error code, when the driver reports one.
    pub code: Option<i32>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        DriverError {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// How a result set may be traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResultSetType {
    #[default]
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

/// Whether a result set may be updated in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResultSetConcurrency {
    #[default]
    ReadOnly,
    Updatable,
}

/// Hint for the direction rows will be fetched in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FetchDirection {
    #[default]
    Forward,
    Reverse,
    Unknown,
}

/// Opens physical connections for a pool.
pub trait Driver: Send + Sync + 'static {
    /// Short identifier for this driver, recorded in exported references.
    fn name(&self) -> &str;

    /// Open a new physical connection to `url`.
    fn open(
        &self,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError>;
}

/// One physical session with the database, owned uniquely by the managed
/// connection that wraps it.
pub trait PhysicalConnection: Send + 'static {
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError>;

    fn set_transaction_isolation(
        &mut self,
        isolation: TransactionIsolation,
    ) -> Result<(), DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Whether the driver reports this session as closed. Used by
    /// validation-on-acquire; must not perform I/O.
    fn is_closed(&self) -> bool;

    fn close(&mut self) -> Result<(), DriverError>;

    fn prepare(
        &mut self,
        sql: &str,
        rs_type: ResultSetType,
        rs_concurrency: ResultSetConcurrency,
    ) -> Result<Box<dyn PhysicalStatement>, DriverError>;
}

/// A prepared statement handle produced by a [`PhysicalConnection`].
pub trait PhysicalStatement: Send + 'static {
    /// Execute the prepared text, returning the affected row count.
    fn execute(&mut self) -> Result<u64, DriverError>;

    /// Execute a different SQL text through this statement handle.
    fn execute_sql(&mut self, sql: &str) -> Result<u64, DriverError>;

    fn add_batch(&mut self) -> Result<(), DriverError>;

    fn clear_batch(&mut self);

    fn clear_parameters(&mut self);

    fn clear_warnings(&mut self);

    fn set_fetch_direction(&mut self, direction: FetchDirection) -> Result<(), DriverError>;

    fn set_fetch_size(&mut self, rows: u32) -> Result<(), DriverError>;

    fn set_max_field_size(&mut self, bytes: u32) -> Result<(), DriverError>;

    fn set_max_rows(&mut self, rows: u32) -> Result<(), DriverError>;

    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}
