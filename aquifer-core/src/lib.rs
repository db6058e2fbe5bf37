//! Core of **aquifer**: pooled, transaction-aware database connection
//! management.
//!
//! The pool sits between application code and a database driver:
//!
//! * a bounded allocator hands out connections, parks callers when
//!   saturated, and validates idle connections before reuse;
//! * acquisitions inside one global transaction all land on the same
//!   physical connection until the transaction completes;
//! * each physical connection carries a bounded prepared-statement cache;
//! * aged and leaked connections are reclaimed in the background.
//!
//! Drivers plug in through the traits in [`driver`]; transaction managers
//! and name directories through [`tx`] and [`reference`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aquifer_core::mock::MockDriver;
//! use aquifer_core::pool::PoolOptions;
//!
//! # fn main() -> aquifer_core::Result<()> {
//! let pool = PoolOptions::new()
//!     .pool_min(2)
//!     .pool_max(10)
//!     .open(Arc::new(MockDriver::new()), "aquifer://db.internal/orders")?;
//!
//! let conn = pool.get_connection()?;
//! let mut stmt = conn.prepare("UPDATE orders SET state = 'shipped'")?;
//! stmt.execute()?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod conn;
mod error;
mod isolation;

pub mod driver;
pub mod mock;
pub mod pool;
pub mod reference;
pub mod tx;

pub use error::{Error, Result};
pub use isolation::TransactionIsolation;

pub use driver::{Driver, DriverError, PhysicalConnection, PhysicalStatement};
pub use pool::{
    CheckLevel, Pool, PoolOptions, PoolStatus, PooledConnection, PooledStatement, XaConnection,
    POOL_MAX_UNBOUNDED,
};
pub use tx::{Transaction, TransactionManager, TransactionResource, TxId, TxStatus};
