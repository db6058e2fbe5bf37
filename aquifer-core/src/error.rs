//! Error and Result types.

use crate::driver::DriverError;

/// A specialized `Result` type for aquifer.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A generic error that represents all the ways a method can fail inside of
/// aquifer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool is at capacity, every connection is in use, and the waiter
    /// limit has been reached, so the acquire was refused without waiting.
    #[error("connection pool is full and the waiter limit has been reached")]
    PoolFull,

    /// An acquire waited out the configured budget without a connection
    /// becoming available.
    #[error("timed out while waiting for an open connection")]
    PoolTimedOut,

    /// The pool was shut down, either before or while the caller was waiting
    /// for a connection.
    #[error("attempted to acquire a connection on a closed pool")]
    PoolClosed,

    /// An error was returned by the database driver.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The pool configuration was rejected at construction.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// A connection URL was malformed.
    #[error("malformed connection URL: {0}")]
    UrlParse(#[from] url::ParseError),
}
