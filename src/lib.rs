//! Pooled, transaction-aware database connection management.
//!
//! `aquifer` sits between application code and a database driver. It owns a
//! bounded set of physical connections, hands them out to callers, pins them
//! to distributed transactions so that work inside one transaction always
//! lands on the same physical connection, caches prepared statements per
//! connection, and reclaims connections that have aged out or leaked.
//!
//! This crate is a facade over [`aquifer-core`](aquifer_core); see
//! [`Pool`] for the entry point.

pub use aquifer_core::*;
