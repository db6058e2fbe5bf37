use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Transaction isolation level; controls the degree of locking that occurs
/// when selecting data.
///
/// Applied to every physical connection the pool opens, unless left at
/// [`Default`](TransactionIsolation::Default), in which case the driver's own
/// default is untouched.
///
/// See <https://en.wikipedia.org/wiki/Isolation_(database_systems)#Isolation_levels>.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransactionIsolation {
    /// Transactions are not supported on this connection.
    None,

    /// The lowest isolation level. Dirty reads are allowed, so one transaction
    /// may see **not yet committed** changes made by other transactions.
    ReadUncommitted,

    /// A `SELECT` query will only see data that has been committed before the
    /// query began.
    ReadCommitted,

    /// A `SELECT` query will only see data committed before the transaction
    /// began.
    RepeatableRead,

    Serializable,

    /// Leave the driver's default isolation level in place.
    #[default]
    Default,
}

impl TransactionIsolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionIsolation::None => "none",
            TransactionIsolation::ReadUncommitted => "read_uncommitted",
            TransactionIsolation::ReadCommitted => "read_committed",
            TransactionIsolation::RepeatableRead => "repeatable_read",
            TransactionIsolation::Serializable => "serializable",
            TransactionIsolation::Default => "default",
        }
    }
}

impl fmt::Display for TransactionIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionIsolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(TransactionIsolation::None),
            "read_uncommitted" => Ok(TransactionIsolation::ReadUncommitted),
            "read_committed" => Ok(TransactionIsolation::ReadCommitted),
            "repeatable_read" => Ok(TransactionIsolation::RepeatableRead),
            "serializable" => Ok(TransactionIsolation::Serializable),
            "default" => Ok(TransactionIsolation::Default),
            _ => Err(Error::Configuration(format!(
                "unknown transaction isolation level {s:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionIsolation;

    #[test]
    fn round_trips_through_strings() {
        for level in [
            TransactionIsolation::None,
            TransactionIsolation::ReadUncommitted,
            TransactionIsolation::ReadCommitted,
            TransactionIsolation::RepeatableRead,
            TransactionIsolation::Serializable,
            TransactionIsolation::Default,
        ] {
            assert_eq!(level.as_str().parse::<TransactionIsolation>().unwrap(), level);
        }
    }

    #[test]
    fn rejects_unknown_levels() {
        assert!("chaos".parse::<TransactionIsolation>().is_err());
    }
}
