//! Collaborator interfaces for distributed-transaction coupling.
//!
//! The pool does not manage transactions itself; it cooperates with an
//! external transaction manager through the traits here. A caller (or the
//! ambient [`TransactionManager`]) presents a [`Transaction`] at acquire
//! time; the pool enlists the managed connection's [`TransactionResource`]
//! facet and registers a completion hook so the connection can be flushed
//! back to the free set once the transaction commits or rolls back.

use std::fmt;
use std::sync::Arc;

use crate::driver::DriverError;

/// Identifier of one global transaction, unique while that transaction is
/// in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Final status delivered to completion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Committed,
    RolledBack,
}

/// Why an enlistment or completion registration was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnlistError {
    /// The transaction has been marked rollback-only; no new work may join,
    /// but work already enlisted stays enlisted.
    #[error("transaction is marked rollback-only")]
    RollbackOnly,

    /// The transaction already committed or rolled back.
    #[error("transaction has already completed")]
    AlreadyCompleted,
}

/// Hook invoked by the transaction manager once the transaction completes.
pub type CompletionHook = Box<dyn FnOnce(TxStatus) + Send>;

/// Vote returned from the prepare step of completion. This pool is a
/// single-resource participant, so prepare always succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Ok,
}

/// One in-flight global transaction, as seen by the pool.
///
/// The pool invokes `enlist`, `delist`, and `register_completion` while its
/// own region lock is held; implementations must not call back into the pool
/// from inside these methods. Completion hooks are delivered later, from the
/// transaction manager's own thread, and may call into the pool freely.
pub trait Transaction: Send + Sync {
    fn id(&self) -> TxId;

    /// Enlist a resource in this transaction.
    fn enlist(&self, resource: Arc<dyn TransactionResource>) -> Result<(), EnlistError>;

    /// Remove a resource from this transaction; `success` is false when the
    /// resource failed and its work must not be committed.
    fn delist(&self, resource: &dyn TransactionResource, success: bool);

    /// Ask to be told when this transaction completes. Implementations must
    /// return [`EnlistError::AlreadyCompleted`] rather than running the hook
    /// inline when the transaction is already over.
    fn register_completion(&self, hook: CompletionHook) -> Result<(), EnlistError>;
}

/// Produces the transaction ambient to the calling thread, if any.
pub trait TransactionManager: Send + Sync {
    fn current(&self) -> Option<Arc<dyn Transaction>>;
}

/// The transactional facet of a managed connection.
///
/// Each pooled connection is a distinct resource: [`same_resource`] compares
/// object identity, never driver identity, so the transaction manager treats
/// every managed connection as its own branch.
///
/// [`same_resource`]: TransactionResource::same_resource
pub trait TransactionResource: Send + Sync {
    /// Identity of this resource within its pool.
    fn resource_id(&self) -> u64;

    /// Single-resource prepare; always votes to commit.
    fn prepare(&self) -> Vote {
        Vote::Ok
    }

    /// Commit through to the physical connection.
    fn commit(&self) -> Result<(), DriverError>;

    /// Roll back through to the physical connection.
    fn rollback(&self) -> Result<(), DriverError>;

    fn same_resource(&self, other: &dyn TransactionResource) -> bool {
        self.resource_id() == other.resource_id()
    }
}
