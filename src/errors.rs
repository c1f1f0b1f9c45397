use thiserror::Error;

use crate::heuristic::Heuristic;
use crate::transaction::Status;
use crate::xid::TransactionId;

/// Operations that are subject to the domain's authorization predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Prepare,
    Commit,
    Rollback,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Prepare => "prepare",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("No transaction associated with the current thread")]
    NoTransaction,

    #[error("Thread is already associated with transaction {0}")]
    AlreadyAssociated(TransactionId),

    #[error("Cannot {operation} transaction {xid} in status {status}")]
    InvalidState {
        xid: TransactionId,
        operation: &'static str,
        status: Status,
    },

    #[error("Transaction {0} timed out")]
    TimedOut(TransactionId),

    #[error("Transaction {0} rolled back")]
    RolledBack(TransactionId),

    #[error("Transaction {xid} completed heuristically: {outcome}")]
    Heuristic { xid: TransactionId, outcome: Heuristic },

    #[error("Caller is not allowed to {operation} transaction {xid}")]
    Security {
        xid: TransactionId,
        operation: Operation,
    },

    #[error("System error: {0}")]
    System(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Invalid transaction id: {0}")]
    InvalidId(String),

    #[error("Unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    #[error("Domain {0} already exists")]
    DomainExists(String),

    #[error("Unknown domain {0}")]
    UnknownDomain(String),

    #[error("Domain {0} is shut down")]
    DomainShutdown(String),

    #[error("Domain {name} reached its limit of {limit} active transactions")]
    TooManyTransactions { name: String, limit: usize },

    #[error("Propagation context error: {0}")]
    Propagation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TxError {
    /// Whether this error reports that the transaction did not commit.
    pub fn is_rollback(&self) -> bool {
        matches!(self, TxError::RolledBack(_) | TxError::TimedOut(_))
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
