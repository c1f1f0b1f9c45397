use std::any::Any;
use std::sync::Arc;

use crate::heuristic::{Heuristic, ResourceOutcome};
use crate::transaction::Status;
use crate::xid::TransactionId;

/// XA flags, return codes and error codes.
pub mod xa {
    pub const TMNOFLAGS: i32 = 0x0000_0000;
    pub const TMJOIN: i32 = 0x0020_0000;
    pub const TMRESUME: i32 = 0x0800_0000;
    pub const TMSUCCESS: i32 = 0x0400_0000;
    pub const TMFAIL: i32 = 0x2000_0000;
    pub const TMSUSPEND: i32 = 0x0200_0000;
    pub const TMSTARTRSCAN: i32 = 0x0100_0000;
    pub const TMENDRSCAN: i32 = 0x0080_0000;
    pub const TMONEPHASE: i32 = 0x4000_0000;

    pub const XA_OK: i32 = 0;
    pub const XA_RDONLY: i32 = 3;
    pub const XA_RETRY: i32 = 4;
    pub const XA_HEURMIX: i32 = 5;
    pub const XA_HEURRB: i32 = 6;
    pub const XA_HEURCOM: i32 = 7;
    pub const XA_HEURHAZ: i32 = 8;

    pub const XA_RBBASE: i32 = 100;
    pub const XA_RBROLLBACK: i32 = XA_RBBASE;
    pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;
    pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;
    pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;
    pub const XA_RBOTHER: i32 = XA_RBBASE + 4;
    pub const XA_RBPROTO: i32 = XA_RBBASE + 5;
    pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;
    pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;
    pub const XA_RBEND: i32 = XA_RBTRANSIENT;

    pub const XAER_ASYNC: i32 = -2;
    pub const XAER_RMERR: i32 = -3;
    pub const XAER_NOTA: i32 = -4;
    pub const XAER_INVAL: i32 = -5;
    pub const XAER_PROTO: i32 = -6;
    pub const XAER_RMFAIL: i32 = -7;
    pub const XAER_DUPID: i32 = -8;
    pub const XAER_OUTSIDE: i32 = -9;
}

/// Error raised by an XA resource, carrying an XA reason code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("XA error {code}: {message}")]
pub struct XaError {
    pub code: i32,
    pub message: String,
}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(code: i32) -> Self {
        Self::new(code, "")
    }
}

/// A resource manager branch driven through the XA protocol.
///
/// Every call receives the branch id the transaction manager allocated for
/// this resource. Calls must not block indefinitely: the transaction lock is
/// held for their duration.
pub trait XaResource: Send + Sync {
    fn start(&self, xid: &TransactionId, flags: i32) -> Result<(), XaError>;

    fn end(&self, xid: &TransactionId, flags: i32) -> Result<(), XaError>;

    /// Returns [`xa::XA_OK`] to vote commit or [`xa::XA_RDONLY`] when the
    /// branch performed no updates.
    fn prepare(&self, xid: &TransactionId) -> Result<i32, XaError>;

    fn commit(&self, xid: &TransactionId, one_phase: bool) -> Result<(), XaError>;

    fn rollback(&self, xid: &TransactionId) -> Result<(), XaError>;

    fn forget(&self, xid: &TransactionId) -> Result<(), XaError>;

    /// Branches the resource manager holds in the prepared state.
    fn recover(&self, _flags: i32) -> Result<Vec<TransactionId>, XaError> {
        Ok(Vec::new())
    }

    /// Whether `other` is a handle onto the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool;

    fn set_transaction_timeout(&self, _seconds: u64) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

pub type XaHandle = Arc<dyn XaResource>;

/// Identity comparison of two resource handles.
pub fn same_handle(a: &XaHandle, b: &XaHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Vote returned by a subordinate or remote resource on prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    ReadOnly,
    Commit,
    Rollback,
}

impl From<Vote> for ResourceOutcome {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::ReadOnly => ResourceOutcome::ReadOnly,
            Vote::Commit => ResourceOutcome::Commit,
            Vote::Rollback => ResourceOutcome::Rollback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote resource completed heuristically: {0}")]
    Heuristic(Heuristic),

    #[error("Remote resource rolled back")]
    RolledBack,

    #[error("Remote resource failed: {0}")]
    Failed(String),
}

impl From<&RemoteError> for ResourceOutcome {
    fn from(error: &RemoteError) -> Self {
        match error {
            RemoteError::Heuristic(heuristic) => ResourceOutcome::Heuristic(*heuristic),
            RemoteError::RolledBack => ResourceOutcome::Rollback,
            RemoteError::Failed(reason) => ResourceOutcome::SystemError(reason.clone()),
        }
    }
}

/// A participant reached through a remote coordinator.
pub trait RemoteResource: Send + Sync {
    fn prepare(&self) -> Result<Vote, RemoteError>;

    fn commit(&self) -> Result<(), RemoteError>;

    fn commit_one_phase(&self) -> Result<(), RemoteError>;

    fn rollback(&self) -> Result<(), RemoteError>;

    fn forget(&self) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynchronizationError {
    #[error("Synchronization requested rollback")]
    RollbackRequested,

    #[error("Synchronization failed: {0}")]
    Failed(String),
}

/// Listener notified around transaction completion.
pub trait Synchronization: Send + Sync {
    /// Called before the prepare phase. Any error rolls the transaction back.
    fn before_completion(&self) -> Result<(), SynchronizationError>;

    /// Called once the transaction reached its final status.
    fn after_completion(&self, status: Status);
}

/// Callback registered on a thread that wants to learn when the thread's
/// resources are delisted from a transaction.
pub trait EnlistedResource: Send + Sync {
    /// `flags` is one of [`xa::TMSUCCESS`], [`xa::TMFAIL`] or [`xa::TMSUSPEND`].
    fn delisted(&self, xid: &TransactionId, flags: i32);
}
