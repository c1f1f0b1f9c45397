//! Remote-facing view over a transaction.
//!
//! [`CoordinatorAdapter`] answers the questions a remote coordinator asks
//! about a transaction (status, ancestry, identity) and produces the
//! [`PropagationContext`] shipped to other processes. A transaction
//! imported from such a context is driven by its superior through
//! [`SubordinateResource`].

use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::hash::BuildHasher;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::errors::{Result, TxError};
use crate::heuristic::{Heuristic, ResourceOutcome};
use crate::resource::{RemoteError, RemoteResource, Synchronization, Vote};
use crate::transaction::{Status, Transaction};
use crate::xid::TransactionId;

/// Identity chain and timeout of a transaction, outermost transaction
/// first, used to import the transaction in another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireContext")]
pub struct PropagationContext {
    timeout: Duration,
    chain: Vec<TransactionId>,
}

/// Unchecked form of [`PropagationContext`] as it arrives on the wire.
#[derive(Deserialize)]
struct WireContext {
    timeout: Duration,
    chain: Vec<TransactionId>,
}

impl TryFrom<WireContext> for PropagationContext {
    type Error = TxError;

    fn try_from(wire: WireContext) -> Result<Self> {
        Self::new(wire.timeout, wire.chain)
    }
}

impl PropagationContext {
    pub fn new(timeout: Duration, chain: Vec<TransactionId>) -> Result<Self> {
        if chain.is_empty() {
            return Err(TxError::Propagation("empty transaction chain".to_string()));
        }
        Ok(Self { timeout, chain })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn chain(&self) -> &[TransactionId] {
        &self.chain
    }

    /// The transaction the context was exported from.
    pub fn current(&self) -> &TransactionId {
        &self.chain[self.chain.len() - 1]
    }

    pub fn top_level(&self) -> &TransactionId {
        &self.chain[0]
    }

    /// Ancestors of [`PropagationContext::current`], outermost first.
    pub fn parents(&self) -> &[TransactionId] {
        &self.chain[..self.chain.len() - 1]
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|err| TxError::Propagation(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| TxError::Propagation(err.to_string()))
    }
}

/// Transaction status as reported to remote coordinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorStatus {
    Active,
    MarkedRollback,
    Prepared,
    Committed,
    RolledBack,
    Unknown,
    NoTransaction,
    Preparing,
    Committing,
    RollingBack,
}

impl From<Status> for CoordinatorStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Active => CoordinatorStatus::Active,
            Status::MarkedRollback => CoordinatorStatus::MarkedRollback,
            Status::Preparing => CoordinatorStatus::Preparing,
            Status::Prepared => CoordinatorStatus::Prepared,
            Status::Committing => CoordinatorStatus::Committing,
            Status::Committed => CoordinatorStatus::Committed,
            Status::RollingBack => CoordinatorStatus::RollingBack,
            Status::RolledBack => CoordinatorStatus::RolledBack,
        }
    }
}

pub struct CoordinatorAdapter {
    transaction: Arc<Transaction>,
    context: OnceLock<PropagationContext>,
}

impl CoordinatorAdapter {
    pub fn new(transaction: Arc<Transaction>) -> Self {
        Self {
            transaction,
            context: OnceLock::new(),
        }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.transaction.status().into()
    }

    /// Status of the parent, or of the transaction itself when it is top
    /// level.
    pub fn parent_status(&self) -> CoordinatorStatus {
        match self.transaction.parent() {
            Some(parent) => parent.status().into(),
            None => self.status(),
        }
    }

    pub fn top_level_status(&self) -> CoordinatorStatus {
        self.transaction.top_level().status().into()
    }

    pub fn is_same_transaction(&self, other: &Transaction) -> bool {
        self.transaction.id() == other.id()
    }

    /// Whether `other` is this transaction or one of its ancestors, local
    /// or remote.
    pub fn is_ancestor(&self, other: &Transaction) -> bool {
        lineage(&self.transaction).contains(other.id())
    }

    /// Whether `other` is this transaction or one of its descendants.
    pub fn is_descendant(&self, other: &Transaction) -> bool {
        lineage(other).contains(self.transaction.id())
    }

    /// Whether both transactions belong to the same global transaction.
    pub fn is_related(&self, other: &Transaction) -> bool {
        self.transaction.id().same_global(other.id())
    }

    pub fn is_top_level(&self) -> bool {
        self.transaction.is_top_level() && self.transaction.imported_context().is_none()
    }

    pub fn hash_transaction(&self) -> u64 {
        stable_hash(self.transaction.id())
    }

    pub fn hash_top_level_transaction(&self) -> u64 {
        stable_hash(self.propagation_context().top_level())
    }

    pub fn transaction_name(&self) -> String {
        self.transaction.id().to_string()
    }

    pub fn register_resource(&self, resource: Arc<dyn RemoteResource>) -> Result<()> {
        self.transaction.register_remote_resource(resource)
    }

    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        self.transaction.register_synchronization(synchronization)
    }

    pub fn rollback_only(&self) -> Result<()> {
        self.transaction.set_rollback_only()
    }

    /// The context describing this transaction, computed on first use.
    pub fn propagation_context(&self) -> &PropagationContext {
        self.context.get_or_init(|| PropagationContext {
            timeout: self.transaction.remaining().unwrap_or(Duration::ZERO),
            chain: lineage(&self.transaction),
        })
    }

    /// Creates a subtransaction of this transaction in its domain.
    pub fn create_subtransaction(&self) -> Result<CoordinatorAdapter> {
        let status = self.transaction.status();
        if !status.is_active() {
            return Err(TxError::InvalidState {
                xid: *self.transaction.id(),
                operation: "create a subtransaction of",
                status,
            });
        }
        let domain = self.transaction.domain().ok_or_else(|| {
            TxError::DomainShutdown(format!("owner of {}", self.transaction.id()))
        })?;
        let timeout = self.transaction.remaining().unwrap_or(Duration::ZERO);
        let child = domain.create_transaction(Some(&self.transaction), timeout)?;
        Ok(CoordinatorAdapter::new(child))
    }

    /// A resource through which a superior coordinator drives this
    /// transaction.
    pub fn subordinate_resource(&self) -> Arc<dyn RemoteResource> {
        Arc::new(SubordinateResource {
            transaction: Arc::clone(&self.transaction),
        })
    }
}

/// Identity chain from the outermost known transaction down to `transaction`.
fn lineage(transaction: &Transaction) -> Vec<TransactionId> {
    let mut local = vec![*transaction.id()];
    let mut top = transaction.parent().cloned();
    let mut imported = transaction.imported_context().cloned();
    while let Some(parent) = top {
        local.push(*parent.id());
        imported = parent.imported_context().cloned();
        top = parent.parent().cloned();
    }
    local.reverse();
    match imported {
        Some(context) => context.chain.into_iter().chain(local).collect(),
        None => local,
    }
}

fn stable_hash(xid: &TransactionId) -> u64 {
    let state = RandomState::with_seeds(0x6d61, 0x6174, 0x7478, 0x6964);
    BuildHasher::hash_one(&state, xid.branch_id())
}

/// Drives an imported transaction on behalf of its superior.
pub struct SubordinateResource {
    transaction: Arc<Transaction>,
}

impl SubordinateResource {
    fn settle(&self, outcome: ResourceOutcome, expected: Heuristic) -> std::result::Result<(), RemoteError> {
        match outcome {
            ResourceOutcome::Commit if expected == Heuristic::Commit => {
                self.transaction.forget(Heuristic::Commit);
                Ok(())
            }
            ResourceOutcome::Rollback if expected == Heuristic::Rollback => {
                self.transaction.forget(Heuristic::Rollback);
                Ok(())
            }
            ResourceOutcome::Rollback => {
                self.transaction.forget(Heuristic::Rollback);
                Err(RemoteError::RolledBack)
            }
            ResourceOutcome::Commit | ResourceOutcome::ReadOnly => {
                Err(RemoteError::Heuristic(Heuristic::Commit))
            }
            ResourceOutcome::Heuristic(heuristic) => Err(RemoteError::Heuristic(heuristic)),
            ResourceOutcome::SystemError(reason) => Err(RemoteError::Failed(reason)),
        }
    }
}

impl RemoteResource for SubordinateResource {
    fn prepare(&self) -> std::result::Result<Vote, RemoteError> {
        match self.transaction.prepare_for_superior() {
            ResourceOutcome::ReadOnly => {
                self.transaction.forget(Heuristic::Commit);
                Ok(Vote::ReadOnly)
            }
            ResourceOutcome::Commit => Ok(Vote::Commit),
            ResourceOutcome::Rollback => Ok(Vote::Rollback),
            ResourceOutcome::Heuristic(heuristic) => Err(RemoteError::Heuristic(heuristic)),
            ResourceOutcome::SystemError(reason) => Err(RemoteError::Failed(reason)),
        }
    }

    fn commit(&self) -> std::result::Result<(), RemoteError> {
        let outcome = self.transaction.commit_for_superior(false);
        self.settle(outcome, Heuristic::Commit)
    }

    fn commit_one_phase(&self) -> std::result::Result<(), RemoteError> {
        let outcome = self.transaction.commit_for_superior(true);
        self.settle(outcome, Heuristic::Commit)
    }

    fn rollback(&self) -> std::result::Result<(), RemoteError> {
        let outcome = self.transaction.rollback_for_superior();
        self.settle(outcome, Heuristic::Rollback)
    }

    fn forget(&self) -> std::result::Result<(), RemoteError> {
        self.transaction.forget(Heuristic::ReadOnly);
        Ok(())
    }
}
