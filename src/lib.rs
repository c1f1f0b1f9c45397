pub mod association;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod enlistment;
pub mod errors;
pub mod heuristic;
pub mod journal;
pub mod registry;
pub mod resource;
pub mod stats;
pub mod timer;
pub mod transaction;
pub mod xid;

// Re-export key types and structs for easier access
pub use association::{AssociationGuard, ThreadAssociations};
pub use config::DomainConfig;
pub use coordinator::{CoordinatorAdapter, CoordinatorStatus, PropagationContext};
pub use domain::{AsyncCompletion, RecoveryReport, TransactionDomain};
pub use errors::{Operation, Result, TxError};
pub use heuristic::{Heuristic, HeuristicFlags, ResourceOutcome};
pub use journal::{Journal, JournalRecord, MemoryJournal, RecoveredTransaction};
pub use registry::{DomainRegistry, prelude};
pub use resource::{
    EnlistedResource, RemoteError, RemoteResource, Synchronization, SynchronizationError, Vote,
    XaError, XaHandle, XaResource,
};
pub use stats::StatsSnapshot;
pub use transaction::{Status, Transaction};
pub use xid::TransactionId;
