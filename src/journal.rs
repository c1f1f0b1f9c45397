use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{Result, TxError};
use crate::heuristic::Heuristic;
use crate::xid::TransactionId;

/// One entry of the recovery log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    Prepared { xid: TransactionId, decision: Heuristic },
    Committed { xid: TransactionId, decision: Heuristic },
    RolledBack { xid: TransactionId },
    Forgotten { xid: TransactionId },
}

impl JournalRecord {
    pub fn xid(&self) -> &TransactionId {
        match self {
            JournalRecord::Prepared { xid, .. }
            | JournalRecord::Committed { xid, .. }
            | JournalRecord::RolledBack { xid }
            | JournalRecord::Forgotten { xid } => xid,
        }
    }
}

/// A transaction found in the journal without a matching forget record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredTransaction {
    pub xid: TransactionId,
    /// The decision recorded with the latest record.
    pub decision: Heuristic,
    /// Whether the commit decision reached the journal. Transactions that
    /// were only prepared are presumed to abort.
    pub committed: bool,
}

/// Persistent log of two-phase commit decisions.
///
/// A transaction that prepares with more than one participant is logged
/// with [`Journal::prepare`], then [`Journal::commit`] or
/// [`Journal::rollback`], and finally [`Journal::forget`]. Anything without
/// a forget record is handed back by [`Journal::recover`] when a domain
/// starts.
///
/// # Examples
///
/// ```no_run
/// use maat::prelude::*;
///
/// #[derive(Default)]
/// struct NullJournal;
///
/// impl Journal for NullJournal {
///     fn prepare(&self, _xid: &TransactionId, _decision: Heuristic) -> Result<()> { Ok(()) }
///     fn commit(&self, _xid: &TransactionId, _decision: Heuristic) -> Result<()> { Ok(()) }
///     fn rollback(&self, _xid: &TransactionId) -> Result<()> { Ok(()) }
///     fn forget(&self, _xid: &TransactionId) -> Result<()> { Ok(()) }
///     fn recover(&self) -> Result<Vec<RecoveredTransaction>> { Ok(Vec::new()) }
///     fn close(&self) -> Result<()> { Ok(()) }
/// }
/// ```
pub trait Journal: Send + Sync {
    fn prepare(&self, xid: &TransactionId, decision: Heuristic) -> Result<()>;

    fn commit(&self, xid: &TransactionId, decision: Heuristic) -> Result<()>;

    fn rollback(&self, xid: &TransactionId) -> Result<()>;

    fn forget(&self, xid: &TransactionId) -> Result<()>;

    fn recover(&self) -> Result<Vec<RecoveredTransaction>>;

    fn close(&self) -> Result<()>;
}

/// Journal that keeps its records in memory. Suitable for tests and for
/// processes that do not need to survive a crash.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
    closed: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the journal with records, e.g. to simulate a restart.
    pub fn with_records(records: Vec<JournalRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            closed: AtomicBool::new(false),
        }
    }

    /// All records written so far, oldest first.
    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn append(&self, record: JournalRecord) -> Result<()> {
        if self.is_closed() {
            return Err(TxError::Journal(format!(
                "journal closed, cannot log {}",
                record.xid()
            )));
        }
        debug!("Journal: {:?}", record);
        self.records.lock().push(record);
        Ok(())
    }
}

impl Journal for MemoryJournal {
    fn prepare(&self, xid: &TransactionId, decision: Heuristic) -> Result<()> {
        self.append(JournalRecord::Prepared {
            xid: *xid,
            decision,
        })
    }

    fn commit(&self, xid: &TransactionId, decision: Heuristic) -> Result<()> {
        self.append(JournalRecord::Committed {
            xid: *xid,
            decision,
        })
    }

    fn rollback(&self, xid: &TransactionId) -> Result<()> {
        self.append(JournalRecord::RolledBack { xid: *xid })
    }

    fn forget(&self, xid: &TransactionId) -> Result<()> {
        self.append(JournalRecord::Forgotten { xid: *xid })
    }

    fn recover(&self) -> Result<Vec<RecoveredTransaction>> {
        let records = self.records.lock();
        let mut order = Vec::new();
        let mut pending: HashMap<TransactionId, RecoveredTransaction> = HashMap::new();
        for record in records.iter() {
            match record {
                JournalRecord::Prepared { xid, decision } => {
                    if !pending.contains_key(xid) {
                        order.push(*xid);
                    }
                    pending.insert(
                        *xid,
                        RecoveredTransaction {
                            xid: *xid,
                            decision: *decision,
                            committed: false,
                        },
                    );
                }
                JournalRecord::Committed { xid, decision } => {
                    if let Some(entry) = pending.get_mut(xid) {
                        entry.decision = *decision;
                        entry.committed = true;
                    }
                }
                JournalRecord::RolledBack { xid } => {
                    if let Some(entry) = pending.get_mut(xid) {
                        entry.decision = Heuristic::Rollback;
                        entry.committed = false;
                    }
                }
                JournalRecord::Forgotten { xid } => {
                    pending.remove(xid);
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|xid| pending.remove(&xid))
            .collect())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
