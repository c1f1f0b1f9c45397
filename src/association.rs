//! Per-thread transaction context.
//!
//! Each thread that touches a domain gets a [`ThreadAssociation`] record,
//! created lazily, holding its current transaction, the XA resources opened
//! on it, delist callbacks and its requested timeout. The table is an
//! explicit object shared by every domain of a [`crate::DomainRegistry`].

use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::errors::{Result, TxError};
use crate::resource::{EnlistedResource, XaHandle, same_handle};
use crate::transaction::Transaction;

#[derive(Default)]
pub struct ThreadAssociation {
    transaction: Option<Arc<Transaction>>,
    resources: Vec<XaHandle>,
    callbacks: Vec<Arc<dyn EnlistedResource>>,
    timeout: Option<Duration>,
}

impl ThreadAssociation {
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn resources(&self) -> &[XaHandle] {
        &self.resources
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Thread to transaction association table.
#[derive(Default)]
pub struct ThreadAssociations {
    threads: Mutex<HashMap<ThreadId, ThreadAssociation>>,
}

impl ThreadAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction associated with the calling thread.
    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.current_for(thread::current().id())
    }

    pub fn current_for(&self, thread: ThreadId) -> Option<Arc<Transaction>> {
        self.threads
            .lock()
            .get(&thread)
            .and_then(|association| association.transaction.clone())
    }

    /// Threads currently associated with `transaction`.
    pub fn threads_for(&self, transaction: &Transaction) -> Vec<ThreadId> {
        self.threads
            .lock()
            .iter()
            .filter(|(_, association)| is_same(association, transaction))
            .map(|(thread, _)| *thread)
            .collect()
    }

    /// Timeout requested for transactions begun on the calling thread.
    /// `None` restores the domain default.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.with_current(|association| association.timeout = timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.threads
            .lock()
            .get(&thread::current().id())
            .and_then(|association| association.timeout)
    }

    /// Records a resource opened on the calling thread. It is enlisted in
    /// every transaction begun or resumed on the thread.
    pub fn register_resource(&self, resource: XaHandle) {
        self.with_current(|association| {
            if !association
                .resources
                .iter()
                .any(|existing| same_handle(existing, &resource))
            {
                association.resources.push(resource);
            }
        });
    }

    pub fn unregister_resource(&self, resource: &XaHandle) -> bool {
        self.with_current(|association| {
            let before = association.resources.len();
            association
                .resources
                .retain(|existing| !same_handle(existing, resource));
            association.resources.len() != before
        })
    }

    pub fn resources(&self) -> Vec<XaHandle> {
        self.threads
            .lock()
            .get(&thread::current().id())
            .map(|association| association.resources.clone())
            .unwrap_or_default()
    }

    /// Registers a callback told when the thread's resources are delisted.
    pub fn register_callback(&self, callback: Arc<dyn EnlistedResource>) {
        self.with_current(|association| association.callbacks.push(callback));
    }

    /// Drops the calling thread's record, e.g. before a pooled thread is
    /// reused.
    pub fn clear(&self) {
        self.threads.lock().remove(&thread::current().id());
    }

    /// Makes `transaction` current on the calling thread.
    ///
    /// Fails when the thread is already associated with an active
    /// transaction.
    pub fn associate(&self, transaction: Arc<Transaction>) -> Result<()> {
        if let Some(current) = self.current() {
            if current.status().is_active() {
                return Err(TxError::AlreadyAssociated(*current.id()));
            }
        }
        self.set_current(Some(transaction));
        Ok(())
    }

    /// Detaches and returns the calling thread's transaction.
    pub fn disassociate(&self) -> Option<Arc<Transaction>> {
        self.set_current(None)
    }

    /// Swaps the calling thread's transaction, returning the previous one.
    pub(crate) fn set_current(&self, transaction: Option<Arc<Transaction>>) -> Option<Arc<Transaction>> {
        let mut threads = self.threads.lock();
        let thread = thread::current().id();
        match transaction {
            Some(transaction) => threads
                .entry(thread)
                .or_default()
                .transaction
                .replace(transaction),
            None => threads
                .get_mut(&thread)
                .and_then(|association| association.transaction.take()),
        }
    }

    /// Delist callbacks of every thread associated with `transaction`.
    pub(crate) fn callbacks_for(&self, transaction: &Transaction) -> Vec<Arc<dyn EnlistedResource>> {
        self.threads
            .lock()
            .values()
            .filter(|association| is_same(association, transaction))
            .flat_map(|association| association.callbacks.iter().cloned())
            .collect()
    }

    /// Detaches the calling thread's transaction and suspends its active
    /// branches.
    ///
    /// Returns `None` when there is no transaction or it already completed.
    pub fn suspend(&self) -> Option<Arc<Transaction>> {
        let transaction = self.disassociate()?;
        if !transaction.status().is_active() {
            return None;
        }
        transaction.suspend_resources();
        for callback in self.callbacks() {
            callback.delisted(transaction.id(), crate::resource::xa::TMSUSPEND);
        }
        debug!("Suspended {} from {:?}", transaction.id(), thread::current().id());
        Some(transaction)
    }

    /// Makes a suspended transaction current again and enlists the
    /// thread's resources into its top-level transaction.
    ///
    /// Enlistment failures caused by the transaction rolling back are
    /// ignored; the association stays in place.
    pub fn resume(&self, transaction: Arc<Transaction>) -> Result<()> {
        self.associate(Arc::clone(&transaction))?;
        debug!("Resumed {} on {:?}", transaction.id(), thread::current().id());
        match self.enlist_pending(&transaction.top_level()) {
            Err(err) if err.is_rollback() => {
                debug!("Ignoring enlistment failure on resume of {}: {}", transaction.id(), err);
                Ok(())
            }
            result => result,
        }
    }

    /// Enlists every resource registered on the calling thread.
    pub fn enlist_pending(&self, transaction: &Arc<Transaction>) -> Result<()> {
        for resource in self.resources() {
            transaction.enlist_resource(resource)?;
        }
        Ok(())
    }

    /// Makes `transaction` current on the calling thread until the guard is
    /// dropped, then restores the previous association.
    pub fn make_current(&self, transaction: &Arc<Transaction>) -> AssociationGuard<'_> {
        let already_current = self
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, transaction));
        let previous = if already_current {
            None
        } else {
            Some(self.set_current(Some(Arc::clone(transaction))))
        };
        AssociationGuard {
            associations: self,
            previous,
        }
    }

    fn callbacks(&self) -> Vec<Arc<dyn EnlistedResource>> {
        self.threads
            .lock()
            .get(&thread::current().id())
            .map(|association| association.callbacks.clone())
            .unwrap_or_default()
    }

    fn with_current<R>(&self, f: impl FnOnce(&mut ThreadAssociation) -> R) -> R {
        let mut threads = self.threads.lock();
        f(threads.entry(thread::current().id()).or_default())
    }
}

fn is_same(association: &ThreadAssociation, transaction: &Transaction) -> bool {
    association
        .transaction
        .as_ref()
        .is_some_and(|current| std::ptr::eq(current.as_ref(), transaction))
}

/// Restores a thread's previous association on drop.
pub struct AssociationGuard<'a> {
    associations: &'a ThreadAssociations,
    previous: Option<Option<Arc<Transaction>>>,
}

impl Drop for AssociationGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.associations.set_current(previous);
        }
    }
}
