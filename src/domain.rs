use ahash::AHashMap as HashMap;
use futures::channel::oneshot;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crate::association::ThreadAssociations;
use crate::config::DomainConfig;
use crate::coordinator::PropagationContext;
use crate::errors::{Operation, Result, TxError};
use crate::journal::{Journal, MemoryJournal, RecoveredTransaction};
use crate::resource::{XaHandle, xa};
use crate::stats::{StatsSnapshot, TransactionStats};
use crate::timer::TimeoutScanner;
use crate::transaction::{Status, Transaction};
use crate::xid::TransactionId;

/// Predicate deciding whether the calling thread may complete a transaction.
pub type Authorizer = dyn Fn(&TransactionId, Operation) -> bool + Send + Sync;

/// Outcome of resolving in-doubt branches reported by a resource manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: Vec<TransactionId>,
    pub rolled_back: Vec<TransactionId>,
    pub failed: Vec<TransactionId>,
}

/// Handle on a commit or rollback running on a worker thread.
///
/// Resolves to the result of the completion. [`AsyncCompletion::wait`]
/// blocks the calling thread instead.
pub struct AsyncCompletion {
    xid: TransactionId,
    receiver: oneshot::Receiver<Result<()>>,
}

impl AsyncCompletion {
    pub fn xid(&self) -> &TransactionId {
        &self.xid
    }

    pub fn wait(self) -> Result<()> {
        futures::executor::block_on(self)
    }
}

impl Future for AsyncCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let xid = self.xid;
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(TxError::System(format!("completion worker of {} vanished", xid)))
            })
        })
    }
}

struct Deadline {
    transaction: Weak<Transaction>,
    at: Instant,
}

/// A named set of transactions sharing configuration, journal and timer.
///
/// The domain creates transactions, associates them with threads, rolls
/// back those that outlive their timeout and resolves in-doubt branches
/// after a restart. Operations without a transaction argument act on the
/// transaction associated with the calling thread.
pub struct TransactionDomain {
    config: DomainConfig,
    journal: Arc<dyn Journal>,
    associations: Arc<ThreadAssociations>,
    transactions: RwLock<HashMap<TransactionId, Arc<Transaction>>>,
    deadlines: Mutex<HashMap<TransactionId, Deadline>>,
    in_doubt: Mutex<Vec<RecoveredTransaction>>,
    stats: TransactionStats,
    authorizer: RwLock<Option<Arc<Authorizer>>>,
    timer: Mutex<Option<TimeoutScanner>>,
    shutdown: AtomicBool,
    self_ref: Weak<TransactionDomain>,
}

impl TransactionDomain {
    /// Creates a domain, loads in-doubt transactions from `journal` and
    /// starts its timeout scanner.
    pub fn new(
        config: DomainConfig,
        journal: Arc<dyn Journal>,
        associations: Arc<ThreadAssociations>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let in_doubt = journal.recover()?;
        if !in_doubt.is_empty() {
            info!(
                "Domain {} recovered {} in-doubt transactions",
                config.name,
                in_doubt.len()
            );
        }
        let domain = Arc::new_cyclic(|self_ref| Self {
            config,
            journal,
            associations,
            transactions: RwLock::new(HashMap::new()),
            deadlines: Mutex::new(HashMap::new()),
            in_doubt: Mutex::new(in_doubt),
            stats: TransactionStats::new(),
            authorizer: RwLock::new(None),
            timer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        let scanner = TimeoutScanner::start(
            &domain.config.name,
            domain.config.timer_interval,
            Arc::downgrade(&domain),
        )?;
        *domain.timer.lock() = Some(scanner);
        Ok(domain)
    }

    /// A domain with an in-memory journal and its own association table.
    pub fn standalone(config: DomainConfig) -> Result<Arc<Self>> {
        Self::new(
            config,
            Arc::new(MemoryJournal::new()),
            Arc::new(ThreadAssociations::new()),
        )
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn associations(&self) -> &Arc<ThreadAssociations> {
        &self.associations
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Begins a transaction on the calling thread using the thread's
    /// timeout, or the domain default.
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        let timeout = self
            .associations
            .timeout()
            .unwrap_or(self.config.default_timeout);
        self.begin_with_timeout(timeout)
    }

    /// Begins a transaction on the calling thread and enlists the thread's
    /// registered resources into it.
    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<Arc<Transaction>> {
        if let Some(current) = self.associations.current() {
            if current.status().is_active() {
                return Err(TxError::AlreadyAssociated(*current.id()));
            }
        }
        let transaction = self.create_transaction(None, timeout)?;
        self.associations.associate(Arc::clone(&transaction))?;
        if let Err(err) = self.associations.enlist_pending(&transaction) {
            warn!("Failed to enlist thread resources into {}: {}", transaction.id(), err);
            transaction.mark_rollback_only();
        }
        Ok(transaction)
    }

    /// Begins a subtransaction of the calling thread's transaction and
    /// makes it current. Completing it makes the parent current again.
    pub fn begin_nested(&self) -> Result<Arc<Transaction>> {
        let parent = self.associations.current().ok_or(TxError::NoTransaction)?;
        let timeout = parent.remaining().unwrap_or(Duration::ZERO);
        let child = self.create_transaction(Some(&parent), timeout)?;
        self.associations.set_current(Some(Arc::clone(&child)));
        Ok(child)
    }

    /// Creates a transaction without associating it with any thread.
    ///
    /// With a parent the transaction is a subtransaction sharing the
    /// parent's global id; it is completed by the parent and is not kept
    /// in the domain's registry.
    pub fn create_transaction(
        &self,
        parent: Option<&Arc<Transaction>>,
        timeout: Duration,
    ) -> Result<Arc<Transaction>> {
        self.create(parent, timeout, None)
    }

    fn create(
        &self,
        parent: Option<&Arc<Transaction>>,
        timeout: Duration,
        imported: Option<PropagationContext>,
    ) -> Result<Arc<Transaction>> {
        if self.is_shutdown() {
            return Err(TxError::DomainShutdown(self.config.name.clone()));
        }
        let timeout = self.config.clamp_timeout(timeout);
        let id = match (parent, &imported) {
            (Some(parent), _) => parent.id().new_branch(),
            (None, Some(context)) => context.current().new_branch(),
            (None, None) => TransactionId::with_format(self.config.format_id),
        };
        if parent.is_none() {
            let active = self.transactions.read().len();
            if active >= self.config.max_active {
                return Err(TxError::TooManyTransactions {
                    name: self.config.name.clone(),
                    limit: self.config.max_active,
                });
            }
        }

        let transaction = Transaction::new(
            id,
            parent.cloned(),
            self.self_ref.clone(),
            Arc::clone(&self.associations),
            Arc::clone(&self.journal),
            timeout,
            imported,
        );
        match parent {
            Some(parent) => {
                parent.add_child(Arc::clone(&transaction))?;
                debug!("Began subtransaction {} of {}", id, parent.id());
            }
            None => {
                self.transactions.write().insert(id, Arc::clone(&transaction));
                if !timeout.is_zero() {
                    self.deadlines.lock().insert(
                        id,
                        Deadline {
                            transaction: Arc::downgrade(&transaction),
                            at: transaction.started() + timeout,
                        },
                    );
                }
                self.stats.record_begin();
                debug!("Began transaction {} in {} (timeout {:?})", id, self.config.name, timeout);
            }
        }
        Ok(transaction)
    }

    /// Recreates a transaction exported by another process.
    ///
    /// Importing the same global transaction twice returns the local
    /// transaction created the first time.
    pub fn import(&self, context: &PropagationContext) -> Result<Arc<Transaction>> {
        let existing = self
            .transactions
            .read()
            .values()
            .find(|transaction| {
                transaction
                    .imported_context()
                    .is_some_and(|imported| imported.current() == context.current())
            })
            .cloned();
        if let Some(transaction) = existing {
            return Ok(transaction);
        }
        let transaction = self.create(None, context.timeout(), Some(context.clone()))?;
        info!("Imported {} as {}", context.current(), transaction.id());
        Ok(transaction)
    }

    pub fn import_bytes(&self, bytes: &[u8]) -> Result<Arc<Transaction>> {
        self.import(&PropagationContext::from_bytes(bytes)?)
    }

    pub fn lookup(&self, xid: &TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.read().get(xid).cloned()
    }

    /// Number of top-level transactions that have not completed.
    pub fn active_count(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.associations.current()
    }

    pub fn status(&self) -> Option<Status> {
        self.current().map(|transaction| transaction.status())
    }

    /// Commits the calling thread's transaction.
    pub fn commit(&self) -> Result<()> {
        let transaction = self.current().ok_or(TxError::NoTransaction)?;
        let result = transaction.commit();
        self.after_completion(&transaction);
        result
    }

    /// Rolls back the calling thread's transaction.
    pub fn rollback(&self) -> Result<()> {
        let transaction = self.current().ok_or(TxError::NoTransaction)?;
        let result = transaction.rollback();
        self.after_completion(&transaction);
        result
    }

    /// Moves the calling thread off a transaction it just completed: to the
    /// parent for subtransactions, to nothing otherwise.
    fn after_completion(&self, transaction: &Arc<Transaction>) {
        let still_current = self
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, transaction));
        if !still_current {
            return;
        }
        match transaction.parent() {
            Some(parent) => {
                self.associations.set_current(Some(Arc::clone(parent)));
            }
            None if transaction.status().is_terminal() => {
                self.associations.disassociate();
            }
            None => {}
        }
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.current()
            .ok_or(TxError::NoTransaction)?
            .set_rollback_only()
    }

    pub fn suspend(&self) -> Option<Arc<Transaction>> {
        self.associations.suspend()
    }

    pub fn resume(&self, transaction: Arc<Transaction>) -> Result<()> {
        self.associations.resume(transaction)
    }

    /// Timeout for transactions begun later on the calling thread. Zero
    /// restores the domain default.
    pub fn set_transaction_timeout(&self, timeout: Duration) {
        let timeout = (!timeout.is_zero()).then(|| self.config.clamp_timeout(timeout));
        self.associations.set_timeout(timeout);
    }

    /// Commits the calling thread's transaction on a worker thread.
    ///
    /// The transaction is suspended from the calling thread before the
    /// worker starts and is not resumed afterwards.
    pub fn commit_async(&self) -> Result<AsyncCompletion> {
        self.complete_async(Operation::Commit)
    }

    /// Rolls back the calling thread's transaction on a worker thread.
    pub fn rollback_async(&self) -> Result<AsyncCompletion> {
        self.complete_async(Operation::Rollback)
    }

    fn complete_async(&self, operation: Operation) -> Result<AsyncCompletion> {
        let transaction = self.suspend().ok_or(TxError::NoTransaction)?;
        let xid = *transaction.id();
        let associations = Arc::clone(&self.associations);
        let (sender, receiver) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name(format!("maat-{}-{}", operation, xid.branch_id()))
            .spawn(move || {
                let result = associations
                    .associate(Arc::clone(&transaction))
                    .and_then(|()| match operation {
                        Operation::Rollback => transaction.rollback(),
                        _ => transaction.commit(),
                    });
                associations.disassociate();
                if sender.send(result).is_err() {
                    debug!("Nobody waited for the {} of {}", operation, transaction.id());
                }
            });
        if let Err(err) = spawned {
            return Err(TxError::System(format!(
                "failed to spawn {} worker for {}: {}",
                operation, xid, err
            )));
        }
        Ok(AsyncCompletion { xid, receiver })
    }

    /// Replaces the owner check with `authorizer`.
    pub fn set_authorizer(&self, authorizer: Arc<Authorizer>) {
        *self.authorizer.write() = Some(authorizer);
    }

    /// Whether the calling thread may perform `operation` on `transaction`.
    pub fn is_owner(&self, transaction: &Transaction, operation: Operation) -> bool {
        let authorizer = self.authorizer.read().clone();
        match authorizer {
            Some(authorizer) => authorizer(transaction.id(), operation),
            None => transaction.is_owned_by_current_thread(),
        }
    }

    /// Rolls back every transaction past its deadline and returns how many
    /// were rolled back. Busy transactions are marked rollback-only and
    /// retried on the next call.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<(TransactionId, Weak<Transaction>)> = self
            .deadlines
            .lock()
            .iter()
            .filter(|(_, deadline)| deadline.at <= now)
            .map(|(xid, deadline)| (*xid, deadline.transaction.clone()))
            .collect();

        let mut expired = 0;
        for (xid, transaction) in overdue {
            let Some(transaction) = transaction.upgrade() else {
                self.deadlines.lock().remove(&xid);
                continue;
            };
            if transaction.time_out() {
                self.deadlines.lock().remove(&xid);
                expired += 1;
            }
        }
        expired
    }

    /// Called when a transaction starts completing; its deadline no longer
    /// applies.
    pub(crate) fn completion_started(&self, transaction: &Transaction) {
        self.deadlines.lock().remove(transaction.id());
    }

    /// Called once a top-level transaction has been forgotten.
    pub(crate) fn transaction_completed(&self, transaction: &Transaction) {
        let xid = transaction.id();
        self.deadlines.lock().remove(xid);
        if self.transactions.write().remove(xid).is_some() {
            self.stats.record_completion(
                transaction.status(),
                transaction.heuristic(),
                transaction.is_timed_out(),
                transaction.elapsed(),
            );
        }
    }

    /// In-doubt transactions loaded from the journal and not resolved yet.
    pub fn in_doubt(&self) -> Vec<RecoveredTransaction> {
        self.in_doubt.lock().clone()
    }

    /// Resolves the prepared branches `resource` reports.
    ///
    /// Branches of a transaction whose commit decision is in the journal
    /// are committed. All other branches not belonging to a running
    /// transaction are rolled back (presumed abort).
    pub fn recover_resource(&self, resource: &XaHandle) -> Result<RecoveryReport> {
        let branches = resource
            .recover(xa::TMSTARTRSCAN | xa::TMENDRSCAN)
            .map_err(|err| TxError::System(format!("recovery scan failed: {}", err)))?;
        let in_doubt = self.in_doubt();
        let mut report = RecoveryReport::default();
        for branch in branches {
            let running = self
                .transactions
                .read()
                .values()
                .any(|transaction| transaction.id().same_global(&branch));
            if running {
                continue;
            }
            let commit = in_doubt
                .iter()
                .any(|record| record.committed && record.xid.same_global(&branch));
            let result = if commit {
                resource.commit(&branch, false)
            } else {
                resource.rollback(&branch)
            };
            match result {
                Ok(()) if commit => report.committed.push(branch),
                Ok(()) => report.rolled_back.push(branch),
                Err(err) if !commit && err.code == xa::XAER_NOTA => {
                    report.rolled_back.push(branch)
                }
                Err(err) => {
                    error!("Failed to recover branch {}: {}", branch, err);
                    report.failed.push(branch);
                }
            }
        }
        info!(
            "Recovery in {}: {} committed, {} rolled back, {} failed",
            self.config.name,
            report.committed.len(),
            report.rolled_back.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Forgets every in-doubt transaction in the journal once all resource
    /// managers have been recovered.
    pub fn complete_recovery(&self) -> Result<()> {
        let records = std::mem::take(&mut *self.in_doubt.lock());
        for record in records {
            self.journal.forget(&record.xid)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops the timeout scanner and closes the journal. New transactions
    /// are refused; running ones can still complete.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut scanner) = self.timer.lock().take() {
            scanner.stop();
        }
        let active = self.active_count();
        if active > 0 {
            warn!("Domain {} shut down with {} active transactions", self.config.name, active);
        }
        info!("Domain {} shut down", self.config.name);
        self.journal.close()
    }
}

impl std::fmt::Debug for TransactionDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionDomain")
            .field("name", &self.config.name)
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
