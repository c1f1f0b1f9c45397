use log::{debug, error, info, warn};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::association::ThreadAssociations;
use crate::coordinator::PropagationContext;
use crate::domain::TransactionDomain;
use crate::enlistment::{EndState, ResourceEnlistment};
use crate::errors::{Operation, Result, TxError};
use crate::heuristic::{Heuristic, HeuristicFlags, Phase, ResourceOutcome};
use crate::journal::Journal;
use crate::resource::{
    RemoteResource, Synchronization, XaError, XaHandle, xa,
};
use crate::xid::TransactionId;

/// How long the timeout scanner waits for a busy transaction before
/// retrying on its next pass.
const TIMEOUT_LOCK_WAIT: Duration = Duration::from_millis(10);

/// Lifecycle status of a transaction.
///
/// ```text
/// Active -> MarkedRollback -> Preparing -> Prepared -> Committing -> Committed
/// Active -> MarkedRollback -> RollingBack -> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl Status {
    /// Whether the transaction still accepts work.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Active | Status::MarkedRollback)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Committed | Status::RolledBack)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Active => "active",
            Status::MarkedRollback => "marked-rollback",
            Status::Preparing => "preparing",
            Status::Prepared => "prepared",
            Status::Committing => "committing",
            Status::Committed => "committed",
            Status::RollingBack => "rolling-back",
            Status::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

enum SubordinateKind {
    Remote(Arc<dyn RemoteResource>),
    Child(Arc<Transaction>),
}

/// A participant driven before the XA branches: a remote resource or a
/// subtransaction owned by this transaction.
struct Subordinate {
    kind: SubordinateKind,
    read_only: bool,
}

impl Subordinate {
    fn prepare(&self) -> ResourceOutcome {
        match &self.kind {
            SubordinateKind::Remote(remote) => match remote.prepare() {
                Ok(vote) => vote.into(),
                Err(err) => (&err).into(),
            },
            SubordinateKind::Child(child) => child.prepare_for_superior(),
        }
    }

    fn commit(&self, one_phase: bool) -> ResourceOutcome {
        match &self.kind {
            SubordinateKind::Remote(remote) => {
                let result = if one_phase {
                    remote.commit_one_phase()
                } else {
                    remote.commit()
                };
                match result {
                    Ok(()) => ResourceOutcome::Commit,
                    Err(err) => (&err).into(),
                }
            }
            SubordinateKind::Child(child) => child.commit_for_superior(one_phase),
        }
    }

    fn rollback(&self) -> ResourceOutcome {
        match &self.kind {
            SubordinateKind::Remote(remote) => match remote.rollback() {
                Ok(()) => ResourceOutcome::Rollback,
                Err(err) => (&err).into(),
            },
            SubordinateKind::Child(child) => child.rollback_for_superior(),
        }
    }

    /// A subtransaction that can no longer commit.
    fn is_doomed(&self) -> bool {
        match &self.kind {
            SubordinateKind::Remote(_) => false,
            SubordinateKind::Child(child) => {
                child.is_timed_out()
                    || matches!(
                        child.status(),
                        Status::MarkedRollback | Status::RollingBack | Status::RolledBack
                    )
            }
        }
    }

    fn forget(&self, ignore: Heuristic, forget_resources: bool) {
        match &self.kind {
            SubordinateKind::Remote(remote) if forget_resources => {
                if let Err(err) = remote.forget() {
                    warn!("Remote resource failed to forget: {}", err);
                }
            }
            SubordinateKind::Remote(_) => {}
            SubordinateKind::Child(child) => child.forget(ignore),
        }
    }
}

#[derive(Default)]
struct Participants {
    enlisted: Vec<ResourceEnlistment>,
    delisted: Vec<ResourceEnlistment>,
    subordinates: Vec<Subordinate>,
}

impl Participants {
    fn branches_mut(&mut self) -> impl Iterator<Item = &mut ResourceEnlistment> {
        self.enlisted.iter_mut().chain(self.delisted.iter_mut())
    }

    fn branches(&self) -> impl Iterator<Item = &ResourceEnlistment> {
        self.enlisted.iter().chain(self.delisted.iter())
    }

    fn has_driven(&self) -> bool {
        self.branches().any(ResourceEnlistment::is_driven)
            || self.subordinates.iter().any(|sub| !sub.read_only)
    }
}

struct TxInner {
    status: Status,
    heuristic: Heuristic,
    participants: Participants,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    system_error: Option<TxError>,
    journaled: bool,
    forgotten: bool,
}

/// A unit of work coordinated through two-phase commit.
///
/// Transactions are created by a [`TransactionDomain`]. XA branches, remote
/// resources, subtransactions and synchronizations enlist into it while it
/// is active; [`Transaction::commit`] and [`Transaction::rollback`] then
/// drive every participant to the same outcome, merging the individual
/// results into one [`Heuristic`].
///
/// All protocol operations are serialized by a per-transaction lock. The
/// lock is reentrant so that synchronizations may call back into the
/// transaction while it completes.
pub struct Transaction {
    id: TransactionId,
    parent: Option<Arc<Transaction>>,
    domain: Weak<TransactionDomain>,
    associations: Arc<ThreadAssociations>,
    journal: Arc<dyn Journal>,
    owner: ThreadId,
    timeout: Duration,
    started: Instant,
    imported: Option<PropagationContext>,
    timed_out: AtomicBool,
    completion: ReentrantMutex<()>,
    inner: Mutex<TxInner>,
    self_ref: Weak<Transaction>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        parent: Option<Arc<Transaction>>,
        domain: Weak<TransactionDomain>,
        associations: Arc<ThreadAssociations>,
        journal: Arc<dyn Journal>,
        timeout: Duration,
        imported: Option<PropagationContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            parent,
            domain,
            associations,
            journal,
            owner: thread::current().id(),
            timeout,
            started: Instant::now(),
            imported,
            timed_out: AtomicBool::new(false),
            completion: ReentrantMutex::new(()),
            inner: Mutex::new(TxInner {
                status: Status::Active,
                heuristic: Heuristic::ReadOnly,
                participants: Participants::default(),
                synchronizations: Vec::new(),
                system_error: None,
                journaled: false,
                forgotten: false,
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Returns the branch identifier of this transaction.
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<Transaction>> {
        self.parent.as_ref()
    }

    /// Walks the parent chain up to the outermost local transaction.
    pub fn top_level(self: &Arc<Self>) -> Arc<Transaction> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    /// The outcome reached by the last completed phase.
    pub fn heuristic(&self) -> Heuristic {
        self.inner.lock().heuristic
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the transaction times out, `None` when it never does.
    pub fn remaining(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            return None;
        }
        Some(self.timeout.saturating_sub(self.elapsed()))
    }

    /// Set once the transaction was rolled back by its timeout. Stays set
    /// after the transaction reached `RolledBack`.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Context this transaction was imported from, if it was.
    pub fn imported_context(&self) -> Option<&PropagationContext> {
        self.imported.as_ref()
    }

    pub fn domain(&self) -> Option<Arc<TransactionDomain>> {
        self.domain.upgrade()
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Number of XA enlistments, delisted ones included.
    pub fn branch_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.participants.enlisted.len() + inner.participants.delisted.len()
    }

    pub fn subordinate_count(&self) -> usize {
        self.inner.lock().participants.subordinates.len()
    }

    /// Whether the calling thread created the transaction or is currently
    /// associated with it.
    pub fn is_owned_by_current_thread(&self) -> bool {
        if thread::current().id() == self.owner {
            return true;
        }
        self.associations
            .current()
            .is_some_and(|current| std::ptr::eq(current.as_ref(), self))
    }

    /// Enlists an XA resource into the transaction.
    ///
    /// A handle that is already enlisted is left alone, a suspended one is
    /// resumed and a delisted one rejoins its branch. A new handle onto a
    /// resource manager that already holds a branch of this transaction
    /// joins that branch and becomes a shared enlistment; otherwise a new
    /// branch is started.
    ///
    /// # Returns
    ///
    /// `Ok(true)` when the resource was started on a branch, `Ok(false)`
    /// when it already was.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use maat::prelude::*;
    /// # fn run(domain: Arc<TransactionDomain>, resource: XaHandle) -> Result<()> {
    /// let tx = domain.begin()?;
    /// tx.enlist_resource(resource)?;
    /// domain.commit()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn enlist_resource(&self, resource: XaHandle) -> Result<bool> {
        let _guard = self.completion.lock();
        self.check_enlistable("enlist")?;
        let mut participants = self.take_participants();
        let result = self.enlist_into(&mut participants, resource);
        self.restore_participants(participants);
        result
    }

    fn enlist_into(&self, participants: &mut Participants, resource: XaHandle) -> Result<bool> {
        if let Some(enlistment) = participants
            .enlisted
            .iter_mut()
            .find(|enlistment| enlistment.holds(&resource))
        {
            if enlistment.end_state() != EndState::Suspended {
                return Ok(false);
            }
            enlistment
                .start(xa::TMRESUME)
                .map_err(|err| self.start_failed(err))?;
            debug!("Resumed branch {} of {}", enlistment.xid(), self.id);
            return Ok(true);
        }

        if let Some(position) = participants
            .delisted
            .iter()
            .position(|enlistment| enlistment.holds(&resource))
        {
            let mut enlistment = participants.delisted.remove(position);
            if let Err(err) = enlistment.start(xa::TMJOIN) {
                participants.delisted.insert(position, enlistment);
                return Err(self.start_failed(err));
            }
            debug!("Rejoined branch {} of {}", enlistment.xid(), self.id);
            participants.enlisted.push(enlistment);
            return Ok(true);
        }

        let shared_branch = participants
            .branches()
            .find(|enlistment| {
                !enlistment.is_shared() && enlistment.resource().is_same_rm(resource.as_ref())
            })
            .map(|enlistment| *enlistment.xid());
        if let Some(branch) = shared_branch {
            let mut enlistment = ResourceEnlistment::joined(Arc::clone(&resource), branch);
            match enlistment.start(xa::TMJOIN) {
                Ok(()) => {
                    debug!("Resource joined shared branch {} of {}", branch, self.id);
                    participants.enlisted.push(enlistment);
                    return Ok(true);
                }
                Err(err) => {
                    debug!("Join of branch {} refused ({}), starting a new branch", branch, err);
                }
            }
        }

        let branch = self.id.new_branch();
        if let Some(remaining) = self.remaining() {
            resource.set_transaction_timeout(remaining.as_secs().max(1));
        }
        let mut enlistment = ResourceEnlistment::new(resource, branch);
        enlistment
            .start(xa::TMNOFLAGS)
            .map_err(|err| self.start_failed(err))?;
        debug!("Started branch {} of {}", branch, self.id);
        participants.enlisted.push(enlistment);
        Ok(true)
    }

    fn start_failed(&self, err: XaError) -> TxError {
        if (xa::XA_RBBASE..=xa::XA_RBEND).contains(&err.code) {
            self.mark_rollback_only();
            return TxError::RolledBack(self.id);
        }
        TxError::System(format!("failed to start branch of {}: {}", self.id, err))
    }

    /// Dissociates an XA resource from the transaction.
    ///
    /// `flags` is [`xa::TMSUCCESS`], [`xa::TMSUSPEND`] or [`xa::TMFAIL`].
    /// Delisting with `TMFAIL` marks the transaction rollback-only.
    pub fn delist_resource(&self, resource: &XaHandle, flags: i32) -> Result<bool> {
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return Err(TxError::TimedOut(self.id));
        }
        let status = self.status();
        if !status.is_active() {
            return Err(self.invalid("delist", status));
        }
        if !matches!(flags, xa::TMSUCCESS | xa::TMSUSPEND | xa::TMFAIL) {
            return Err(TxError::System(format!("invalid delist flags {:#x}", flags)));
        }
        let mut participants = self.take_participants();
        let result = self.delist_from(&mut participants, resource, flags);
        self.restore_participants(participants);
        result
    }

    fn delist_from(
        &self,
        participants: &mut Participants,
        resource: &XaHandle,
        flags: i32,
    ) -> Result<bool> {
        let Some(position) = participants
            .enlisted
            .iter()
            .position(|enlistment| enlistment.holds(resource))
        else {
            return Ok(false);
        };
        let enlistment = &mut participants.enlisted[position];
        match (enlistment.end_state(), flags) {
            (EndState::Active, _) | (EndState::Suspended, xa::TMSUCCESS | xa::TMFAIL) => {}
            _ => return Ok(false),
        }
        if let Err(err) = enlistment.end(flags) {
            self.mark_rollback_only();
            return Err(TxError::System(format!(
                "failed to end branch {}: {}",
                enlistment.xid(),
                err
            )));
        }
        match flags {
            xa::TMSUCCESS => {
                let enlistment = participants.enlisted.remove(position);
                participants.delisted.push(enlistment);
            }
            xa::TMFAIL => self.mark_rollback_only(),
            _ => {}
        }
        Ok(true)
    }

    /// Registers a listener notified before and after completion.
    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        let _guard = self.completion.lock();
        self.check_enlistable("register a synchronization with")?;
        self.inner.lock().synchronizations.push(synchronization);
        Ok(())
    }

    /// Registers a resource reached through a remote coordinator. Remote
    /// resources are driven before the XA branches.
    pub fn register_remote_resource(&self, resource: Arc<dyn RemoteResource>) -> Result<()> {
        self.add_subordinate(SubordinateKind::Remote(resource), "register a resource with")
    }

    pub(crate) fn add_child(&self, child: Arc<Transaction>) -> Result<()> {
        self.add_subordinate(SubordinateKind::Child(child), "create a subtransaction of")
    }

    fn add_subordinate(&self, kind: SubordinateKind, operation: &'static str) -> Result<()> {
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return Err(TxError::TimedOut(self.id));
        }
        let mut inner = self.inner.lock();
        if !inner.status.is_active() {
            return Err(self.invalid(operation, inner.status));
        }
        inner.participants.subordinates.push(Subordinate {
            kind,
            read_only: false,
        });
        Ok(())
    }

    /// Marks the transaction so that its only possible outcome is rollback.
    pub fn set_rollback_only(&self) -> Result<()> {
        let _guard = self.completion.lock();
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Active | Status::MarkedRollback => {
                inner.status = Status::MarkedRollback;
                Ok(())
            }
            Status::RollingBack | Status::RolledBack => Ok(()),
            status => Err(self.invalid("mark rollback-only", status)),
        }
    }

    pub(crate) fn mark_rollback_only(&self) {
        let mut inner = self.inner.lock();
        if inner.status == Status::Active {
            debug!("Transaction {} marked rollback-only", self.id);
            inner.status = Status::MarkedRollback;
        }
    }

    /// Whether the transaction can skip the prepare phase.
    ///
    /// True when there are no participants at all, when exactly one XA
    /// resource is enlisted or delisted, or when every XA enlistment sits
    /// on one resource manager and no subordinate is registered.
    pub fn can_use_one_phase_commit(&self) -> bool {
        let (handles, subordinates) = {
            let inner = self.inner.lock();
            let handles: Vec<XaHandle> = inner
                .participants
                .branches()
                .map(|enlistment| Arc::clone(enlistment.resource()))
                .collect();
            (handles, inner.participants.subordinates.len())
        };
        match (handles.as_slice(), subordinates) {
            ([], 0) | ([_], _) => true,
            ([first, rest @ ..], 0) => rest.iter().all(|other| first.is_same_rm(other.as_ref())),
            _ => false,
        }
    }

    /// Runs the prepare phase on behalf of an external coordinator.
    ///
    /// # Returns
    ///
    /// [`Heuristic::Commit`] when every participant is ready to commit, or
    /// [`Heuristic::ReadOnly`] when none has work to commit; a read-only
    /// transaction is completed on the spot. Any other vote rolls the
    /// transaction back and is reported as an error.
    pub fn prepare(&self) -> Result<Heuristic> {
        if self.parent.is_some() {
            return Err(self.invalid("prepare", self.status()));
        }
        self.check_owner(Operation::Prepare)?;
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return Err(TxError::TimedOut(self.id));
        }
        match self.status() {
            Status::Prepared => return Ok(self.heuristic()),
            Status::Committed if self.heuristic() == Heuristic::ReadOnly => {
                return Ok(Heuristic::ReadOnly);
            }
            Status::Active | Status::MarkedRollback => {}
            status => return Err(self.invalid("prepare", status)),
        }
        if let Some(domain) = self.domain() {
            domain.completion_started(self);
        }
        let result = match self.prepare_locked() {
            Heuristic::Commit => return Ok(Heuristic::Commit),
            // Nothing left to commit: the transaction completes here.
            Heuristic::ReadOnly => {
                self.inner.lock().status = Status::Committed;
                Ok(Heuristic::ReadOnly)
            }
            vote => Err(self.settle_rollback(vote)),
        };
        self.forget(Heuristic::Commit);
        self.surface(result)
    }

    /// Commits the transaction.
    ///
    /// Transactions with a single resource manager skip the prepare phase.
    /// Committing a subtransaction is deferred to its parent and returns
    /// immediately. Committing an already committed transaction is a no-op.
    ///
    /// # Errors
    ///
    /// * [`TxError::RolledBack`] when a participant voted to roll back.
    /// * [`TxError::Heuristic`] when participants reached different outcomes.
    /// * [`TxError::TimedOut`] when the transaction was rolled back by its timeout.
    /// * [`TxError::Security`] when the caller is not the owner.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use maat::prelude::*;
    /// # fn run(domain: Arc<TransactionDomain>) -> Result<()> {
    /// let tx = domain.begin()?;
    /// match tx.commit() {
    ///     Ok(()) => println!("committed {}", tx.id()),
    ///     Err(TxError::Heuristic { outcome, .. }) => println!("heuristic {}", outcome),
    ///     Err(err) => return Err(err),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn commit(&self) -> Result<()> {
        self.commit_entry(false)
    }

    /// Commits through the single-phase entry used by superior
    /// coordinators. Falls back to two-phase commit when more than one
    /// resource manager is involved; a prepared transaction is rejected.
    pub fn one_phase_commit(&self) -> Result<()> {
        self.commit_entry(true)
    }

    fn commit_entry(&self, one_phase_entry: bool) -> Result<()> {
        if self.parent.is_some() {
            debug!("Commit of subtransaction {} deferred to its parent", self.id);
            return Ok(());
        }
        self.check_owner(Operation::Commit)?;
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return Err(TxError::TimedOut(self.id));
        }
        let status = self.status();
        match status {
            Status::Committed => return Ok(()),
            Status::RolledBack => return Err(TxError::RolledBack(self.id)),
            Status::Prepared if !one_phase_entry => {}
            Status::Active | Status::MarkedRollback => {}
            status => return Err(self.invalid("commit", status)),
        }
        let one_phase = status != Status::Prepared && self.can_use_one_phase_commit();
        self.commit_locked(one_phase)
    }

    fn commit_locked(&self, one_phase: bool) -> Result<()> {
        if let Some(domain) = self.domain() {
            domain.completion_started(self);
        }
        let prepared = self.status() == Status::Prepared;
        let vote = if prepared {
            self.heuristic()
        } else if one_phase {
            self.end_resources()
        } else {
            self.prepare_locked()
        };
        debug!("Transaction {} voted {}", self.id, vote);

        let result = match vote {
            Heuristic::ReadOnly => {
                self.inner.lock().status = Status::Committed;
                Ok(())
            }
            Heuristic::Commit => match self.internal_commit(one_phase && !prepared) {
                Ok(Heuristic::Commit | Heuristic::ReadOnly) => Ok(()),
                // Without a prepare phase a rollback reply is the real outcome.
                Ok(Heuristic::Rollback) if one_phase && !prepared => {
                    Err(TxError::RolledBack(self.id))
                }
                Ok(outcome) => Err(TxError::Heuristic {
                    xid: self.id,
                    outcome,
                }),
                Err(err) => Err(err),
            },
            vote => Err(self.settle_rollback(vote)),
        };
        self.forget(Heuristic::Commit);
        self.surface(result)
    }

    /// Rolls the transaction back.
    ///
    /// On a subtransaction this only marks it rollback-only; its parent
    /// rolls it back when it completes.
    pub fn rollback(&self) -> Result<()> {
        if self.parent.is_some() {
            debug!("Rollback of subtransaction {} deferred to its parent", self.id);
            return self.set_rollback_only();
        }
        self.check_owner(Operation::Rollback)?;
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return Err(TxError::TimedOut(self.id));
        }
        match self.status() {
            Status::RolledBack => return Ok(()),
            Status::Active | Status::MarkedRollback | Status::Prepared => {}
            status => return Err(self.invalid("rollback", status)),
        }
        if let Some(domain) = self.domain() {
            domain.completion_started(self);
        }
        let outcome = self.internal_rollback();
        self.forget(Heuristic::Rollback);
        let result = match outcome {
            Heuristic::Rollback | Heuristic::ReadOnly => Ok(()),
            outcome => Err(TxError::Heuristic {
                xid: self.id,
                outcome,
            }),
        };
        self.surface(result)
    }

    /// Rolls the transaction back because its deadline passed.
    ///
    /// Returns `false` when the transaction is busy completing; it is then
    /// only marked rollback-only and the caller should retry later.
    pub fn time_out(&self) -> bool {
        let Some(_guard) = self.completion.try_lock_for(TIMEOUT_LOCK_WAIT) else {
            self.mark_rollback_only();
            return false;
        };
        let status = self.status();
        if status.is_terminal() {
            return true;
        }
        if !matches!(status, Status::Active | Status::MarkedRollback | Status::Prepared) {
            return false;
        }
        warn!("Transaction {} timed out after {:?}", self.id, self.elapsed());
        self.timed_out.store(true, Ordering::SeqCst);

        let mut participants = self.take_participants();
        for enlistment in participants.enlisted.iter_mut() {
            if let Err(err) = enlistment.finish(false) {
                debug!("Failed to end branch {} on timeout: {}", enlistment.xid(), err);
            }
        }
        self.restore_participants(participants);

        self.internal_rollback();
        self.forget(Heuristic::Rollback);
        if let Some(err) = self.inner.lock().system_error.take() {
            error!("Timeout rollback of {} failed: {}", self.id, err);
        }
        true
    }

    /// Ends every active branch with `TMSUSPEND`.
    pub(crate) fn suspend_resources(&self) {
        let _guard = self.completion.lock();
        if !self.status().is_active() {
            return;
        }
        let mut participants = self.take_participants();
        let mut failed = false;
        for enlistment in participants.enlisted.iter_mut() {
            if enlistment.end_state() != EndState::Active {
                continue;
            }
            if let Err(err) = enlistment.end(xa::TMSUSPEND) {
                warn!("Failed to suspend branch {}: {}", enlistment.xid(), err);
                failed = true;
            }
        }
        self.restore_participants(participants);
        if failed {
            self.mark_rollback_only();
        }
    }

    /// Phase one. Expects the completion lock to be held and the status to
    /// be active.
    fn prepare_locked(&self) -> Heuristic {
        if self.status() == Status::Active && !self.before_completion() {
            self.mark_rollback_only();
        }
        {
            let mut inner = self.inner.lock();
            let marked = inner.status == Status::MarkedRollback;
            inner.status = Status::Preparing;
            if marked {
                inner.heuristic = Heuristic::Rollback;
                return Heuristic::Rollback;
            }
        }

        let mut participants = self.take_participants();
        let mut flags = HeuristicFlags::READ_ONLY;

        for subordinate in participants.subordinates.iter_mut() {
            if !flags.may_continue() {
                break;
            }
            let outcome = subordinate.prepare();
            if outcome == ResourceOutcome::ReadOnly {
                subordinate.read_only = true;
            }
            self.absorb(&outcome, "prepare");
            flags.accumulate(outcome.flags(Phase::Prepare));
        }

        if flags.may_continue() {
            for enlistment in participants.enlisted.iter_mut() {
                flags.accumulate(self.end_branch(enlistment));
            }
        }

        for enlistment in participants.branches_mut() {
            if !flags.may_continue() {
                break;
            }
            if !enlistment.is_driven() || enlistment.end_state() == EndState::Failed {
                continue;
            }
            let outcome = match enlistment.resource().prepare(enlistment.xid()) {
                Ok(xa::XA_RDONLY) => {
                    enlistment.mark_read_only();
                    ResourceOutcome::ReadOnly
                }
                Ok(code) => ResourceOutcome::from_xa_code(code),
                Err(err) => ResourceOutcome::from_xa_error(&err),
            };
            self.absorb(&outcome, "prepare");
            flags.accumulate(outcome.flags(Phase::Prepare));
        }
        self.restore_participants(participants);

        let mut heuristic = flags.normalize();
        if heuristic == Heuristic::Commit && self.parent.is_none() {
            match self.journal.prepare(&self.id, Heuristic::Commit) {
                Ok(()) => self.inner.lock().journaled = true,
                Err(err) => {
                    self.retain_error(err);
                    heuristic = Heuristic::Rollback;
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.heuristic = heuristic;
        if matches!(heuristic, Heuristic::Commit | Heuristic::ReadOnly) {
            inner.status = Status::Prepared;
        }
        debug!("Transaction {} prepared: {}", self.id, heuristic);
        heuristic
    }

    /// Ends a branch with success before completion and reports the flags
    /// the end contributes.
    fn end_branch(&self, enlistment: &mut ResourceEnlistment) -> HeuristicFlags {
        match enlistment.finish(true) {
            Err(err) => {
                let outcome = ResourceOutcome::from_xa_error(&err);
                self.absorb(&outcome, "end");
                match outcome {
                    ResourceOutcome::ReadOnly | ResourceOutcome::Commit => HeuristicFlags::ROLLBACK,
                    outcome => outcome.flags(Phase::Prepare),
                }
            }
            Ok(()) if enlistment.end_state() == EndState::Failed => HeuristicFlags::ROLLBACK,
            Ok(()) => HeuristicFlags::READ_ONLY,
        }
    }

    /// The one-phase counterpart of [`Transaction::prepare_locked`]: ends
    /// the branches without preparing them.
    fn end_resources(&self) -> Heuristic {
        if self.status() == Status::Active && !self.before_completion() {
            self.mark_rollback_only();
        }
        {
            let mut inner = self.inner.lock();
            let marked = inner.status == Status::MarkedRollback;
            inner.status = Status::Preparing;
            if marked {
                inner.heuristic = Heuristic::Rollback;
                return Heuristic::Rollback;
            }
        }

        let mut participants = self.take_participants();
        let mut flags = HeuristicFlags::READ_ONLY;
        if participants.subordinates.iter().any(Subordinate::is_doomed) {
            debug!("Transaction {} has a subtransaction marked rollback-only", self.id);
            flags.accumulate(HeuristicFlags::ROLLBACK);
        } else {
            for enlistment in participants.enlisted.iter_mut() {
                flags.accumulate(self.end_branch(enlistment));
            }
        }
        let has_driven = participants.has_driven();
        self.restore_participants(participants);

        let heuristic = match (flags.is_read_only(), has_driven) {
            (true, true) => Heuristic::Commit,
            (true, false) => Heuristic::ReadOnly,
            (false, _) => flags.normalize(),
        };
        let mut inner = self.inner.lock();
        inner.heuristic = heuristic;
        if heuristic == Heuristic::Commit {
            inner.status = Status::Committing;
        }
        heuristic
    }

    /// Phase two. Drives every participant that voted commit.
    fn internal_commit(&self, one_phase: bool) -> Result<Heuristic> {
        let journaled = {
            let mut inner = self.inner.lock();
            match (inner.status, one_phase) {
                (Status::Prepared, false) | (Status::Committing, true) => {}
                (Status::Committed, _) => return Ok(inner.heuristic),
                (status, _) => return Err(self.invalid("commit", status)),
            }
            inner.status = Status::Committing;
            inner.journaled
        };
        if journaled {
            if let Err(err) = self.journal.commit(&self.id, Heuristic::Commit) {
                self.retain_error(err);
            }
        }

        let mut participants = self.take_participants();
        let mut flags = HeuristicFlags::READ_ONLY;
        for subordinate in participants.subordinates.iter().filter(|sub| !sub.read_only) {
            let outcome = subordinate.commit(one_phase);
            self.absorb(&outcome, "commit");
            flags.accumulate(outcome.flags(Phase::Commit));
        }
        for enlistment in participants.branches().filter(|e| e.is_driven()) {
            let outcome = match enlistment.resource().commit(enlistment.xid(), one_phase) {
                Ok(()) => ResourceOutcome::Commit,
                Err(err) => ResourceOutcome::from_xa_error(&err),
            };
            self.absorb(&outcome, "commit");
            flags.accumulate(outcome.flags(Phase::Commit));
        }
        self.restore_participants(participants);

        let heuristic = flags.normalize();
        let mut inner = self.inner.lock();
        inner.heuristic = heuristic;
        // Once the commit decision is logged, participants that rolled back
        // are a heuristic outcome of a committed transaction.
        inner.status = if one_phase && heuristic == Heuristic::Rollback {
            Status::RolledBack
        } else {
            Status::Committed
        };
        if heuristic != Heuristic::Commit {
            warn!("Transaction {} completed commit with outcome {}", self.id, heuristic);
        }
        Ok(heuristic)
    }

    /// Rolls back every participant that did not vote read-only.
    fn internal_rollback(&self) -> Heuristic {
        let journaled = {
            let mut inner = self.inner.lock();
            match inner.status {
                Status::Active | Status::MarkedRollback | Status::Preparing | Status::Prepared => {}
                Status::RollingBack | Status::RolledBack => return inner.heuristic,
                status => {
                    warn!("Ignoring rollback of {} in status {}", self.id, status);
                    return inner.heuristic;
                }
            }
            inner.status = Status::RollingBack;
            inner.journaled
        };

        let mut participants = self.take_participants();
        for enlistment in participants.enlisted.iter_mut() {
            if let Err(err) = enlistment.finish(false) {
                debug!("Failed to end branch {} before rollback: {}", enlistment.xid(), err);
            }
        }

        let mut flags = HeuristicFlags::READ_ONLY;
        for subordinate in participants.subordinates.iter().filter(|sub| !sub.read_only) {
            let outcome = subordinate.rollback();
            self.absorb(&outcome, "rollback");
            flags.accumulate(outcome.flags(Phase::Rollback));
        }
        for enlistment in participants.branches().filter(|e| e.is_driven()) {
            let outcome = match enlistment.resource().rollback(enlistment.xid()) {
                Ok(()) => ResourceOutcome::Rollback,
                // The resource manager already discarded the branch.
                Err(err) if err.code == xa::XAER_NOTA => ResourceOutcome::Rollback,
                Err(err) => ResourceOutcome::from_xa_error(&err),
            };
            self.absorb(&outcome, "rollback");
            flags.accumulate(outcome.flags(Phase::Rollback));
        }
        self.restore_participants(participants);

        if journaled {
            if let Err(err) = self.journal.rollback(&self.id) {
                self.retain_error(err);
            }
        }

        let heuristic = match flags.normalize() {
            Heuristic::ReadOnly => Heuristic::Rollback,
            heuristic => heuristic,
        };
        let mut inner = self.inner.lock();
        inner.heuristic = heuristic;
        inner.status = Status::RolledBack;
        debug!("Transaction {} rolled back: {}", self.id, heuristic);
        heuristic
    }

    /// Rolls back after a vote other than commit and folds the rollback
    /// result into the vote.
    fn settle_rollback(&self, vote: Heuristic) -> TxError {
        let rolled_back = self.internal_rollback();
        let outcome = (vote.flags() | rolled_back.flags()).normalize();
        self.inner.lock().heuristic = outcome;
        if outcome == Heuristic::Rollback {
            TxError::RolledBack(self.id)
        } else {
            warn!("Transaction {} rolled back with outcome {}", self.id, outcome);
            TxError::Heuristic {
                xid: self.id,
                outcome,
            }
        }
    }

    /// Releases all participants and notifies synchronizations.
    ///
    /// Resources are told to forget their branch only when the final
    /// outcome differs from `ignore`, the outcome the completion path
    /// expected, and is not read-only. Runs once.
    pub(crate) fn forget(&self, ignore: Heuristic) {
        let (status, heuristic, participants, synchronizations, journaled) = {
            let mut inner = self.inner.lock();
            if inner.forgotten {
                return;
            }
            inner.forgotten = true;
            (
                inner.status,
                inner.heuristic,
                std::mem::take(&mut inner.participants),
                std::mem::take(&mut inner.synchronizations),
                inner.journaled,
            )
        };

        let forget_resources = heuristic != ignore && heuristic != Heuristic::ReadOnly;
        if forget_resources {
            for enlistment in participants.branches() {
                if let Err(err) = enlistment.resource().forget(enlistment.xid()) {
                    warn!("Branch {} failed to forget: {}", enlistment.xid(), err);
                }
            }
        }
        for subordinate in participants.subordinates.iter() {
            subordinate.forget(ignore, forget_resources);
        }
        if journaled {
            if let Err(err) = self.journal.forget(&self.id) {
                warn!("Failed to forget {} in the journal: {}", self.id, err);
            }
        }

        let delist_flags = if status == Status::Committed {
            xa::TMSUCCESS
        } else {
            xa::TMFAIL
        };
        for callback in self.associations.callbacks_for(self) {
            callback.delisted(&self.id, delist_flags);
        }
        for synchronization in synchronizations.iter().rev() {
            synchronization.after_completion(status);
        }

        info!("Transaction {} completed: {} ({})", self.id, status, heuristic);
        if self.parent.is_none() {
            if let Some(domain) = self.domain() {
                domain.transaction_completed(self);
            }
        }
    }

    /// Prepare driven by the parent transaction or a superior coordinator.
    pub(crate) fn prepare_for_superior(&self) -> ResourceOutcome {
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return ResourceOutcome::Rollback;
        }
        match self.status() {
            Status::Active | Status::MarkedRollback => {}
            Status::Prepared => return vote_of(self.heuristic()),
            Status::Committed => return ResourceOutcome::ReadOnly,
            Status::RolledBack => return ResourceOutcome::Rollback,
            status => {
                return ResourceOutcome::SystemError(format!(
                    "{} cannot prepare in status {}",
                    self.id, status
                ));
            }
        }
        let outcome = match self.prepare_locked() {
            Heuristic::ReadOnly => {
                self.inner.lock().status = Status::Committed;
                ResourceOutcome::ReadOnly
            }
            Heuristic::Commit => ResourceOutcome::Commit,
            vote => {
                let outcome = match self.settle_rollback(vote) {
                    TxError::Heuristic { outcome, .. } => ResourceOutcome::Heuristic(outcome),
                    _ => ResourceOutcome::Rollback,
                };
                self.forget(Heuristic::Rollback);
                outcome
            }
        };
        self.superior_outcome(outcome)
    }

    /// Commit driven by the parent transaction or a superior coordinator.
    pub(crate) fn commit_for_superior(&self, one_phase: bool) -> ResourceOutcome {
        let _guard = self.completion.lock();
        if self.is_timed_out() {
            return ResourceOutcome::Rollback;
        }
        let outcome = match self.status() {
            Status::Prepared => match self.internal_commit(false) {
                Ok(heuristic) => match vote_of(heuristic) {
                    ResourceOutcome::ReadOnly => ResourceOutcome::Commit,
                    outcome => outcome,
                },
                Err(err) => ResourceOutcome::SystemError(err.to_string()),
            },
            Status::Active | Status::MarkedRollback if one_phase => {
                match self.commit_locked(self.can_use_one_phase_commit()) {
                    Ok(()) => ResourceOutcome::Commit,
                    Err(TxError::RolledBack(_)) => ResourceOutcome::Rollback,
                    Err(TxError::Heuristic { outcome, .. }) => ResourceOutcome::Heuristic(outcome),
                    Err(err) => ResourceOutcome::SystemError(err.to_string()),
                }
            }
            Status::Committed => ResourceOutcome::Commit,
            Status::RolledBack => ResourceOutcome::Rollback,
            status => ResourceOutcome::SystemError(format!(
                "{} cannot commit in status {}",
                self.id, status
            )),
        };
        self.superior_outcome(outcome)
    }

    /// Rollback driven by the parent transaction or a superior coordinator.
    pub(crate) fn rollback_for_superior(&self) -> ResourceOutcome {
        let _guard = self.completion.lock();
        let outcome = match self.status() {
            Status::Committed => ResourceOutcome::Heuristic(Heuristic::Commit),
            Status::RolledBack => ResourceOutcome::Rollback,
            _ => match self.internal_rollback() {
                Heuristic::Rollback | Heuristic::ReadOnly => ResourceOutcome::Rollback,
                outcome => ResourceOutcome::Heuristic(outcome),
            },
        };
        self.superior_outcome(outcome)
    }

    /// Reports a retained system error to the superior instead of `outcome`.
    fn superior_outcome(&self, outcome: ResourceOutcome) -> ResourceOutcome {
        match self.inner.lock().system_error.take() {
            Some(err) => ResourceOutcome::SystemError(err.to_string()),
            None => outcome,
        }
    }

    /// Fires `before_completion` in reverse registration order with this
    /// transaction current on the calling thread.
    fn before_completion(&self) -> bool {
        let synchronizations = self.inner.lock().synchronizations.clone();
        if synchronizations.is_empty() {
            return true;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return false;
        };
        let _association = self.associations.make_current(&this);
        for synchronization in synchronizations.iter().rev() {
            if let Err(err) = synchronization.before_completion() {
                debug!("Synchronization of {} vetoed completion: {}", self.id, err);
                return false;
            }
        }
        true
    }

    fn check_owner(&self, operation: Operation) -> Result<()> {
        let allowed = match self.domain() {
            Some(domain) => domain.is_owner(self, operation),
            None => self.is_owned_by_current_thread(),
        };
        if allowed {
            Ok(())
        } else {
            warn!("Refused {} of {} to {:?}", operation, self.id, thread::current().id());
            Err(TxError::Security {
                xid: self.id,
                operation,
            })
        }
    }

    fn check_enlistable(&self, operation: &'static str) -> Result<()> {
        if self.is_timed_out() {
            return Err(TxError::TimedOut(self.id));
        }
        match self.status() {
            Status::Active => Ok(()),
            Status::MarkedRollback => Err(TxError::RolledBack(self.id)),
            status => Err(self.invalid(operation, status)),
        }
    }

    fn invalid(&self, operation: &'static str, status: Status) -> TxError {
        TxError::InvalidState {
            xid: self.id,
            operation,
            status,
        }
    }

    fn take_participants(&self) -> Participants {
        std::mem::take(&mut self.inner.lock().participants)
    }

    /// Puts participants back, keeping anything enlisted while they were out.
    fn restore_participants(&self, participants: Participants) {
        let mut inner = self.inner.lock();
        let added = std::mem::replace(&mut inner.participants, participants);
        inner.participants.enlisted.extend(added.enlisted);
        inner.participants.delisted.extend(added.delisted);
        inner.participants.subordinates.extend(added.subordinates);
    }

    fn absorb(&self, outcome: &ResourceOutcome, phase: &str) {
        if let ResourceOutcome::SystemError(reason) = outcome {
            self.retain_error(TxError::System(format!(
                "{} of {} failed: {}",
                phase, self.id, reason
            )));
        }
    }

    /// Keeps the first system error of a completion; later ones are logged.
    fn retain_error(&self, err: TxError) {
        let mut inner = self.inner.lock();
        if inner.system_error.is_none() {
            error!("Transaction {}: {}", self.id, err);
            inner.system_error = Some(err);
        } else {
            warn!("Transaction {}: additional error {}", self.id, err);
        }
    }

    fn surface<T>(&self, result: Result<T>) -> Result<T> {
        match self.inner.lock().system_error.take() {
            Some(err) => {
                if let Err(other) = &result {
                    debug!("Transaction {} also failed with {}", self.id, other);
                }
                Err(err)
            }
            None => result,
        }
    }
}

fn vote_of(heuristic: Heuristic) -> ResourceOutcome {
    match heuristic {
        Heuristic::ReadOnly => ResourceOutcome::ReadOnly,
        Heuristic::Commit => ResourceOutcome::Commit,
        Heuristic::Rollback => ResourceOutcome::Rollback,
        heuristic => ResourceOutcome::Heuristic(heuristic),
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|parent| parent.id))
            .field("status", &inner.status)
            .field("heuristic", &inner.heuristic)
            .field("timed_out", &self.is_timed_out())
            .finish()
    }
}
