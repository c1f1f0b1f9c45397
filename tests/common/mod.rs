//! Common utilities for maat integration tests.
#![allow(dead_code)]

use maat::resource::xa;
use maat::{
    DomainConfig, EnlistedResource, Journal, MemoryJournal, RemoteError, RemoteResource, Status,
    Synchronization, SynchronizationError, ThreadAssociations, TransactionDomain, TransactionId,
    Vote, XaError, XaHandle, XaResource,
};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Log shared between mocks to check the order of calls across them.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

// --- MockXaResource ---

/// An XA resource recording every call it receives.
///
/// Resources created with the same `rm` id report themselves as the same
/// resource manager.
pub struct MockXaResource {
    name: String,
    rm: u64,
    calls: Mutex<Vec<(String, TransactionId)>>,
    shared_log: Option<CallLog>,
    prepare_result: Mutex<Result<i32, XaError>>,
    commit_error: Mutex<Option<XaError>>,
    rollback_error: Mutex<Option<XaError>>,
    start_error: Mutex<Option<XaError>>,
    refuse_join: Mutex<bool>,
    recovered: Mutex<Vec<TransactionId>>,
    timeout: AtomicU64,
}

impl MockXaResource {
    pub fn new(name: &str, rm: u64) -> Arc<Self> {
        Arc::new(Self::build(name, rm, None))
    }

    pub fn with_log(name: &str, rm: u64, log: &CallLog) -> Arc<Self> {
        Arc::new(Self::build(name, rm, Some(Arc::clone(log))))
    }

    fn build(name: &str, rm: u64, shared_log: Option<CallLog>) -> Self {
        Self {
            name: name.to_string(),
            rm,
            calls: Mutex::new(Vec::new()),
            shared_log,
            prepare_result: Mutex::new(Ok(xa::XA_OK)),
            commit_error: Mutex::new(None),
            rollback_error: Mutex::new(None),
            start_error: Mutex::new(None),
            refuse_join: Mutex::new(false),
            recovered: Mutex::new(Vec::new()),
            timeout: AtomicU64::new(0),
        }
    }

    pub fn handle(self: &Arc<Self>) -> XaHandle {
        Arc::clone(self) as XaHandle
    }

    pub fn vote(&self, code: i32) {
        *self.prepare_result.lock().unwrap() = Ok(code);
    }

    pub fn fail_prepare(&self, code: i32) {
        *self.prepare_result.lock().unwrap() = Err(XaError::code(code));
    }

    pub fn fail_commit(&self, code: i32) {
        *self.commit_error.lock().unwrap() = Some(XaError::code(code));
    }

    pub fn fail_rollback(&self, code: i32) {
        *self.rollback_error.lock().unwrap() = Some(XaError::code(code));
    }

    pub fn fail_start(&self, code: i32) {
        *self.start_error.lock().unwrap() = Some(XaError::code(code));
    }

    pub fn refuse_join(&self) {
        *self.refuse_join.lock().unwrap() = true;
    }

    pub fn set_recovered(&self, branches: Vec<TransactionId>) {
        *self.recovered.lock().unwrap() = branches;
    }

    /// Names of the calls received, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    /// Branch ids the calls were made with.
    pub fn branches(&self) -> Vec<TransactionId> {
        let mut branches: Vec<TransactionId> = Vec::new();
        for (_, xid) in self.calls.lock().unwrap().iter() {
            if !branches.contains(xid) {
                branches.push(*xid);
            }
        }
        branches
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn timeout(&self) -> u64 {
        self.timeout.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str, xid: &TransactionId) {
        self.calls.lock().unwrap().push((call.to_string(), *xid));
        if let Some(log) = &self.shared_log {
            log.lock().unwrap().push(format!("{}:{}", self.name, call));
        }
    }
}

impl XaResource for MockXaResource {
    fn start(&self, xid: &TransactionId, flags: i32) -> Result<(), XaError> {
        if flags == xa::TMJOIN && *self.refuse_join.lock().unwrap() {
            return Err(XaError::code(xa::XAER_INVAL));
        }
        if let Some(err) = self.start_error.lock().unwrap().clone() {
            return Err(err);
        }
        let call = match flags {
            xa::TMJOIN => "start:join",
            xa::TMRESUME => "start:resume",
            _ => "start",
        };
        self.record(call, xid);
        Ok(())
    }

    fn end(&self, xid: &TransactionId, flags: i32) -> Result<(), XaError> {
        let call = match flags {
            xa::TMFAIL => "end:fail",
            xa::TMSUSPEND => "end:suspend",
            _ => "end",
        };
        self.record(call, xid);
        Ok(())
    }

    fn prepare(&self, xid: &TransactionId) -> Result<i32, XaError> {
        self.record("prepare", xid);
        self.prepare_result.lock().unwrap().clone()
    }

    fn commit(&self, xid: &TransactionId, one_phase: bool) -> Result<(), XaError> {
        self.record(if one_phase { "commit:one_phase" } else { "commit" }, xid);
        match self.commit_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn rollback(&self, xid: &TransactionId) -> Result<(), XaError> {
        self.record("rollback", xid);
        match self.rollback_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn forget(&self, xid: &TransactionId) -> Result<(), XaError> {
        self.record("forget", xid);
        Ok(())
    }

    fn recover(&self, _flags: i32) -> Result<Vec<TransactionId>, XaError> {
        Ok(self.recovered.lock().unwrap().clone())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        other
            .as_any()
            .downcast_ref::<MockXaResource>()
            .is_some_and(|other| other.rm == self.rm)
    }

    fn set_transaction_timeout(&self, seconds: u64) -> bool {
        self.timeout.store(seconds, Ordering::SeqCst);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// --- MockRemote ---

/// A remote resource with a scripted vote.
pub struct MockRemote {
    name: String,
    vote: Mutex<Result<Vote, RemoteError>>,
    commit_error: Mutex<Option<RemoteError>>,
    calls: Mutex<Vec<String>>,
    shared_log: Option<CallLog>,
}

impl MockRemote {
    pub fn new(name: &str, vote: Vote) -> Arc<Self> {
        Arc::new(Self::build(name, vote, None))
    }

    pub fn with_log(name: &str, vote: Vote, log: &CallLog) -> Arc<Self> {
        Arc::new(Self::build(name, vote, Some(Arc::clone(log))))
    }

    fn build(name: &str, vote: Vote, shared_log: Option<CallLog>) -> Self {
        Self {
            name: name.to_string(),
            vote: Mutex::new(Ok(vote)),
            commit_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            shared_log,
        }
    }

    pub fn fail_prepare(&self, error: RemoteError) {
        *self.vote.lock().unwrap() = Err(error);
    }

    pub fn fail_commit(&self, error: RemoteError) {
        *self.commit_error.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
        if let Some(log) = &self.shared_log {
            log.lock().unwrap().push(format!("{}:{}", self.name, call));
        }
    }

    fn committed(&self) -> Result<(), RemoteError> {
        match self.commit_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl RemoteResource for MockRemote {
    fn prepare(&self) -> Result<Vote, RemoteError> {
        self.record("prepare");
        self.vote.lock().unwrap().clone()
    }

    fn commit(&self) -> Result<(), RemoteError> {
        self.record("commit");
        self.committed()
    }

    fn commit_one_phase(&self) -> Result<(), RemoteError> {
        self.record("commit:one_phase");
        self.committed()
    }

    fn rollback(&self) -> Result<(), RemoteError> {
        self.record("rollback");
        Ok(())
    }

    fn forget(&self) -> Result<(), RemoteError> {
        self.record("forget");
        Ok(())
    }
}

// --- RecordingSync ---

/// A synchronization writing `<name>:before` and `<name>:after:<status>`
/// into a shared log.
pub struct RecordingSync {
    name: String,
    log: CallLog,
    veto: bool,
}

impl RecordingSync {
    pub fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: Arc::clone(log),
            veto: false,
        })
    }

    pub fn vetoing(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: Arc::clone(log),
            veto: true,
        })
    }
}

impl Synchronization for RecordingSync {
    fn before_completion(&self) -> Result<(), SynchronizationError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:before", self.name));
        if self.veto {
            return Err(SynchronizationError::RollbackRequested);
        }
        Ok(())
    }

    fn after_completion(&self, status: Status) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:after:{}", self.name, status));
    }
}

// --- RecordingCallback ---

/// Delist callback recording the flags it was called with.
#[derive(Default)]
pub struct RecordingCallback {
    pub flags: Mutex<Vec<i32>>,
}

impl EnlistedResource for RecordingCallback {
    fn delisted(&self, _xid: &TransactionId, flags: i32) {
        self.flags.lock().unwrap().push(flags);
    }
}

// --- Helper Functions ---

/// A domain with a fast timer and an in-memory journal.
pub fn setup_domain(name: &str) -> Arc<TransactionDomain> {
    setup_domain_with_journal(name, Arc::new(MemoryJournal::new()))
}

pub fn setup_domain_with_journal(name: &str, journal: Arc<dyn Journal>) -> Arc<TransactionDomain> {
    let config = DomainConfig::new(name).with_timer_interval(Duration::from_millis(10));
    TransactionDomain::new(config, journal, Arc::new(ThreadAssociations::new())).unwrap()
}

/// A domain whose transactions time out after `timeout`.
pub fn setup_domain_with_timeout(name: &str, timeout: Duration) -> Arc<TransactionDomain> {
    let config = DomainConfig::new(name)
        .with_default_timeout(timeout)
        .with_timer_interval(Duration::from_millis(10));
    TransactionDomain::standalone(config).unwrap()
}
