use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use maat::resource::xa;
use maat::{
    CoordinatorAdapter, CoordinatorStatus, PropagationContext, Status, TransactionId, TxError,
};

mod common;

use common::{MockXaResource, setup_domain};

#[test]
fn test_nested_transaction_committed_by_parent() {
    let domain = setup_domain("nested");
    let outer_db = MockXaResource::new("outer", 1);
    let inner_db = MockXaResource::new("inner", 2);

    let parent = domain.begin().unwrap();
    parent.enlist_resource(outer_db.handle()).unwrap();
    let child = domain.begin_nested().unwrap();
    assert!(Arc::ptr_eq(&domain.current().unwrap(), &child));
    assert!(child.id().same_global(parent.id()));
    assert!(Arc::ptr_eq(&child.top_level(), &parent));
    child.enlist_resource(inner_db.handle()).unwrap();

    // Committing the child only hands the thread back to the parent.
    domain.commit().unwrap();
    assert_eq!(child.status(), Status::Active);
    assert!(Arc::ptr_eq(&domain.current().unwrap(), &parent));
    assert_eq!(parent.subordinate_count(), 1);

    // A single XA branch next to the child commits in one phase.
    assert!(parent.can_use_one_phase_commit());
    domain.commit().unwrap();
    assert_eq!(parent.status(), Status::Committed);
    assert_eq!(child.status(), Status::Committed);
    assert_eq!(inner_db.calls(), vec!["start", "end", "commit:one_phase"]);
    assert_eq!(outer_db.calls(), vec!["start", "end", "commit:one_phase"]);
    // Subtransactions are not tracked by the domain.
    assert_eq!(domain.stats().begun, 1);
}

#[test]
fn test_child_rollback_dooms_parent() {
    let domain = setup_domain("nested-rollback");
    let outer_db = MockXaResource::new("outer", 1);
    let inner_db = MockXaResource::new("inner", 2);

    let parent = domain.begin().unwrap();
    parent.enlist_resource(outer_db.handle()).unwrap();
    let child = domain.begin_nested().unwrap();
    child.enlist_resource(inner_db.handle()).unwrap();

    domain.rollback().unwrap();
    assert_eq!(child.status(), Status::MarkedRollback);
    assert!(Arc::ptr_eq(&domain.current().unwrap(), &parent));

    assert!(matches!(domain.commit(), Err(TxError::RolledBack(_))));
    assert_eq!(parent.status(), Status::RolledBack);
    assert_eq!(child.status(), Status::RolledBack);
    assert_eq!(inner_db.count("rollback"), 1);
    assert_eq!(inner_db.count("prepare"), 0);
    assert_eq!(outer_db.count("prepare"), 0);
    assert_eq!(outer_db.count("rollback"), 1);
}

#[test]
fn test_nested_transaction_prepared_with_two_resource_managers() {
    let domain = setup_domain("nested-two-phase");
    let outer_db = MockXaResource::new("outer", 1);
    let outer_queue = MockXaResource::new("queue", 3);
    let inner_db = MockXaResource::new("inner", 2);

    let parent = domain.begin().unwrap();
    parent.enlist_resource(outer_db.handle()).unwrap();
    parent.enlist_resource(outer_queue.handle()).unwrap();
    let child = domain.begin_nested().unwrap();
    child.enlist_resource(inner_db.handle()).unwrap();
    domain.commit().unwrap();

    domain.commit().unwrap();
    assert_eq!(child.status(), Status::Committed);
    assert_eq!(inner_db.calls(), vec!["start", "end", "prepare", "commit"]);
    assert_eq!(outer_db.calls(), vec!["start", "end", "prepare", "commit"]);
}

#[test]
fn test_parent_rollback_reaches_children() {
    let domain = setup_domain("parent-rollback");
    let inner_db = MockXaResource::new("inner", 2);

    let parent = domain.begin().unwrap();
    let adapter = CoordinatorAdapter::new(Arc::clone(&parent));
    let child = adapter.create_subtransaction().unwrap();
    child.transaction().enlist_resource(inner_db.handle()).unwrap();

    domain.rollback().unwrap();
    assert_eq!(child.status(), CoordinatorStatus::RolledBack);
    assert_eq!(inner_db.calls(), vec!["start", "end:fail", "rollback"]);
}

#[test]
fn test_subtransaction_prepare_is_refused() {
    let domain = setup_domain("child-prepare");
    let _parent = domain.begin().unwrap();
    let child = domain.begin_nested().unwrap();
    assert!(matches!(child.prepare(), Err(TxError::InvalidState { .. })));
    domain.rollback().unwrap();
    domain.rollback().unwrap();
}

#[test]
fn test_ancestry_queries() {
    let domain = setup_domain("ancestry");
    let parent = domain.begin().unwrap();
    let adapter = CoordinatorAdapter::new(Arc::clone(&parent));
    let child_adapter = adapter.create_subtransaction().unwrap();
    let child = Arc::clone(child_adapter.transaction());

    assert!(adapter.is_top_level());
    assert!(!child_adapter.is_top_level());
    assert!(child_adapter.is_ancestor(&parent));
    assert!(child_adapter.is_ancestor(&child));
    assert!(!adapter.is_ancestor(&child));
    assert!(adapter.is_descendant(&child));
    assert!(!child_adapter.is_descendant(&parent));
    assert!(adapter.is_related(&child));
    assert!(adapter.is_same_transaction(&parent));
    assert!(!adapter.is_same_transaction(&child));

    assert_eq!(child_adapter.status(), CoordinatorStatus::Active);
    assert_eq!(child_adapter.parent_status(), CoordinatorStatus::Active);
    assert_eq!(child_adapter.top_level_status(), CoordinatorStatus::Active);
    assert_eq!(adapter.transaction_name(), parent.id().to_string());
    assert_eq!(
        child_adapter.hash_top_level_transaction(),
        adapter.hash_transaction()
    );
    assert_ne!(child_adapter.hash_transaction(), adapter.hash_transaction());

    let other_domain = setup_domain("ancestry-other");
    let stranger = other_domain.begin().unwrap();
    assert!(!adapter.is_related(&stranger));
    assert!(!adapter.is_descendant(&stranger));

    child_adapter.rollback_only().unwrap();
    assert_eq!(child_adapter.status(), CoordinatorStatus::MarkedRollback);
    assert_eq!(child_adapter.parent_status(), CoordinatorStatus::Active);
    domain.rollback().unwrap();
    other_domain.rollback().unwrap();
}

#[test]
fn test_create_subtransaction_requires_active_parent() {
    let domain = setup_domain("inactive-parent");
    let parent = domain.begin().unwrap();
    let adapter = CoordinatorAdapter::new(Arc::clone(&parent));
    domain.commit().unwrap();

    assert!(matches!(
        adapter.create_subtransaction(),
        Err(TxError::InvalidState { status: Status::Committed, .. })
    ));
}

#[test]
fn test_propagation_context() {
    let domain = setup_domain("propagation");
    let parent = domain.begin().unwrap();
    let adapter = CoordinatorAdapter::new(Arc::clone(&parent));
    let child_adapter = adapter.create_subtransaction().unwrap();

    let context = child_adapter.propagation_context();
    assert_eq!(context.chain(), &[*parent.id(), *child_adapter.transaction().id()]);
    assert_eq!(context.top_level(), parent.id());
    assert_eq!(context.current(), child_adapter.transaction().id());
    assert_eq!(context.parents(), &[*parent.id()]);
    assert!(context.timeout() > Duration::ZERO);
    // Computed once.
    assert!(std::ptr::eq(context, child_adapter.propagation_context()));

    let bytes = context.to_bytes().unwrap();
    let decoded = PropagationContext::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, *context);
    assert_eq!(decoded.current().global_id(), parent.id().global_id());
    domain.rollback().unwrap();
}

#[test]
fn test_propagation_context_rejects_bad_input() {
    assert!(matches!(
        PropagationContext::new(Duration::from_secs(1), Vec::new()),
        Err(TxError::Propagation(_))
    ));
    assert!(matches!(
        PropagationContext::from_bytes(&[0xff, 0x01]),
        Err(TxError::Propagation(_))
    ));
}

#[test]
fn test_import_recreates_transaction() {
    let origin_domain = setup_domain("origin");
    let remote_domain = setup_domain("importer");

    let origin = origin_domain.begin().unwrap();
    let adapter = CoordinatorAdapter::new(Arc::clone(&origin));
    let bytes = adapter.propagation_context().to_bytes().unwrap();

    let imported = remote_domain.import_bytes(&bytes).unwrap();
    assert!(imported.id().same_global(origin.id()));
    assert_ne!(imported.id(), origin.id());
    assert_eq!(imported.imported_context().unwrap().current(), origin.id());
    assert!(imported.timeout() <= origin.timeout());
    assert_eq!(remote_domain.active_count(), 1);

    // Importing the same context again yields the same transaction.
    let again = remote_domain.import_bytes(&bytes).unwrap();
    assert!(Arc::ptr_eq(&imported, &again));
    assert_eq!(remote_domain.active_count(), 1);

    let imported_adapter = CoordinatorAdapter::new(Arc::clone(&imported));
    assert!(!imported_adapter.is_top_level());
    assert!(imported_adapter.is_ancestor(&origin));
    assert!(imported_adapter.is_related(&origin));
    assert_eq!(imported_adapter.propagation_context().top_level(), origin.id());
    assert_eq!(
        imported_adapter.hash_top_level_transaction(),
        adapter.hash_transaction()
    );
    origin_domain.rollback().unwrap();
}

#[test]
fn test_superior_drives_imported_transaction() {
    let origin_domain = setup_domain("superior");
    let remote_domain = setup_domain("subordinate");
    let local_db = MockXaResource::new("local", 1);
    let local_queue = MockXaResource::new("queue", 3);
    let remote_db = MockXaResource::new("remote", 2);

    let origin = origin_domain.begin().unwrap();
    origin.enlist_resource(local_db.handle()).unwrap();
    origin.enlist_resource(local_queue.handle()).unwrap();
    let context = CoordinatorAdapter::new(Arc::clone(&origin))
        .propagation_context()
        .clone();

    let imported = remote_domain.import(&context).unwrap();
    imported.enlist_resource(remote_db.handle()).unwrap();
    origin
        .register_remote_resource(CoordinatorAdapter::new(Arc::clone(&imported)).subordinate_resource())
        .unwrap();

    origin_domain.commit().unwrap();
    assert_eq!(origin.status(), Status::Committed);
    assert_eq!(imported.status(), Status::Committed);
    assert_eq!(remote_db.calls(), vec!["start", "end", "prepare", "commit"]);
    assert_eq!(local_db.calls(), vec!["start", "end", "prepare", "commit"]);
    assert!(remote_domain.lookup(imported.id()).is_none());
    assert_eq!(remote_domain.stats().committed, 1);
}

#[test]
fn test_superior_rollback_reaches_imported_transaction() {
    let origin_domain = setup_domain("superior-rollback");
    let remote_domain = setup_domain("subordinate-rollback");
    let local_db = MockXaResource::new("local", 1);
    let local_queue = MockXaResource::new("queue", 3);
    let remote_db = MockXaResource::new("remote", 2);
    local_db.fail_prepare(xa::XA_RBROLLBACK);

    let origin = origin_domain.begin().unwrap();
    origin.enlist_resource(local_db.handle()).unwrap();
    origin.enlist_resource(local_queue.handle()).unwrap();
    let imported = remote_domain
        .import(CoordinatorAdapter::new(Arc::clone(&origin)).propagation_context())
        .unwrap();
    imported.enlist_resource(remote_db.handle()).unwrap();
    origin
        .register_remote_resource(CoordinatorAdapter::new(Arc::clone(&imported)).subordinate_resource())
        .unwrap();

    assert!(matches!(origin_domain.commit(), Err(TxError::RolledBack(_))));
    assert_eq!(imported.status(), Status::RolledBack);
    assert_eq!(remote_db.calls(), vec!["start", "end", "prepare", "rollback"]);
    assert_eq!(remote_domain.active_count(), 0);
}

#[test]
fn test_single_resource_and_subordinate_commit_in_one_phase() {
    let origin_domain = setup_domain("superior-one-phase");
    let remote_domain = setup_domain("subordinate-one-phase");
    let local_db = MockXaResource::new("local", 1);
    let remote_db = MockXaResource::new("remote", 2);

    let origin = origin_domain.begin().unwrap();
    let imported = remote_domain
        .import(CoordinatorAdapter::new(Arc::clone(&origin)).propagation_context())
        .unwrap();
    imported.enlist_resource(remote_db.handle()).unwrap();
    origin
        .register_remote_resource(CoordinatorAdapter::new(Arc::clone(&imported)).subordinate_resource())
        .unwrap();
    // A subordinate alone still goes through prepare.
    assert!(!origin.can_use_one_phase_commit());
    origin.enlist_resource(local_db.handle()).unwrap();
    assert!(origin.can_use_one_phase_commit());

    origin_domain.commit().unwrap();
    assert_eq!(imported.status(), Status::Committed);
    assert_eq!(remote_db.calls(), vec!["start", "end", "commit:one_phase"]);
    assert_eq!(local_db.calls(), vec!["start", "end", "commit:one_phase"]);
    assert_eq!(remote_domain.active_count(), 0);
}

#[test]
fn test_deserialized_context_requires_a_chain() {
    #[derive(Serialize)]
    struct UncheckedContext {
        timeout: Duration,
        chain: Vec<TransactionId>,
    }

    let empty = UncheckedContext {
        timeout: Duration::from_secs(30),
        chain: Vec::new(),
    };
    let bytes = bincode::serialize(&empty).unwrap();
    assert!(bincode::deserialize::<PropagationContext>(&bytes).is_err());
    assert!(matches!(
        PropagationContext::from_bytes(&bytes),
        Err(TxError::Propagation(_))
    ));

    let xid = TransactionId::new();
    let valid = UncheckedContext {
        timeout: Duration::from_secs(30),
        chain: vec![xid],
    };
    let context = PropagationContext::from_bytes(&bincode::serialize(&valid).unwrap()).unwrap();
    assert_eq!(context.current(), &xid);
    assert!(context.parents().is_empty());
}
