//! Error handling and edge case tests.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tether::{
    ChildReference, ChildSpec, HostId, HostRef, HostRevision, HostRevisionId, HostSave,
    HostTarget, ItemId, LifecycleManager, Result, RevisionId, RevisionStore, Store, StoreConfig,
    TetherError,
};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

const FIELD: &str = "field_items";

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        sync_every_commit: false,
        ..StoreConfig::new(dir.path().join("store"))
    }
}

fn test_manager(dir: &TempDir) -> LifecycleManager {
    LifecycleManager::new(Arc::new(Store::open_or_create(test_config(dir)).unwrap()))
}

fn host_with_child(manager: &LifecycleManager) -> (HostRef, ChildReference) {
    let saved = manager
        .on_host_save(
            HostSave::new(HostTarget::new_host("node"), FIELD).child(ChildSpec::new(json!("c"))),
        )
        .unwrap();
    (saved.host, saved.references[0])
}

// --- NotFound / UnknownRevision ---

#[test]
fn test_unknown_child() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);

    assert!(matches!(
        manager.store().get_child(ItemId(404)),
        Err(TetherError::NotFound(_))
    ));
    assert!(matches!(
        manager.update_child(ItemId(404), json!(1)),
        Err(TetherError::NotFound(_))
    ));
    assert!(matches!(
        manager.on_child_revision_delete(ItemId(404), RevisionId(1)),
        Err(TetherError::NotFound(_))
    ));
}

#[test]
fn test_unknown_existing_spec_rolls_back_new_children() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);

    let result = manager.on_host_save(
        HostSave::new(HostTarget::new_host("node"), FIELD)
            .child(ChildSpec::new(json!("fresh")))
            .child(ChildSpec::existing(ItemId(404))),
    );

    assert!(matches!(result, Err(TetherError::NotFound(_))));
    let stats = manager.store().stats();
    assert_eq!(stats.items, 0);
    assert_eq!(stats.hosts, 0);
    assert_eq!(stats.journal_entries, 0);
}

#[test]
fn test_set_default_rejects_foreign_revision() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (_, a) = host_with_child(&manager);
    let (_, b) = host_with_child(&manager);

    let result = manager
        .store()
        .transaction(|tx| tx.set_default(a.item_id, b.revision_id));

    assert!(matches!(result, Err(TetherError::UnknownRevision { .. })));
    let child = manager.store().get_child(a.item_id).unwrap();
    assert_eq!(child.revision_id, Some(a.revision_id));
}

#[test]
fn test_unknown_host_revision() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (host, _) = host_with_child(&manager);

    assert!(matches!(
        manager.on_host_revision_delete(&host, HostRevisionId(999)),
        Err(TetherError::NotFound(_))
    ));
}

// --- Validation ---

#[test]
fn test_child_of_another_host_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (_, foreign) = host_with_child(&manager);
    let (host, own) = host_with_child(&manager);

    let result = manager.on_host_save(
        HostSave::new(host.clone(), FIELD)
            .new_revision(true)
            .children(vec![
                ChildSpec::existing(own.item_id),
                ChildSpec::existing(foreign.item_id),
            ]),
    );

    match result {
        Err(e @ TetherError::HostMismatch { .. }) => assert!(e.is_validation()),
        other => panic!("expected HostMismatch, got {:?}", other),
    }
    assert_eq!(manager.host_revisions(&host).len(), 1);
}

#[test]
fn test_child_of_another_field_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (host, child) = host_with_child(&manager);

    let result = manager.on_host_save(
        HostSave::new(host.clone(), "field_other").child(ChildSpec::existing(child.item_id)),
    );

    match result {
        Err(e @ TetherError::BundleMismatch { .. }) => assert!(e.is_validation()),
        other => panic!("expected BundleMismatch, got {:?}", other),
    }
    assert!(manager.references(&host, "field_other").is_empty());
    assert_eq!(manager.references(&host, FIELD), vec![child]);
    assert_eq!(manager.store().get_child(child.item_id).unwrap().bundle, FIELD);
}

#[test]
fn test_child_listed_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (host, child) = host_with_child(&manager);

    let result = manager.on_host_save(
        HostSave::new(host.clone(), FIELD)
            .new_revision(true)
            .children(vec![
                ChildSpec::updated(child.item_id, json!("a")),
                ChildSpec::updated(child.item_id, json!("b")),
            ]),
    );

    match result {
        Err(e @ TetherError::DuplicateChild { .. }) => assert!(e.is_validation()),
        other => panic!("expected DuplicateChild, got {:?}", other),
    }
    assert_eq!(manager.store().revision_ids(child.item_id), vec![child.revision_id]);
    assert_eq!(manager.host_revisions(&host).len(), 1);
}

#[test]
fn test_default_host_revision_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (host, child) = host_with_child(&manager);
    let default = manager.default_host_revision(&host).unwrap();

    let result = manager.on_host_revision_delete(&host, default.host_revision_id);

    assert!(matches!(result, Err(TetherError::DefaultHostRevision(..))));
    assert_eq!(manager.references(&host, FIELD), vec![child]);
}

// --- Two-phase save ---

#[test]
fn test_persister_failure_rolls_back_phase_one() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);

    let mut failing = |_: &str, _: HostId| -> Result<HostId> {
        Err(TetherError::StoreUnavailable("host table offline".into()))
    };
    let result = manager.on_host_save_with(
        HostSave::new(HostTarget::new_host("node"), FIELD).child(ChildSpec::new(json!("c"))),
        &mut failing,
    );

    assert!(matches!(result, Err(TetherError::StoreUnavailable(_))));
    assert_eq!(manager.store().stats().items, 0);

    // Ids handed out in the failed attempt are reused.
    let (host, child) = host_with_child(&manager);
    assert_eq!(host.host_id, HostId(1));
    assert_eq!(child.item_id, ItemId(1));
}

#[test]
fn test_unusable_host_ids() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (existing, _) = host_with_child(&manager);

    let mut zero = |_: &str, _: HostId| -> Result<HostId> { Ok(HostId(0)) };
    let result = manager.on_host_save_with(
        HostSave::new(HostTarget::new_host("node"), FIELD).child(ChildSpec::new(json!(1))),
        &mut zero,
    );
    assert!(matches!(result, Err(TetherError::HostUnresolved(_))));

    let taken = existing.host_id;
    let mut collide = move |_: &str, _: HostId| -> Result<HostId> { Ok(taken) };
    let result = manager.on_host_save_with(
        HostSave::new(HostTarget::new_host("node"), FIELD).child(ChildSpec::new(json!(2))),
        &mut collide,
    );
    assert!(matches!(result, Err(TetherError::HostUnresolved(_))));

    assert_eq!(manager.store().stats().items, 1);
    assert!(manager.store().provisional_items().is_empty());
}

// --- Orphan protection ---

/// Counts events logged at error level.
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_orphan_delete_is_refused() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (host, child) = host_with_child(&manager);

    // A historical host revision pointing at a revision the child no
    // longer has, written behind the manager's back.
    manager
        .store()
        .transaction(|tx| {
            let mut fields = BTreeMap::new();
            fields.insert(
                FIELD.to_string(),
                vec![ChildReference::new(child.item_id, RevisionId(999))],
            );
            tx.put_host_revision(HostRevision {
                host_type: host.host_type.clone(),
                host_id: host.host_id,
                host_revision_id: HostRevisionId(999),
                is_default: false,
                fields,
            })
        })
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));
    let result = tracing::subscriber::with_default(subscriber, || {
        manager.on_child_revision_delete(child.item_id, child.revision_id)
    });

    assert!(matches!(result, Err(TetherError::OrphanDeleteConflict { .. })));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(manager.references(&host, FIELD), vec![child]);
    assert!(manager.store().get_child(child.item_id).is_ok());
}

// --- Idempotence ---

#[test]
fn test_explicit_delete_twice() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);
    let (host, child) = host_with_child(&manager);

    manager.on_child_explicit_delete(child.item_id).unwrap();
    let once = (manager.store().stats().items, manager.host_revisions(&host));

    manager.on_child_explicit_delete(child.item_id).unwrap();
    let twice = (manager.store().stats().items, manager.host_revisions(&host));

    assert_eq!(once, twice);
}

#[test]
fn test_delete_unknown_host() {
    let dir = TempDir::new().unwrap();
    let manager = test_manager(&dir);

    let deleted = manager
        .on_host_delete(&HostRef::new("node", HostId(77)))
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(manager.store().stats().journal_entries, 0);
}

// --- Store ---

#[test]
fn test_store_lock() {
    let dir = TempDir::new().unwrap();
    let _store = Store::open_or_create(test_config(&dir)).unwrap();

    assert!(matches!(
        Store::open_or_create(test_config(&dir)),
        Err(TetherError::Locked)
    ));
}

#[test]
fn test_bad_manifest() {
    let dir = TempDir::new().unwrap();
    {
        Store::open_or_create(test_config(&dir)).unwrap();
    }
    std::fs::write(dir.path().join("store").join("MANIFEST"), b"XXXX\x01").unwrap();

    assert!(matches!(
        Store::open_or_create(test_config(&dir)),
        Err(TetherError::InvalidFormat(_))
    ));
}

#[test]
fn test_dropped_transaction_is_rolled_back() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_or_create(test_config(&dir)).unwrap();

    {
        let mut tx = store.begin();
        let mut entity = tether::ChildEntity::with_payload(FIELD, "node", json!(1));
        entity.host_id = Some(HostId(1));
        tx.put(entity).unwrap();
    }

    assert_eq!(store.stats().items, 0);
}
