//! Queue replay through the console: compaction, ordering, idempotency and
//! manual recovery of failed items

use crate::common::{console_on, fields, memory_console};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use stockpile::console::local_db::LocalDatabase;
use stockpile::console::offline::{ItemStatus, Mutation, WritePath};
use stockpile::console::remote::{
    MemoryRemoteStore, MemoryResourceHost, RemoteCall, RemoteStore,
};
use stockpile::shared::{CollectionName, Entity, EntityId, Fields, SyncError};

fn updates_for(calls: &[RemoteCall], target: &EntityId) -> Vec<Fields> {
    calls
        .iter()
        .filter_map(|call| match call {
            RemoteCall::Update { id, patch, .. } if id == target => Some(patch.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_offline_updates_collapse_into_one_write() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");
    let id = EntityId::new("bolt-m6");
    t.remote.insert(
        &inventory,
        Entity::new(id.clone(), fields(json!({"name": "Bolt M6", "quantity": 10}))),
    );
    t.console.reload_collection(&inventory).await.unwrap();

    for quantity in [5, 3, 1] {
        t.console
            .mutate(&inventory, Mutation::update(id.clone(), fields(json!({"quantity": quantity}))))
            .await
            .unwrap()
            .confirmed()
            .await
            .unwrap();
    }
    assert_eq!(t.console.pending_count(), 3);
    assert_eq!(
        t.console.entity(&inventory, &id).unwrap().get("quantity"),
        Some(&json!(1))
    );

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.compacted, 2);
    assert_eq!(report.succeeded, 1);

    let updates = updates_for(&t.remote.calls(), &id);
    assert_eq!(updates, vec![fields(json!({"quantity": 1}))]);
    assert_eq!(
        t.remote.record(&inventory, &id).unwrap().get("quantity"),
        Some(&json!(1))
    );
    assert_eq!(t.console.pending_count(), 0);
}

#[tokio::test]
async fn test_offline_create_then_delete_never_reaches_remote() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");

    let pending = t
        .console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Typo"}))))
        .await
        .unwrap();
    let id = pending.entity_id().clone();
    pending.confirmed().await.unwrap();
    t.console
        .mutate(&inventory, Mutation::delete(id.clone()))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    assert!(t.console.entity(&inventory, &id).is_none());

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.compacted, 2);
    assert_eq!(report.attempted, 0);

    assert!(t.remote.calls().is_empty());
    assert!(t.remote.records(&inventory).is_empty());
    assert!(t.console.use_entities(&inventory).is_empty());
    assert_eq!(t.console.pending_count(), 0);
}

#[tokio::test]
async fn test_writes_to_one_entity_replay_in_order() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");

    let first = t
        .console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Hinge"}))))
        .await
        .unwrap();
    let hinge = first.entity_id().clone();
    first.confirmed().await.unwrap();

    t.console
        .mutate(&inventory, Mutation::update(hinge.clone(), fields(json!({"quantity": 2}))))
        .await
        .unwrap();
    let other = t
        .console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Latch"}))))
        .await
        .unwrap();
    let latch = other.entity_id().clone();
    t.console
        .mutate(&inventory, Mutation::update(hinge.clone(), fields(json!({"location": "bin-3"}))))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    other.confirmed().await.unwrap();

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert!(report.is_clean());

    let calls = t.remote.calls();
    let position = |wanted: &dyn Fn(&RemoteCall) -> bool| calls.iter().position(|c| wanted(c));
    let create_at = position(&|c| matches!(c, RemoteCall::Create { entity, .. } if entity.id == hinge)).unwrap();
    let update_at = position(&|c| matches!(c, RemoteCall::Update { id, .. } if id == &hinge)).unwrap();
    assert!(create_at < update_at);

    let record = t.remote.record(&inventory, &hinge).unwrap();
    assert_eq!(record.get("quantity"), Some(&json!(2)));
    assert_eq!(record.get("location"), Some(&json!("bin-3")));
    assert!(t.remote.record(&inventory, &latch).is_some());
}

#[tokio::test]
async fn test_replayed_create_lands_once_and_remaps() {
    let remote = Arc::new(MemoryRemoteStore::assigning_ids());
    let t = console_on(
        LocalDatabase::in_memory().await.unwrap(),
        remote.clone(),
        Arc::new(MemoryResourceHost::new()),
    )
    .await;
    let inventory = CollectionName::new("inventory");
    let provisional = EntityId::new("tmp-1");

    t.console
        .mutate(
            &inventory,
            Mutation::Create { id: Some(provisional.clone()), fields: fields(json!({"name": "Bolt"})) },
        )
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    // The first attempt reached the store but its response was lost
    remote
        .create(&inventory, &Entity::new(provisional.clone(), fields(json!({"name": "Bolt"}))))
        .await
        .unwrap();

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.remapped, 1);
    assert_eq!(remote.records(&inventory).len(), 1);

    let assigned = EntityId::new("srv-1");
    assert!(t.console.entity(&inventory, &provisional).is_none());
    assert_eq!(
        t.console.entity(&inventory, &assigned).unwrap().get("name"),
        Some(&json!("Bolt"))
    );

    // Later writes through the retired id follow the remap
    let outcome = t
        .console
        .mutate(&inventory, Mutation::update(provisional.clone(), fields(json!({"quantity": 3}))))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    assert_eq!(outcome.entity_id, assigned);
    assert_eq!(outcome.path, WritePath::Direct);
    assert_eq!(
        remote.record(&inventory, &assigned).unwrap().get("quantity"),
        Some(&json!(3))
    );
}

#[tokio::test]
async fn test_rejected_item_waits_for_manual_retry() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");

    let pending = t
        .console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Spacer"}))))
        .await
        .unwrap();
    let id = pending.entity_id().clone();
    pending.confirmed().await.unwrap();

    t.console.set_link_up(true);
    t.remote.fail_next(SyncError::rejected("name already taken"));
    let report = t.console.flush().await;
    assert_eq!(report.failed, 1);
    assert!(matches!(report.failures[0].1, SyncError::RemoteRejected { .. }));

    let failed = t.console.failed_items();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, ItemStatus::Failed);
    assert!(t.console.entity(&inventory, &id).is_some());

    // A failed item is skipped until the user acts on it
    let report = t.console.flush().await;
    assert_eq!(report.attempted, 0);

    t.console.retry_item(failed[0].sequence).await.unwrap();
    let report = t.console.flush().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(t.console.pending_count(), 0);
    assert!(t.remote.record(&inventory, &id).is_some());
}

#[tokio::test]
async fn test_discarding_failed_item_reloads_collection() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");

    let pending = t
        .console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Orphan"}))))
        .await
        .unwrap();
    let id = pending.entity_id().clone();
    pending.confirmed().await.unwrap();

    t.console.set_link_up(true);
    t.remote.fail_next(SyncError::rejected("forbidden"));
    t.console.flush().await;
    let sequence = t.console.failed_items()[0].sequence;

    let discarded = t.console.discard_item(sequence).await.unwrap();
    assert_eq!(discarded.entity_id, id);
    assert_eq!(t.console.pending_count(), 0);
    assert!(t.console.entity(&inventory, &id).is_none());

    let err = t.console.discard_item(sequence).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

#[tokio::test]
async fn test_transient_failure_is_retried_on_next_flush() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");

    t.console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Clamp"}))))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    t.console.set_link_up(true);
    t.remote.fail_next(SyncError::transient("connection reset"));
    let report = t.console.flush().await;
    assert_eq!(report.retrying, 1);
    assert_eq!(t.console.pending_count(), 1);
    assert!(t.console.failed_items().is_empty());

    let report = t.console.flush().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(t.remote.records(&inventory).len(), 1);

    let status = t.console.status().await;
    assert_eq!(status.pending_operations, 0);
    assert_eq!(status.last_report, Some(report));
}

#[tokio::test]
async fn test_delete_after_timed_out_create_reaches_remote() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");
    t.console.set_link_up(true);
    t.remote.lose_next_response(SyncError::transient("gateway timeout"));

    let pending = t
        .console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Shim"}))))
        .await
        .unwrap();
    let id = pending.entity_id().clone();
    let outcome = pending.confirmed().await.unwrap();
    assert!(matches!(outcome.path, WritePath::Queued { .. }));
    assert!(t.remote.record(&inventory, &id).is_some());

    t.console.set_link_up(false);
    t.console
        .mutate(&inventory, Mutation::delete(id.clone()))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    assert_eq!(t.console.pending_count(), 2);

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.compacted, 0);
    assert_eq!(report.succeeded, 2);
    assert!(t.remote.record(&inventory, &id).is_none());
    assert!(t.console.entity(&inventory, &id).is_none());
}
