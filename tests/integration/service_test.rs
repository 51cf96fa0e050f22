//! Background sync service: connectivity-triggered flushing and reloads

use crate::common::{fields, memory_console, wait_until};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stockpile::console::offline::Mutation;
use stockpile::console::sync::ConnectivityState;
use stockpile::shared::{CollectionName, Entity, EntityId, SyncError};

#[tokio::test]
async fn test_flushes_on_entering_stable_but_not_unstable() {
    let mut t = memory_console().await;
    let inventory = CollectionName::new("inventory");
    t.console
        .mutate(&inventory, Mutation::create(fields(json!({"name": "Gear"}))))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    let transitions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&transitions);
    let _subscription = t.console.subscribe_connectivity(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    t.console.start();

    // A failed probe before the link comes up makes the first online status Unstable
    t.console
        .monitor()
        .record_probe(Err(SyncError::transient("timeout")));
    t.console.set_link_up(true);
    assert_eq!(t.console.connectivity(), ConnectivityState::Unstable);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(t.console.pending_count(), 1);
    assert!(t.remote.calls().is_empty());

    for _ in 0..5 {
        t.console
            .monitor()
            .record_probe(Ok(Duration::from_millis(20)));
    }
    assert_eq!(t.console.connectivity(), ConnectivityState::Stable);
    assert_eq!(transitions.load(Ordering::SeqCst), 2);

    assert!(wait_until(|| t.console.pending_count() == 0).await);
    assert_eq!(t.remote.records(&inventory).len(), 1);
    t.console.stop();
}

#[tokio::test]
async fn test_starting_while_stable_flushes_backlog() {
    let mut t = memory_console().await;
    let inventory = CollectionName::new("inventory");
    for name in ["Rivet", "Shim"] {
        t.console
            .mutate(&inventory, Mutation::create(fields(json!({ "name": name }))))
            .await
            .unwrap()
            .confirmed()
            .await
            .unwrap();
    }

    t.console.set_link_up(true);
    t.console.start();
    assert!(wait_until(|| t.console.pending_count() == 0).await);
    assert_eq!(t.remote.records(&inventory).len(), 2);

    let status = t.console.status().await;
    assert_eq!(status.connectivity, ConnectivityState::Stable);
    assert!(!status.is_flushing);
    assert!(status.last_flush.is_some());
    t.console.stop();
}

#[tokio::test]
async fn test_reload_keeps_queued_local_edits() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");
    let bolt = EntityId::new("bolt");
    let nut = EntityId::new("nut");
    t.remote
        .insert(&inventory, Entity::new(bolt.clone(), fields(json!({"name": "Bolt", "quantity": 5}))));
    t.remote
        .insert(&inventory, Entity::new(nut.clone(), fields(json!({"name": "Nut", "quantity": 1}))));
    assert_eq!(t.console.reload_collection(&inventory).await.unwrap(), 2);

    t.console
        .mutate(&inventory, Mutation::update(bolt.clone(), fields(json!({"quantity": 9}))))
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    // Someone else changes the other record meanwhile
    t.remote
        .insert(&inventory, Entity::new(nut.clone(), fields(json!({"name": "Nut", "quantity": 2}))));

    assert_eq!(t.console.reload_collection(&inventory).await.unwrap(), 2);
    assert_eq!(
        t.console.entity(&inventory, &bolt).unwrap().get("quantity"),
        Some(&json!(9))
    );
    assert_eq!(
        t.console.entity(&inventory, &nut).unwrap().get("quantity"),
        Some(&json!(2))
    );
    assert_eq!(t.console.pending_count(), 1);
}
