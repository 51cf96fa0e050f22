//! State must survive a restart between the optimistic write and the flush

use crate::common::{console_on, fields, png};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use stockpile::console::local_db::LocalDatabase;
use stockpile::console::offline::{Mutation, WritePath};
use stockpile::console::remote::{MemoryRemoteStore, MemoryResourceHost};
use stockpile::console::resources::ResourceSlot;
use stockpile::shared::{CollectionName, EntityId};

#[tokio::test]
async fn test_queue_and_cache_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let remote = Arc::new(MemoryRemoteStore::new());
    let host = Arc::new(MemoryResourceHost::new());
    let inventory = CollectionName::new("inventory");

    let id = {
        let t = console_on(LocalDatabase::open(&path).await.unwrap(), remote.clone(), host.clone()).await;
        let pending = t
            .console
            .mutate(&inventory, Mutation::create(fields(json!({"name": "Washer"}))))
            .await
            .unwrap();
        let id = pending.entity_id().clone();
        pending.confirmed().await.unwrap();
        t.console
            .mutate(&inventory, Mutation::update(id.clone(), fields(json!({"quantity": 40}))))
            .await
            .unwrap()
            .confirmed()
            .await
            .unwrap();
        assert_eq!(t.console.pending_count(), 2);
        t.console.shutdown().await;
        id
    };

    let t = console_on(LocalDatabase::open(&path).await.unwrap(), remote.clone(), host).await;
    assert_eq!(t.console.pending_count(), 2);
    let cached = t.console.entity(&inventory, &id).unwrap();
    assert_eq!(cached.get("name"), Some(&json!("Washer")));
    assert_eq!(cached.get("quantity"), Some(&json!(40)));

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert!(report.is_clean());
    assert_eq!(t.console.pending_count(), 0);

    let record = remote.record(&inventory, &id).unwrap();
    assert_eq!(record.get("name"), Some(&json!("Washer")));
    assert_eq!(record.get("quantity"), Some(&json!(40)));
}

#[tokio::test]
async fn test_pending_image_bytes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let remote = Arc::new(MemoryRemoteStore::new());
    let host = Arc::new(MemoryResourceHost::new());
    let inventory = CollectionName::new("inventory");
    let owner = EntityId::provisional();

    {
        let t = console_on(LocalDatabase::open(&path).await.unwrap(), remote.clone(), host.clone()).await;
        let picked = t.console.select_resource(
            png(64, 48),
            "image/png",
            owner.clone(),
            ResourceSlot::field("image"),
        );
        let mut payload = fields(json!({"name": "Bracket"}));
        picked.attach_to(&mut payload);

        let outcome = t
            .console
            .mutate(&inventory, Mutation::Create { id: Some(owner.clone()), fields: payload })
            .await
            .unwrap()
            .confirmed()
            .await
            .unwrap();
        assert!(matches!(outcome.path, WritePath::Queued { .. }));

        // The UI never sees the placeholder
        let cached = t.console.entity(&inventory, &owner).unwrap();
        assert_eq!(cached.get("image"), Some(&json!(null)));
        t.console.shutdown().await;
    }

    let t = console_on(LocalDatabase::open(&path).await.unwrap(), remote.clone(), host.clone()).await;
    assert!(t.console.pending_resources(&owner).is_empty());

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(host.upload_count(), 1);

    let url = t
        .console
        .entity(&inventory, &owner)
        .and_then(|entity| entity.get("image").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap();
    assert!(url.starts_with("memory://resources/"));
    assert_eq!(
        remote.record(&inventory, &owner).unwrap().get("image"),
        Some(&json!(url))
    );
}
