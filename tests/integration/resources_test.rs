//! Pending resources end to end: previews, offline persistence and uploads
//! at flush time

use crate::common::{fields, memory_console, png};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use stockpile::console::offline::{Mutation, WritePath};
use stockpile::console::resources::{ResourceSlot, ResourceState};
use stockpile::shared::{CollectionName, EntityId, SyncError};

#[tokio::test]
async fn test_two_offline_images_upload_at_flush() {
    let t = memory_console().await;
    let media = CollectionName::new("media");
    let owner = EntityId::provisional();

    let front = t.console.select_resource(
        png(320, 240),
        "image/png",
        owner.clone(),
        ResourceSlot::indexed("images", 0),
    );
    let back = t.console.select_resource(
        png(240, 320),
        "image/png",
        owner.clone(),
        ResourceSlot::indexed("images", 1),
    );
    assert_eq!(t.console.preview_stats().live(), 2);
    let handle = front.preview.clone().unwrap();
    assert!(t.console.preview(&handle).is_some());

    let mut payload = fields(json!({"caption": "Shelf 4"}));
    front.attach_to(&mut payload);
    back.attach_to(&mut payload);

    let outcome = t
        .console
        .mutate(&media, Mutation::Create { id: Some(owner.clone()), fields: payload })
        .await
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    assert!(matches!(outcome.path, WritePath::Queued { .. }));

    let cached = t.console.entity(&media, &owner).unwrap();
    assert_eq!(cached.get("caption"), Some(&json!("Shelf 4")));
    assert_eq!(cached.get("images"), Some(&json!([])));
    assert_eq!(t.console.pending_resources(&owner).len(), 2);
    assert!(t
        .console
        .pending_resources(&owner)
        .iter()
        .all(|resource| resource.state == ResourceState::Selected));

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.uploaded, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(t.host.upload_count(), 2);

    let images = t
        .console
        .entity(&media, &owner)
        .and_then(|entity| entity.get("images").cloned())
        .unwrap();
    let urls: Vec<&str> = images
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|url| url.as_str())
        .collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.iter().all(|url| url.starts_with("memory://resources/")));

    assert!(t.console.pending_resources(&owner).is_empty());
    let stats = t.console.preview_stats();
    assert_eq!(stats.allocated, 2);
    assert_eq!(stats.live(), 0);
    assert!(t.console.preview(&handle).is_none());
}

#[tokio::test]
async fn test_every_preview_handle_is_released_once() {
    let t = memory_console().await;
    let owner = EntityId::new("item-7");

    let kept = t.console.select_resource(
        Bytes::from_static(b"label"),
        "text/plain",
        owner.clone(),
        ResourceSlot::field("image"),
    );
    let dropped = t.console.select_resource(
        Bytes::from_static(b"blurry"),
        "text/plain",
        owner.clone(),
        ResourceSlot::field("image"),
    );
    let flaky = t.console.select_resource(
        Bytes::from_static(b"retry me"),
        "text/plain",
        owner.clone(),
        ResourceSlot::field("image"),
    );
    assert_eq!(t.console.preview_stats().live(), 3);

    assert!(t.console.discard_resource(&dropped.id));
    assert!(!t.console.discard_resource(&dropped.id));

    let uploaded = t.console.commit_resource(&kept.id).await.unwrap();
    assert!(uploaded.url.ends_with(&uploaded.remote_id));

    t.host.fail_next(SyncError::transient("503"));
    let err = t.console.commit_resource(&flaky.id).await.unwrap_err();
    assert!(matches!(err, SyncError::ResourceUploadFailed { .. }));
    assert_eq!(
        t.console.pending_resources(&owner)[0].state,
        ResourceState::Failed
    );
    assert!(t.console.discard_resource(&flaky.id));

    let stats = t.console.preview_stats();
    assert_eq!(stats.allocated, 3);
    assert_eq!(stats.released, 3);
    assert!(t.console.pending_resources(&owner).is_empty());
}

#[tokio::test]
async fn test_replacement_upload_reuses_remote_id() {
    let t = memory_console().await;
    let owner = EntityId::new("item-9");

    let replacement = t.console.select_replacement_resource(
        Bytes::from_static(b"new photo"),
        "text/plain",
        owner,
        ResourceSlot::field("image"),
        "img-42",
    );
    let uploaded = t.console.commit_resource(&replacement.id).await.unwrap();
    assert_eq!(uploaded.remote_id, "img-42");
    assert_eq!(t.host.stored("img-42"), Some(Bytes::from_static(b"new photo")));
    assert!(t.host.deleted().is_empty());
}

#[tokio::test]
async fn test_closing_the_dialog_keeps_the_queued_image() {
    let t = memory_console().await;
    let inventory = CollectionName::new("inventory");
    let owner = EntityId::provisional();

    let picked = t.console.select_resource(
        png(32, 32),
        "image/png",
        owner.clone(),
        ResourceSlot::field("image"),
    );
    let mut payload = fields(json!({"name": "Caster"}));
    picked.attach_to(&mut payload);

    let pending = t
        .console
        .mutate(&inventory, Mutation::Create { id: Some(owner.clone()), fields: payload })
        .await
        .unwrap();
    for resource in t.console.pending_resources(&owner) {
        t.console.discard_resource(&resource.id);
    }
    assert_eq!(t.console.preview_stats().live(), 0);

    let outcome = pending.confirmed().await.unwrap();
    assert!(matches!(outcome.path, WritePath::Queued { .. }));
    assert_eq!(t.console.pending_count(), 1);

    t.console.set_link_up(true);
    let report = t.console.flush().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.succeeded, 1);

    let image = t
        .console
        .entity(&inventory, &owner)
        .and_then(|entity| entity.get("image").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap();
    assert!(image.starts_with("memory://resources/"));
}
