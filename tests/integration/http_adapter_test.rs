//! HTTP adapters against a mock server: request shape and status mapping

use crate::common::fields;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use stockpile::console::remote::{
    HttpProbe, HttpRemoteStore, HttpResourceHost, RemoteStore, ResourceHost,
};
use stockpile::console::sync::ReachabilityProbe;
use stockpile::shared::{CollectionName, Entity, EntityId, SyncError};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn inventory() -> CollectionName {
    CollectionName::new("inventory")
}

#[tokio::test]
async fn test_create_posts_document_with_client_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/inventory/documents"))
        .and(header("Authorization", "Bearer secret"))
        .and(body_partial_json(json!({"id": "tmp-1", "name": "Bolt"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "srv-7"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpRemoteStore::new(&server.uri(), Some("secret".to_string())).unwrap();
    let entity = Entity::new(EntityId::new("tmp-1"), fields(json!({"name": "Bolt"})));
    let id = store.create(&inventory(), &entity).await.unwrap();
    assert_eq!(id, EntityId::new("srv-7"));
}

#[tokio::test]
async fn test_status_codes_map_to_error_kinds() {
    let cases = [
        (408, true),
        (429, true),
        (500, true),
        (503, true),
        (400, false),
        (403, false),
        (422, false),
    ];

    for (status, retryable) in cases {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/collections/inventory/documents/bolt"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let store = HttpRemoteStore::new(&server.uri(), None).unwrap();
        let err = store
            .update(&inventory(), &EntityId::new("bolt"), &fields(json!({"quantity": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.is_retryable(), retryable, "status {}", status);
        if !retryable {
            assert!(matches!(err, SyncError::RemoteRejected { .. }), "status {}", status);
        }
    }
}

#[tokio::test]
async fn test_delete_of_missing_document_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/collections/inventory/documents/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = HttpRemoteStore::new(&server.uri(), None).unwrap();
    store.delete(&inventory(), &EntityId::new("gone")).await.unwrap();
}

#[tokio::test]
async fn test_list_reads_ids_and_skips_documents_without_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/inventory/documents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "a", "name": "Anchor"},
            {"id": 42, "name": "Numbered"},
            {"name": "No id"}
        ])))
        .mount(&server)
        .await;

    let store = HttpRemoteStore::new(&server.uri(), None).unwrap();
    let entities = store.list(&inventory()).await.unwrap();
    let ids: Vec<&str> = entities.iter().map(|entity| entity.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "42"]);
    assert_eq!(entities[0].get("id"), None);
    assert_eq!(entities[0].get("name"), Some(&json!("Anchor")));
}

#[tokio::test]
async fn test_upload_passes_replacement_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .and(query_param("replace", "img-1"))
        .and(header("Content-Type", "image/jpeg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://cdn.example.com/img-1.jpg",
            "remote_id": "img-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let host = HttpResourceHost::new(&server.uri(), None).unwrap();
    let uploaded = host
        .upload(Bytes::from_static(b"jpeg"), "image/jpeg", Some("img-1"))
        .await
        .unwrap();
    assert_eq!(uploaded.remote_id, "img-1");
    assert_eq!(uploaded.url, "https://cdn.example.com/img-1.jpg");
}

#[tokio::test]
async fn test_upload_rate_limit_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let host = HttpResourceHost::new(&server.uri(), None).unwrap();
    let err = host
        .upload(Bytes::from_static(b"png"), "image/png", None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_probe_reports_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let probe = HttpProbe::new(&server.uri(), Duration::from_secs(2)).unwrap();
    assert!(probe.probe().await.is_ok());
    assert!(probe.probe().await.is_err());
}
