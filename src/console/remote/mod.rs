//! # Remote Adapters
//!
//! The data layer talks to two opaque services through the narrow traits in
//! this module:
//!
//! - [`RemoteStore`] - the managed document database (imperative writes and a
//!   full collection read; live subscriptions are handled outside this crate)
//! - [`ResourceHost`] - the binary host that stores uploaded images
//!
//! Two implementations ship with the crate: `http` (reqwest, used in
//! production) and `memory` (in-process, used by tests and smoke runs).

pub mod http;
pub mod memory;

use crate::shared::{CollectionName, Entity, EntityId, Fields, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use http::{HttpProbe, HttpRemoteStore, HttpResourceHost};
pub use memory::{MemoryRemoteStore, MemoryResourceHost, RemoteCall};

/// Imperative write/read primitives of the remote document store
///
/// Implementations must treat `create` as an upsert keyed by the entity's
/// client id: replaying a create whose first attempt actually landed must not
/// produce a second record.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create (or upsert) an entity; returns the id the store keeps it under
    async fn create(&self, collection: &CollectionName, entity: &Entity) -> SyncResult<EntityId>;

    /// Merge `patch` into an existing entity
    async fn update(&self, collection: &CollectionName, id: &EntityId, patch: &Fields)
        -> SyncResult<()>;

    /// Delete an entity; deleting a missing entity succeeds
    async fn delete(&self, collection: &CollectionName, id: &EntityId) -> SyncResult<()>;

    /// Every entity of a collection
    async fn list(&self, collection: &CollectionName) -> SyncResult<Vec<Entity>>;
}

/// Where an uploaded resource now lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedResource {
    /// Public URL recorded on the entity
    pub url: String,
    /// Host-side id, used to replace or delete the resource later
    pub remote_id: String,
}

/// Binary resource host
#[async_trait]
pub trait ResourceHost: Send + Sync {
    /// Upload bytes, replacing `existing_remote_id` when given
    async fn upload(
        &self,
        bytes: Bytes,
        content_type: &str,
        existing_remote_id: Option<&str>,
    ) -> SyncResult<UploadedResource>;

    /// Delete an uploaded resource
    async fn delete(&self, remote_id: &str) -> SyncResult<()>;
}
