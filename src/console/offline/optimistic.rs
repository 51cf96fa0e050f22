//! # Optimistic Mutation Dispatcher
//!
//! The single entry point for creating, updating and deleting entities.
//!
//! ## Flow
//!
//! 1. The bytes behind local refs in the payload are persisted, then the
//!    change is written to the local cache before anything touches the
//!    network. `mutate` returns once this optimistic half is done.
//! 2. Local refs are uploaded with `commit_all` when the link is stable;
//!    otherwise the upload waits for the flush.
//! 3. When the link is stable and nothing for the entity is queued, the write
//!    goes to the remote store directly. A transient failure falls back to
//!    the queue with the attempt counted; a rejection rolls the cache back
//!    and is returned.
//! 4. Everything else is queued.
//!
//! Mutations of one entity run strictly in call order. The remote half runs
//! in a background task; await [`PendingMutation::confirmed`] to observe it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use stockpile::console::offline::{Mutation, MutationDispatcher};
//! # use stockpile::shared::Fields;
//! # async fn example(dispatcher: Arc<MutationDispatcher>) -> stockpile::shared::SyncResult<()> {
//! let pending = dispatcher
//!     .mutate(&"inventory".into(), Mutation::create(Fields::new()))
//!     .await?;
//! // The cache already holds the new entity here
//! let outcome = pending.confirmed().await?;
//! println!("{} via {:?}", outcome.entity_id, outcome.path);
//! # Ok(())
//! # }
//! ```

use crate::console::cache::CacheStore;
use crate::console::offline::queue::{OpKind, SyncQueue};
use crate::console::remote::RemoteStore;
use crate::console::resources::{
    collect_local_refs, replace_local_refs, strip_local_refs, ResourceCoordinator, ResourceHold,
};
use crate::console::sync::network_monitor::ConnectivityMonitor;
use crate::shared::{CollectionName, Entity, EntityId, Fields, SyncError, SyncResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

/// A change requested by the UI
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// New entity; a provisional id is generated when `id` is `None`
    Create { id: Option<EntityId>, fields: Fields },
    /// Shallow patch of an existing entity
    Update { id: EntityId, patch: Fields },
    Delete { id: EntityId },
}

impl Mutation {
    pub fn create(fields: Fields) -> Self {
        Self::Create { id: None, fields }
    }

    pub fn update(id: impl Into<EntityId>, patch: Fields) -> Self {
        Self::Update {
            id: id.into(),
            patch,
        }
    }

    pub fn delete(id: impl Into<EntityId>) -> Self {
        Self::Delete { id: id.into() }
    }
}

/// How the remote half reached (or will reach) the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePath {
    /// Confirmed by a direct remote write
    Direct,
    /// Queued for the next flush
    Queued { sequence: u64 },
}

/// Result of the remote half of a mutation
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Final id; differs from the provisional id when the store assigned one
    pub entity_id: EntityId,
    pub path: WritePath,
    /// Uploads that failed and will be retried by the flush
    pub failed_resources: Vec<(String, SyncError)>,
}

/// Handle on a mutation whose optimistic half is applied
#[derive(Debug)]
pub struct PendingMutation {
    entity_id: EntityId,
    task: JoinHandle<SyncResult<MutationOutcome>>,
}

impl PendingMutation {
    /// Id the entity is cached under right now
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Wait for the remote half
    pub async fn confirmed(self) -> SyncResult<MutationOutcome> {
        self.task
            .await
            .map_err(|e| SyncError::local_store(format!("mutation task failed: {}", e)))?
    }
}

/// Everything the remote half needs
struct RemoteHalf {
    collection: CollectionName,
    op: OpKind,
    entity_id: EntityId,
    payload: Fields,
    previous: Option<Entity>,
    /// Persisted bytes of the payload's local refs
    resources: Option<ResourceHold>,
    _lane: OwnedMutexGuard<()>,
}

type LaneKey = (CollectionName, EntityId);

/// Orchestrates cache, resources, direct writes and the queue
pub struct MutationDispatcher {
    cache: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
    resources: Arc<ResourceCoordinator>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectivityMonitor>,
    lanes: Mutex<HashMap<LaneKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for MutationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationDispatcher")
            .field("connectivity", &self.monitor.status())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl MutationDispatcher {
    pub fn new(
        cache: Arc<CacheStore>,
        queue: Arc<SyncQueue>,
        resources: Arc<ResourceCoordinator>,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            cache,
            queue,
            resources,
            remote,
            monitor,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a mutation optimistically and start its remote half
    ///
    /// Fails only when the optimistic half fails: the local store could not
    /// persist the change or its resources, a referenced resource is
    /// unknown, or an update targets an unknown entity.
    pub async fn mutate(
        self: &Arc<Self>,
        collection: &CollectionName,
        mutation: Mutation,
    ) -> SyncResult<PendingMutation> {
        let (op, requested_id, payload) = match mutation {
            Mutation::Create { id, fields } => {
                (OpKind::Create, id.unwrap_or_else(EntityId::provisional), fields)
            }
            Mutation::Update { id, patch } => (OpKind::Update, id, patch),
            Mutation::Delete { id } => (OpKind::Delete, id, Fields::new()),
        };

        // A remap may retire the id while we wait for its lane
        let mut entity_id = self.queue.resolve_id(collection, &requested_id);
        let lane = loop {
            let lane = self.lane(collection, &entity_id).lock_owned().await;
            let current = self.queue.resolve_id(collection, &requested_id);
            if current == entity_id {
                break lane;
            }
            entity_id = current;
        };
        let previous = self.cache.get_entity(collection, &entity_id);
        if op == OpKind::Update && previous.is_none() {
            return Err(SyncError::not_found(format!("{}/{}", collection, entity_id)));
        }

        let local_refs = collect_local_refs(&payload);
        let resources = if local_refs.is_empty() {
            None
        } else {
            Some(self.resources.persist_held(&local_refs).await?)
        };

        match op {
            OpKind::Create | OpKind::Update => {
                let mut shown = payload.clone();
                strip_local_refs(&mut shown, previous.as_ref().map(|entity| &entity.fields));
                let entity = match (&previous, op) {
                    (Some(previous), OpKind::Update) => {
                        let mut entity = previous.clone();
                        entity.apply_patch(&shown);
                        entity
                    }
                    _ => Entity::new(entity_id.clone(), shown),
                };
                self.cache.put(collection, entity).await?;
            }
            OpKind::Delete => {
                self.cache.remove(collection, &entity_id).await?;
            }
        }
        tracing::debug!("[DISPATCH] Applied {:?} {}/{} locally", op, collection, entity_id);

        let half = RemoteHalf {
            collection: collection.clone(),
            op,
            entity_id: entity_id.clone(),
            payload,
            previous,
            resources,
            _lane: lane,
        };
        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move { dispatcher.complete(half).await });

        Ok(PendingMutation { entity_id, task })
    }

    async fn complete(&self, mut half: RemoteHalf) -> SyncResult<MutationOutcome> {
        let online = self.monitor.status().is_stable();

        let local_refs = collect_local_refs(&half.payload);
        let (uploaded, failed_resources) = if online && !local_refs.is_empty() {
            self.upload_resources(&mut half, &local_refs).await
        } else {
            (Vec::new(), Vec::new())
        };

        let direct = online
            && failed_resources.is_empty()
            && !self.queue.has_items_for(&half.collection, &half.entity_id);

        let mut attempted = None;
        if direct {
            match self.write_direct(&half).await {
                Ok(entity_id) => {
                    tracing::debug!("[DISPATCH] {:?} {}/{} written directly", half.op, half.collection, entity_id);
                    self.release_uploaded(half.resources.take(), &uploaded).await;
                    return Ok(MutationOutcome {
                        entity_id,
                        path: WritePath::Direct,
                        failed_resources,
                    });
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "[DISPATCH] Direct write of {}/{} failed, queueing: {}",
                        half.collection,
                        half.entity_id,
                        e
                    );
                    attempted = Some(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "[DISPATCH] {}/{} rejected, rolling back: {}",
                        half.collection,
                        half.entity_id,
                        e
                    );
                    self.release_uploaded(half.resources.take(), &uploaded).await;
                    self.roll_back(&half).await?;
                    return Err(e);
                }
            }
        }

        let sequence = match &attempted {
            Some(error) => {
                self.queue
                    .enqueue_attempted(
                        half.op,
                        half.collection.clone(),
                        half.entity_id.clone(),
                        half.payload,
                        error,
                    )
                    .await?
            }
            None => {
                self.queue
                    .enqueue(
                        half.op,
                        half.collection.clone(),
                        half.entity_id.clone(),
                        half.payload,
                    )
                    .await?
            }
        };
        self.release_uploaded(half.resources.take(), &uploaded).await;
        Ok(MutationOutcome {
            entity_id: half.entity_id,
            path: WritePath::Queued { sequence },
            failed_resources,
        })
    }

    /// Upload local refs, merge the successes into payload and cache
    ///
    /// Returns the uploaded and the failed resource ids; failed ones keep
    /// their local ref and persisted bytes for the flush.
    async fn upload_resources(
        &self,
        half: &mut RemoteHalf,
        local_refs: &[String],
    ) -> (Vec<String>, Vec<(String, SyncError)>) {
        let mut uploaded = HashMap::new();
        let mut failed = Vec::new();
        for (resource_id, result) in self.resources.commit_all(local_refs).await {
            match result {
                Ok(resource) => {
                    uploaded.insert(resource_id, resource.url);
                }
                Err(e) => {
                    tracing::warn!("[DISPATCH] Resource {} not uploaded, deferring to flush: {}", resource_id, e);
                    failed.push((resource_id, e));
                }
            }
        }

        if !uploaded.is_empty() {
            replace_local_refs(&mut half.payload, &uploaded);
            if let Some(mut entity) = self.cache.get_entity(&half.collection, &half.entity_id) {
                let mut shown = half.payload.clone();
                strip_local_refs(&mut shown, Some(&entity.fields));
                entity.apply_patch(&shown);
                if let Err(e) = self.cache.put(&half.collection, entity).await {
                    tracing::error!("[DISPATCH] Could not cache uploaded URLs of {}: {}", half.entity_id, e);
                }
            }
        }
        (uploaded.into_keys().collect(), failed)
    }

    /// Let go of the payload's resources; uploaded bytes nothing queued
    /// still references are deleted
    async fn release_uploaded(&self, hold: Option<ResourceHold>, uploaded: &[String]) {
        drop(hold);
        if !uploaded.is_empty() {
            self.resources
                .release_unreferenced(uploaded, &self.queue.referenced_resources())
                .await;
        }
    }

    /// Send the write; returns the id the remote store keeps the entity under
    async fn write_direct(&self, half: &RemoteHalf) -> SyncResult<EntityId> {
        let collection = &half.collection;
        match half.op {
            OpKind::Create => {
                let entity = Entity::new(half.entity_id.clone(), half.payload.clone());
                let remote_id = self.remote.create(collection, &entity).await?;
                if remote_id != half.entity_id {
                    self.queue.register_alias(collection, &half.entity_id, &remote_id);
                    self.resources.reassign_owner(&half.entity_id, &remote_id);
                    if let Err(e) = self.cache.remap(collection, &half.entity_id, &remote_id).await {
                        tracing::error!(
                            "[DISPATCH] {}/{} created as {} but the cache could not follow: {}",
                            collection,
                            half.entity_id,
                            remote_id,
                            e
                        );
                    }
                }
                Ok(remote_id)
            }
            OpKind::Update => {
                self.remote
                    .update(collection, &half.entity_id, &half.payload)
                    .await?;
                Ok(half.entity_id.clone())
            }
            OpKind::Delete => {
                self.remote.delete(collection, &half.entity_id).await?;
                Ok(half.entity_id.clone())
            }
        }
    }

    /// Restore the cache to its state before the mutation
    async fn roll_back(&self, half: &RemoteHalf) -> SyncResult<()> {
        match &half.previous {
            Some(previous) => self.cache.put(&half.collection, previous.clone()).await,
            None => self
                .cache
                .remove(&half.collection, &half.entity_id)
                .await
                .map(|_| ()),
        }
    }

    fn lane(&self, collection: &CollectionName, id: &EntityId) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        Arc::clone(
            lanes
                .entry((collection.clone(), id.clone()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}
