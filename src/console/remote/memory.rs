//! In-process adapters
//!
//! `MemoryRemoteStore` and `MemoryResourceHost` keep everything in memory,
//! record every call, and can be scripted to fail. They back the test suites
//! and `memory:` smoke runs of the daemon.

use crate::console::remote::{RemoteStore, ResourceHost, UploadedResource};
use crate::shared::{CollectionName, Entity, EntityId, Fields, SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// A write or read received by the in-memory store
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create { collection: CollectionName, entity: Entity },
    Update { collection: CollectionName, id: EntityId, patch: Fields },
    Delete { collection: CollectionName, id: EntityId },
    List { collection: CollectionName },
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<CollectionName, BTreeMap<EntityId, Entity>>,
    /// Client id -> assigned id, so replayed creates land on the same record
    assigned: HashMap<(CollectionName, EntityId), EntityId>,
    calls: Vec<RemoteCall>,
    failures: VecDeque<SyncError>,
    /// Errors returned after a write was applied
    lost_responses: VecDeque<SyncError>,
}

/// In-memory document store with upsert-by-client-id creates
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<StoreState>,
    assign_ids: bool,
    unreachable: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryRemoteStore {
    /// Store that keeps client ids
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that assigns its own ids (`srv-N`) on create
    pub fn assigning_ids() -> Self {
        Self {
            assign_ids: true,
            ..Self::default()
        }
    }

    /// Fail the next call with `error`; queued failures are consumed in order
    pub fn fail_next(&self, error: SyncError) {
        self.lock().failures.push_back(error);
    }

    /// Apply the next write, then answer it with `error` as if the
    /// response was lost on the way back
    pub fn lose_next_response(&self, error: SyncError) {
        self.lock().lost_responses.push_back(error);
    }

    /// While unreachable, every call fails with a transient error
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing call recording
    pub fn insert(&self, collection: &CollectionName, entity: Entity) {
        self.lock()
            .records
            .entry(collection.clone())
            .or_default()
            .insert(entity.id.clone(), entity);
    }

    /// Stored records of a collection
    pub fn records(&self, collection: &CollectionName) -> Vec<Entity> {
        self.lock()
            .records
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, collection: &CollectionName, id: &EntityId) -> Option<Entity> {
        self.lock()
            .records
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned()
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and pop a scripted failure, if any
    fn begin(&self, call: RemoteCall) -> SyncResult<std::sync::MutexGuard<'_, StoreState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SyncError::transient("remote store unreachable"));
        }
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        Ok(state)
    }
}

/// Answer an applied write, unless its response is scripted to get lost
fn respond<T>(state: &mut StoreState, value: T) -> SyncResult<T> {
    match state.lost_responses.pop_front() {
        Some(error) => Err(error),
        None => Ok(value),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create(&self, collection: &CollectionName, entity: &Entity) -> SyncResult<EntityId> {
        let mut state = self.begin(RemoteCall::Create {
            collection: collection.clone(),
            entity: entity.clone(),
        })?;

        let key = (collection.clone(), entity.id.clone());
        let id = match state.assigned.get(&key) {
            Some(existing) => existing.clone(),
            None if self.assign_ids => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                EntityId::new(format!("srv-{}", n))
            }
            None => entity.id.clone(),
        };
        state.assigned.insert(key, id.clone());

        let stored = Entity::new(id.clone(), entity.fields.clone());
        state
            .records
            .entry(collection.clone())
            .or_default()
            .insert(id.clone(), stored);
        respond(&mut state, id)
    }

    async fn update(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        patch: &Fields,
    ) -> SyncResult<()> {
        let mut state = self.begin(RemoteCall::Update {
            collection: collection.clone(),
            id: id.clone(),
            patch: patch.clone(),
        })?;

        match state
            .records
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
        {
            Some(entity) => {
                entity.apply_patch(patch);
                respond(&mut state, ())
            }
            None => Err(SyncError::rejected(format!(
                "document {}/{} does not exist",
                collection, id
            ))),
        }
    }

    async fn delete(&self, collection: &CollectionName, id: &EntityId) -> SyncResult<()> {
        let mut state = self.begin(RemoteCall::Delete {
            collection: collection.clone(),
            id: id.clone(),
        })?;
        if let Some(records) = state.records.get_mut(collection) {
            records.remove(id);
        }
        respond(&mut state, ())
    }

    async fn list(&self, collection: &CollectionName) -> SyncResult<Vec<Entity>> {
        let state = self.begin(RemoteCall::List {
            collection: collection.clone(),
        })?;
        Ok(state
            .records
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// In-memory resource host
#[derive(Debug, Default)]
pub struct MemoryResourceHost {
    uploads: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<VecDeque<SyncError>>,
    deleted: Mutex<Vec<String>>,
    next_id: AtomicU64,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryResourceHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host that takes `delay` per upload, so concurrent uploads overlap
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next upload with `error`
    pub fn fail_next(&self, error: SyncError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Number of stored uploads
    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Bytes stored under `remote_id`
    pub fn stored(&self, remote_id: &str) -> Option<Bytes> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote_id)
            .cloned()
    }

    /// Remote ids deleted so far
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Highest number of uploads observed in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHost for MemoryResourceHost {
    async fn upload(
        &self,
        bytes: Bytes,
        _content_type: &str,
        existing_remote_id: Option<&str>,
    ) -> SyncResult<UploadedResource> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let result = match failure {
            Some(error) => Err(error),
            None => {
                let remote_id = match existing_remote_id {
                    Some(existing) => existing.to_string(),
                    None => format!("img-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
                };
                self.uploads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(remote_id.clone(), bytes);
                Ok(UploadedResource {
                    url: format!("memory://resources/{}", remote_id),
                    remote_id,
                })
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, remote_id: &str) -> SyncResult<()> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(remote_id);
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(remote_id.to_string());
        Ok(())
    }
}
