//! # Local Cache Store
//!
//! The single read source for entity data. Holds the last known state of every
//! collection in memory and writes each collection through to the local
//! database as one versioned blob.
//!
//! ## Guarantees
//!
//! - Read-after-write within the process: the in-memory map is updated before
//!   the first suspension point of every write.
//! - Writes to one collection are persisted one at a time, and each persist
//!   snapshots the newest in-memory state, so the stored blob never goes back
//!   in time.
//! - A collection that was never populated reads as empty.
//!
//! ## Change events
//!
//! Every applied change is announced on a broadcast channel. Events are sent
//! while the in-memory write lock is held, so `revision` increases strictly in
//! application order.

use crate::console::local_db::{collection_key, LocalDatabase, COLLECTION_PREFIX};
use crate::shared::{CollectionName, Entity, EntityId, SchemaRegistry, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};

/// Entities of one collection keyed by id
pub type CachedCollection = BTreeMap<EntityId, Entity>;

/// Capacity of the change event channel
const EVENT_CAPACITY: usize = 256;

/// Kind of change applied to the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    /// Entity inserted or replaced
    Put(EntityId),
    /// Entity removed
    Removed(EntityId),
    /// Whole collection replaced
    Replaced,
    /// Provisional id re-keyed to the remote id
    Remapped { from: EntityId, to: EntityId },
}

/// Change notification
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    /// Strictly increasing per store
    pub revision: u64,
    pub collection: CollectionName,
    pub change: CacheChange,
}

/// Persisted collection envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StoredCollection {
    #[serde(rename = "v1")]
    V1 { entities: Vec<Entity> },
}

#[derive(Debug, Default)]
struct CacheState {
    collections: HashMap<CollectionName, CachedCollection>,
    revision: u64,
}

/// Local cache of every entity collection
#[derive(Debug)]
pub struct CacheStore {
    db: LocalDatabase,
    schemas: SchemaRegistry,
    state: RwLock<CacheState>,
    write_locks: Mutex<HashMap<CollectionName, Arc<Mutex<()>>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
    /// Load every persisted collection from `db`
    pub async fn load(db: LocalDatabase, schemas: SchemaRegistry) -> SyncResult<Self> {
        let mut collections = HashMap::new();

        for key in db.list_keys(COLLECTION_PREFIX).await? {
            let name = CollectionName::new(&key[COLLECTION_PREFIX.len()..]);
            let Some(stored) = db.get_json::<StoredCollection>(&key).await? else {
                continue;
            };
            let StoredCollection::V1 { entities } = stored;

            let mut collection = CachedCollection::new();
            for mut entity in entities {
                schemas.normalize(&name, &mut entity);
                collection.insert(entity.id.clone(), entity);
            }
            tracing::debug!("[CACHE] Loaded {} entities for {}", collection.len(), name);
            collections.insert(name, collection);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            db,
            schemas,
            state: RwLock::new(CacheState {
                collections,
                revision: 0,
            }),
            write_locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// All entities of a collection, ordered by id
    pub fn get(&self, collection: &CollectionName) -> Vec<Entity> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .collections
            .get(collection)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A single entity
    pub fn get_entity(&self, collection: &CollectionName, id: &EntityId) -> Option<Entity> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .collections
            .get(collection)
            .and_then(|entities| entities.get(id))
            .cloned()
    }

    /// Names of every collection held in memory
    pub fn collections(&self) -> Vec<CollectionName> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = state.collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribe to change events
    pub fn watch(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Insert or replace an entity
    pub async fn put(&self, collection: &CollectionName, mut entity: Entity) -> SyncResult<()> {
        self.schemas.normalize(collection, &mut entity);
        self.apply(collection, |entities| {
            let id = entity.id.clone();
            entities.insert(id.clone(), entity);
            Some(CacheChange::Put(id))
        });
        self.persist(collection).await
    }

    /// Remove an entity; returns the removed copy
    pub async fn remove(
        &self,
        collection: &CollectionName,
        id: &EntityId,
    ) -> SyncResult<Option<Entity>> {
        let mut removed = None;
        self.apply(collection, |entities| {
            removed = entities.remove(id);
            removed.as_ref().map(|_| CacheChange::Removed(id.clone()))
        });
        if removed.is_some() {
            self.persist(collection).await?;
        }
        Ok(removed)
    }

    /// Replace the whole collection
    pub async fn replace_all(
        &self,
        collection: &CollectionName,
        entities: Vec<Entity>,
    ) -> SyncResult<()> {
        let mut replacement = CachedCollection::new();
        for mut entity in entities {
            self.schemas.normalize(collection, &mut entity);
            replacement.insert(entity.id.clone(), entity);
        }
        self.apply(collection, |current| {
            *current = replacement;
            Some(CacheChange::Replaced)
        });
        self.persist(collection).await
    }

    /// Re-key a provisional id and rewrite references to it in every collection
    ///
    /// Every entity whose references changed is announced with `Put`; the
    /// re-keyed entity itself with `Remapped`. Returns whether the entity
    /// itself was present.
    pub async fn remap(
        &self,
        collection: &CollectionName,
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<bool> {
        let mut touched = Vec::new();
        let found;
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let mut changes: Vec<(CollectionName, CacheChange)> = Vec::new();

            for (name, entities) in state.collections.iter_mut() {
                for entity in entities.values_mut() {
                    if !entity.rewrite_references(from, to) {
                        continue;
                    }
                    if !touched.contains(name) {
                        touched.push(name.clone());
                    }
                    if !(name == collection && &entity.id == from) {
                        changes.push((name.clone(), CacheChange::Put(entity.id.clone())));
                    }
                }
            }

            let entities = state.collections.entry(collection.clone()).or_default();
            found = match entities.remove(from) {
                Some(mut entity) => {
                    entity.id = to.clone();
                    entities.insert(to.clone(), entity);
                    true
                }
                None => false,
            };

            if found {
                if !touched.contains(collection) {
                    touched.push(collection.clone());
                }
                changes.push((
                    collection.clone(),
                    CacheChange::Remapped {
                        from: from.clone(),
                        to: to.clone(),
                    },
                ));
            }

            for (name, change) in changes {
                state.revision += 1;
                let event = CacheEvent {
                    revision: state.revision,
                    collection: name,
                    change,
                };
                let _ = self.events.send(event);
            }
        }

        if found {
            tracing::info!("[CACHE] Remapped {}/{} -> {}", collection, from, to);
        }
        for name in touched {
            self.persist(&name).await?;
        }
        Ok(found)
    }

    /// Mutate one collection in memory and announce the change
    fn apply<F>(&self, collection: &CollectionName, mutate: F)
    where
        F: FnOnce(&mut CachedCollection) -> Option<CacheChange>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let entities = state.collections.entry(collection.clone()).or_default();
        if let Some(change) = mutate(entities) {
            state.revision += 1;
            let event = CacheEvent {
                revision: state.revision,
                collection: collection.clone(),
                change,
            };
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Write the newest in-memory snapshot of a collection to disk
    async fn persist(&self, collection: &CollectionName) -> SyncResult<()> {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            Arc::clone(locks.entry(collection.clone()).or_default())
        };
        let _guard = lock.lock().await;

        let entities = self.get(collection);
        let stored = StoredCollection::V1 { entities };
        self.db
            .put_json(&collection_key(collection), &stored)
            .await
            .inspect_err(|e| tracing::error!("[CACHE] Failed to persist {}: {}", collection, e))
    }
}
