//! # Sync Queue
//!
//! Ordered, persisted list of mutations that still have to reach the remote
//! store. Items are totally ordered by `sequence` and survive process
//! restarts; an item leaves the queue only after the remote confirmed it or a
//! human discarded it.
//!
//! ## Compaction
//!
//! Before a flush replays anything, redundant items are collapsed per entity:
//!
//! - consecutive `Update`s merge into one carrying the latest values, under
//!   the earliest item's sequence
//! - `Update`s directly before a `Delete` are dropped
//! - a never-attempted `Create` followed by `Delete` vanishes together with
//!   the `Delete` (the entity never existed remotely)
//!
//! `Create` and `Delete` are otherwise never removed, and failed items act as
//! barriers that nothing merges across.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stockpile::console::local_db::LocalDatabase;
//! use stockpile::console::offline::queue::{OpKind, SyncQueue};
//! use stockpile::shared::Fields;
//!
//! # async fn example() -> stockpile::shared::SyncResult<()> {
//! let queue = SyncQueue::load(LocalDatabase::in_memory().await?).await?;
//! let sequence = queue
//!     .enqueue(OpKind::Update, "inventory".into(), "item-1".into(), Fields::new())
//!     .await?;
//! assert_eq!(queue.len(), 1);
//! queue.remove(sequence).await?;
//! # Ok(())
//! # }
//! ```

use crate::console::local_db::{LocalDatabase, QUEUE_KEY};
use crate::console::offline::retry::{RetryDecision, RetryPolicy};
use crate::console::resources::collect_local_refs;
use crate::shared::entity::rewrite_references_in_fields;
use crate::shared::{CollectionName, EntityId, Fields, SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// Replay status of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Will be replayed by the next flush once due
    Pending,
    /// Needs a manual retry or discard
    Failed,
}

/// One queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Monotonic position in the queue
    pub sequence: u64,
    pub op: OpKind,
    pub collection: CollectionName,
    pub entity_id: EntityId,
    /// Full entity fields for `Create`, changed fields for `Update`, empty for `Delete`
    #[serde(default)]
    pub payload: Fields,
    pub created_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempts: u32,
    pub status: ItemStatus,
    pub last_error: Option<String>,
    /// Earliest time the next replay may happen
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    fn targets(&self, collection: &CollectionName, id: &EntityId) -> bool {
        &self.collection == collection && &self.entity_id == id
    }

    fn is_mergeable_update(&self) -> bool {
        self.op == OpKind::Update && self.status == ItemStatus::Pending
    }

    /// Whether a flush may replay this item at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Outcome of recording a failed replay
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Still pending; replay again at the given time
    Retrying { next_attempt_at: DateTime<Utc> },
    /// Marked failed; surfaced to the user
    Failed(SyncError),
}

/// Persisted queue envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StoredQueue {
    #[serde(rename = "v1")]
    V1 {
        next_sequence: u64,
        items: Vec<SyncQueueItem>,
    },
}

#[derive(Debug)]
struct QueueState {
    next_sequence: u64,
    /// Sorted by sequence
    items: Vec<SyncQueueItem>,
    /// Provisional ids retired this session
    aliases: HashMap<(CollectionName, EntityId), EntityId>,
}

/// Durable mutation queue
#[derive(Debug)]
pub struct SyncQueue {
    db: LocalDatabase,
    state: Mutex<QueueState>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl SyncQueue {
    /// Load the persisted queue, or start an empty one
    pub async fn load(db: LocalDatabase) -> SyncResult<Self> {
        let (next_sequence, mut items) = match db.get_json::<StoredQueue>(QUEUE_KEY).await? {
            Some(StoredQueue::V1 {
                next_sequence,
                items,
            }) => (next_sequence, items),
            None => (1, Vec::new()),
        };
        items.sort_by_key(|item| item.sequence);
        if !items.is_empty() {
            tracing::info!("[QUEUE] Restored {} queued mutations", items.len());
        }

        Ok(Self {
            db,
            state: Mutex::new(QueueState {
                next_sequence,
                items,
                aliases: HashMap::new(),
            }),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Append a mutation; never touches the network
    pub async fn enqueue(
        &self,
        op: OpKind,
        collection: CollectionName,
        entity_id: EntityId,
        payload: Fields,
    ) -> SyncResult<u64> {
        self.push(op, collection, entity_id, payload, None).await
    }

    /// Append a mutation whose direct write already failed once
    ///
    /// The item starts with one attempt spent, so compaction never treats it
    /// as unsent: the remote may have applied the write before the error.
    pub async fn enqueue_attempted(
        &self,
        op: OpKind,
        collection: CollectionName,
        entity_id: EntityId,
        payload: Fields,
        error: &SyncError,
    ) -> SyncResult<u64> {
        self.push(op, collection, entity_id, payload, Some(error))
            .await
    }

    async fn push(
        &self,
        op: OpKind,
        collection: CollectionName,
        entity_id: EntityId,
        payload: Fields,
        attempted: Option<&SyncError>,
    ) -> SyncResult<u64> {
        let sequence = {
            let mut state = self.lock();
            let entity_id = state
                .aliases
                .get(&(collection.clone(), entity_id.clone()))
                .cloned()
                .unwrap_or(entity_id);
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            tracing::debug!("[QUEUE] Enqueued #{} {:?} {}/{}", sequence, op, collection, entity_id);
            state.items.push(SyncQueueItem {
                sequence,
                op,
                collection,
                entity_id,
                payload,
                created_at: Utc::now(),
                attempts: u32::from(attempted.is_some()),
                status: ItemStatus::Pending,
                last_error: attempted.map(ToString::to_string),
                next_attempt_at: None,
            });
            sequence
        };
        self.persist().await?;
        Ok(sequence)
    }

    /// Current id of an entity whose provisional id may have been retired
    pub fn resolve_id(&self, collection: &CollectionName, id: &EntityId) -> EntityId {
        self.lock()
            .aliases
            .get(&(collection.clone(), id.clone()))
            .cloned()
            .unwrap_or_else(|| id.clone())
    }

    /// Record that a provisional id was replaced outside a flush
    pub fn register_alias(&self, collection: &CollectionName, from: &EntityId, to: &EntityId) {
        self.lock()
            .aliases
            .insert((collection.clone(), from.clone()), to.clone());
    }

    /// Snapshot of every queued item in sequence order
    pub fn items(&self) -> Vec<SyncQueueItem> {
        self.lock().items.clone()
    }

    pub fn get(&self, sequence: u64) -> Option<SyncQueueItem> {
        self.lock()
            .items
            .iter()
            .find(|item| item.sequence == sequence)
            .cloned()
    }

    /// Number of queued items, failed ones included
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items waiting for manual resolution
    pub fn failed_items(&self) -> Vec<SyncQueueItem> {
        self.lock()
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .cloned()
            .collect()
    }

    /// Whether any item still targets the entity
    pub fn has_items_for(&self, collection: &CollectionName, id: &EntityId) -> bool {
        self.lock()
            .items
            .iter()
            .any(|item| item.targets(collection, id))
    }

    /// Resource ids behind local refs in any queued payload
    pub fn referenced_resources(&self) -> HashSet<String> {
        self.lock()
            .items
            .iter()
            .flat_map(|item| collect_local_refs(&item.payload))
            .collect()
    }

    /// Fields touched by pending updates of the entity queued after `sequence`
    pub fn later_update_fields(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        sequence: u64,
    ) -> HashSet<String> {
        self.lock()
            .items
            .iter()
            .filter(|item| item.sequence > sequence && item.targets(collection, id))
            .filter(|item| item.op == OpKind::Update)
            .flat_map(|item| item.payload.keys().cloned())
            .collect()
    }

    /// Collapse redundant items; returns how many were removed
    pub async fn compact(&self) -> SyncResult<usize> {
        let removed = {
            let mut state = self.lock();
            let items = std::mem::take(&mut state.items);
            let (compacted, removed) = compact_items(items);
            state.items = compacted;
            removed
        };
        if removed > 0 {
            tracing::info!("[QUEUE] Compaction removed {} items", removed);
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Drop a confirmed (or discarded) item
    pub async fn remove(&self, sequence: u64) -> SyncResult<Option<SyncQueueItem>> {
        let removed = {
            let mut state = self.lock();
            let position = state.items.iter().position(|item| item.sequence == sequence);
            position.map(|index| state.items.remove(index))
        };
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Manual "discard" affordance for a stuck item
    pub async fn discard(&self, sequence: u64) -> SyncResult<SyncQueueItem> {
        let item = self
            .remove(sequence)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("queue item {}", sequence)))?;
        tracing::warn!("[QUEUE] Discarded #{} {:?} {}/{}", sequence, item.op, item.collection, item.entity_id);
        Ok(item)
    }

    /// Manual "retry" affordance: reset a failed item to pending
    pub async fn retry(&self, sequence: u64) -> SyncResult<()> {
        {
            let mut state = self.lock();
            let item = state
                .items
                .iter_mut()
                .find(|item| item.sequence == sequence)
                .ok_or_else(|| SyncError::not_found(format!("queue item {}", sequence)))?;
            item.status = ItemStatus::Pending;
            item.attempts = 0;
            item.next_attempt_at = None;
            item.last_error = None;
        }
        self.persist().await
    }

    /// Record a failed replay and decide the item's fate
    pub async fn record_failure(
        &self,
        sequence: u64,
        error: &SyncError,
        policy: &RetryPolicy,
    ) -> SyncResult<FailureOutcome> {
        let outcome = {
            let mut state = self.lock();
            let item = state
                .items
                .iter_mut()
                .find(|item| item.sequence == sequence)
                .ok_or_else(|| SyncError::not_found(format!("queue item {}", sequence)))?;

            item.attempts += 1;
            item.last_error = Some(error.to_string());

            let decision = if error.is_retryable() {
                policy.decide(item.attempts)
            } else {
                RetryDecision::GiveUp
            };

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    item.next_attempt_at = Some(next_attempt_at);
                    FailureOutcome::Retrying { next_attempt_at }
                }
                RetryDecision::GiveUp => {
                    item.status = ItemStatus::Failed;
                    item.next_attempt_at = None;
                    let surfaced = if error.is_retryable() {
                        SyncError::QueueExhausted {
                            sequence,
                            attempts: item.attempts,
                        }
                    } else {
                        error.clone()
                    };
                    FailureOutcome::Failed(surfaced)
                }
            }
        };
        self.persist().await?;
        Ok(outcome)
    }

    /// Replace an item's payload in place
    pub async fn replace_payload(&self, sequence: u64, payload: Fields) -> SyncResult<()> {
        {
            let mut state = self.lock();
            let item = state
                .items
                .iter_mut()
                .find(|item| item.sequence == sequence)
                .ok_or_else(|| SyncError::not_found(format!("queue item {}", sequence)))?;
            item.payload = payload;
        }
        self.persist().await
    }

    /// Rewrite a remapped provisional id in every queued item
    ///
    /// Items targeting the entity get the new id; payload values that refer to
    /// it (in any collection) are rewritten too. Returns the number of items
    /// changed.
    pub async fn rewrite_entity_id(
        &self,
        collection: &CollectionName,
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<usize> {
        let changed = {
            let mut state = self.lock();
            let mut changed = 0;
            for item in state.items.iter_mut() {
                let mut touched = false;
                if item.targets(collection, from) {
                    item.entity_id = to.clone();
                    touched = true;
                }
                touched |= rewrite_references_in_fields(&mut item.payload, from, to);
                if touched {
                    changed += 1;
                }
            }
            changed
        };
        if changed > 0 {
            self.persist().await?;
        }
        Ok(changed)
    }

    /// Remove a confirmed `Create` whose entity got a remote id, rewriting
    /// every other item in the same persist
    ///
    /// Returns the number of other items changed.
    pub async fn confirm_create(&self, sequence: u64, remote_id: &EntityId) -> SyncResult<usize> {
        let changed = {
            let mut state = self.lock();
            let position = state
                .items
                .iter()
                .position(|item| item.sequence == sequence)
                .ok_or_else(|| SyncError::not_found(format!("queue item {}", sequence)))?;
            let confirmed = state.items.remove(position);
            let from = confirmed.entity_id;

            let mut changed = 0;
            for item in state.items.iter_mut() {
                let mut touched = false;
                if item.targets(&confirmed.collection, &from) {
                    item.entity_id = remote_id.clone();
                    touched = true;
                }
                touched |= rewrite_references_in_fields(&mut item.payload, &from, remote_id);
                if touched {
                    changed += 1;
                }
            }
            state
                .aliases
                .insert((confirmed.collection, from), remote_id.clone());
            changed
        };
        self.persist().await?;
        Ok(changed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the newest in-memory queue to disk
    async fn persist(&self) -> SyncResult<()> {
        let _guard = self.persist_lock.lock().await;
        let stored = {
            let state = self.lock();
            StoredQueue::V1 {
                next_sequence: state.next_sequence,
                items: state.items.clone(),
            }
        };
        self.db
            .put_json(QUEUE_KEY, &stored)
            .await
            .inspect_err(|e| tracing::error!("[QUEUE] Failed to persist queue: {}", e))
    }
}

/// Compact a sequence-ordered item list; returns the survivors and the number removed
pub fn compact_items(items: Vec<SyncQueueItem>) -> (Vec<SyncQueueItem>, usize) {
    let total = items.len();

    let mut groups: HashMap<(CollectionName, EntityId), Vec<SyncQueueItem>> = HashMap::new();
    for item in items {
        groups
            .entry((item.collection.clone(), item.entity_id.clone()))
            .or_default()
            .push(item);
    }

    let mut survivors = Vec::with_capacity(total);
    for (_, group) in groups {
        survivors.extend(compact_group(group));
    }
    survivors.sort_by_key(|item| item.sequence);

    let removed = total - survivors.len();
    (survivors, removed)
}

/// Compact the items of one entity (already in sequence order)
fn compact_group(group: Vec<SyncQueueItem>) -> Vec<SyncQueueItem> {
    let mut out: Vec<SyncQueueItem> = Vec::with_capacity(group.len());

    for item in group {
        if item.status == ItemStatus::Failed {
            out.push(item);
            continue;
        }

        match item.op {
            OpKind::Update => match out.last_mut() {
                Some(previous) if previous.is_mergeable_update() => {
                    for (key, value) in item.payload {
                        previous.payload.insert(key, value);
                    }
                }
                _ => out.push(item),
            },
            OpKind::Delete => {
                while out.last().is_some_and(SyncQueueItem::is_mergeable_update) {
                    out.pop();
                }
                let never_sent = out.last().is_some_and(|previous| {
                    previous.op == OpKind::Create
                        && previous.status == ItemStatus::Pending
                        && previous.attempts == 0
                });
                if never_sent {
                    out.pop();
                } else {
                    out.push(item);
                }
            }
            OpKind::Create => out.push(item),
        }
    }

    out
}
