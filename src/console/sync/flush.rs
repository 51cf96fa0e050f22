//! # Flush Engine
//!
//! Replays the sync queue against the remote store.
//!
//! ## Flush sequence
//!
//! 1. Compact the queue and prune resource payloads nothing references.
//! 2. Split the queue into one lane per collection. Lanes run concurrently;
//!    items inside a lane are replayed one at a time in sequence order.
//! 3. Per item: upload the resources behind its local refs and store the
//!    uploaded URLs in the item (only then are the persisted bytes dropped),
//!    send the write, then dequeue it and reconcile the cache with the
//!    confirmed payload.
//!
//! Only one flush runs at a time. A flush requested while another is active
//! waits for the active one and gets its report.
//!
//! ## Failures
//!
//! A failed item stays queued with one more attempt and a backoff deadline.
//! Rejections and spent attempt budgets mark it failed until the user retries
//! or discards it. Either way, later items of the same entity are skipped for
//! the rest of the flush.

use crate::console::cache::CacheStore;
use crate::console::offline::queue::{FailureOutcome, ItemStatus, OpKind, SyncQueue, SyncQueueItem};
use crate::console::offline::retry::RetryPolicy;
use crate::console::remote::RemoteStore;
use crate::console::resources::{collect_local_refs, replace_local_refs, ResourceCoordinator};
use crate::console::sync::sync_state::FlushReport;
use crate::shared::{CollectionName, Entity, EntityId, Fields, SyncResult};
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

type ActiveFlush = Shared<BoxFuture<'static, FlushReport>>;

/// Remote write confirmed for one item
struct Confirmed {
    entity_id: EntityId,
    payload: Fields,
    remapped_from: Option<EntityId>,
}

struct FlushContext {
    cache: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
    resources: Arc<ResourceCoordinator>,
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
}

/// Queue replayer with a reentrancy guard
pub struct FlushEngine {
    context: Arc<FlushContext>,
    active: Arc<Mutex<Option<ActiveFlush>>>,
}

impl std::fmt::Debug for FlushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushEngine")
            .field("active", &self.is_active())
            .field("policy", &self.context.policy)
            .finish()
    }
}

impl FlushEngine {
    pub fn new(
        cache: Arc<CacheStore>,
        queue: Arc<SyncQueue>,
        resources: Arc<ResourceCoordinator>,
        remote: Arc<dyn RemoteStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            context: Arc::new(FlushContext {
                cache,
                queue,
                resources,
                remote,
                policy,
            }),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a flush is running
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replay the queue, or join the flush already in progress
    pub async fn flush(&self) -> FlushReport {
        let active = {
            let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(active) => {
                    tracing::debug!("[FLUSH] Flush already running, joining it");
                    active.clone()
                }
                None => {
                    let context = Arc::clone(&self.context);
                    let guard = Arc::clone(&self.active);
                    let task = tokio::spawn(async move {
                        let report = context.run().await;
                        *guard.lock().unwrap_or_else(PoisonError::into_inner) = None;
                        report
                    });
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            tracing::error!("[FLUSH] Flush task ended abnormally: {}", e);
                            FlushReport::default()
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };
        active.await
    }
}

impl FlushContext {
    async fn run(&self) -> FlushReport {
        let mut report = FlushReport::default();

        match self.queue.compact().await {
            Ok(removed) => report.compacted = removed,
            Err(e) => tracing::error!("[FLUSH] Compaction could not be persisted: {}", e),
        }

        let items = self.queue.items();
        let referenced = self.queue.referenced_resources();
        if let Err(e) = self.resources.prune_persisted(&referenced).await {
            tracing::warn!("[FLUSH] Failed to prune resource payloads: {}", e);
        }

        if items.is_empty() {
            return report;
        }

        let mut lanes: BTreeMap<CollectionName, Vec<u64>> = BTreeMap::new();
        for item in &items {
            lanes
                .entry(item.collection.clone())
                .or_default()
                .push(item.sequence);
        }

        tracing::info!(
            "[FLUSH] Replaying {} items across {} collections",
            items.len(),
            lanes.len()
        );

        let now = Utc::now();
        let lane_reports = join_all(
            lanes
                .into_iter()
                .map(|(collection, sequences)| self.run_lane(collection, sequences, now)),
        )
        .await;
        for lane in &lane_reports {
            report.merge(lane);
        }

        tracing::info!(
            "[FLUSH] Done: {} ok, {} retrying, {} failed, {} deferred, {} blocked",
            report.succeeded,
            report.retrying,
            report.failed,
            report.deferred,
            report.blocked
        );
        report
    }

    async fn run_lane(
        &self,
        collection: CollectionName,
        sequences: Vec<u64>,
        now: DateTime<Utc>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        let mut held: HashSet<EntityId> = HashSet::new();

        for sequence in sequences {
            // Re-read: earlier items may have rewritten this one
            let Some(item) = self.queue.get(sequence) else {
                continue;
            };
            if held.contains(&item.entity_id) {
                report.blocked += 1;
                continue;
            }
            if item.status == ItemStatus::Failed {
                held.insert(item.entity_id.clone());
                continue;
            }
            if !item.is_due(now) {
                report.deferred += 1;
                held.insert(item.entity_id.clone());
                continue;
            }

            report.attempted += 1;
            match self.send(&item, &mut report).await {
                Ok(confirmed) => {
                    report.succeeded += 1;
                    if confirmed.remapped_from.is_some() {
                        report.remapped += 1;
                    }
                    if let Err(e) = self.confirm(&item, confirmed).await {
                        tracing::error!(
                            "[FLUSH] #{} was accepted remotely but local bookkeeping failed: {}",
                            sequence,
                            e
                        );
                    }
                }
                Err(e) => {
                    held.insert(item.entity_id.clone());
                    match self.queue.record_failure(sequence, &e, &self.policy).await {
                        Ok(FailureOutcome::Retrying { next_attempt_at }) => {
                            report.retrying += 1;
                            tracing::warn!(
                                "[FLUSH] #{} {}/{} failed, retrying after {}: {}",
                                sequence,
                                collection,
                                item.entity_id,
                                next_attempt_at,
                                e
                            );
                        }
                        Ok(FailureOutcome::Failed(surfaced)) => {
                            report.failed += 1;
                            tracing::error!(
                                "[FLUSH] #{} {}/{} needs attention: {}",
                                sequence,
                                collection,
                                item.entity_id,
                                surfaced
                            );
                            report.failures.push((sequence, surfaced));
                        }
                        Err(store) => {
                            tracing::error!("[FLUSH] Could not record failure of #{}: {}", sequence, store);
                        }
                    }
                }
            }
        }

        report
    }

    /// Upload pending resources and send the write
    async fn send(&self, item: &SyncQueueItem, report: &mut FlushReport) -> SyncResult<Confirmed> {
        let mut payload = item.payload.clone();

        let local_refs = collect_local_refs(&payload);
        if !local_refs.is_empty() {
            let mut uploaded = HashMap::new();
            let mut first_error = None;
            for (resource_id, result) in self.resources.commit_all(&local_refs).await {
                match result {
                    Ok(resource) => {
                        uploaded.insert(resource_id, resource.url);
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            report.uploaded += uploaded.len();

            if !uploaded.is_empty() {
                replace_local_refs(&mut payload, &uploaded);
                self.queue.replace_payload(item.sequence, payload.clone()).await?;
                let ids: Vec<String> = uploaded.into_keys().collect();
                self.resources
                    .release_unreferenced(&ids, &self.queue.referenced_resources())
                    .await;
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let collection = &item.collection;
        match item.op {
            OpKind::Create => {
                let entity = Entity::new(item.entity_id.clone(), payload.clone());
                let remote_id = self.remote.create(collection, &entity).await?;
                let remapped_from = (remote_id != item.entity_id).then(|| item.entity_id.clone());
                Ok(Confirmed {
                    entity_id: remote_id,
                    payload,
                    remapped_from,
                })
            }
            OpKind::Update => {
                self.remote.update(collection, &item.entity_id, &payload).await?;
                Ok(Confirmed {
                    entity_id: item.entity_id.clone(),
                    payload,
                    remapped_from: None,
                })
            }
            OpKind::Delete => {
                self.remote.delete(collection, &item.entity_id).await?;
                Ok(Confirmed {
                    entity_id: item.entity_id.clone(),
                    payload,
                    remapped_from: None,
                })
            }
        }
    }

    /// Dequeue a confirmed item and reconcile the cache
    async fn confirm(&self, item: &SyncQueueItem, confirmed: Confirmed) -> SyncResult<()> {
        let collection = &item.collection;

        if let Some(provisional) = &confirmed.remapped_from {
            tracing::info!(
                "[FLUSH] {}/{} is now {}",
                collection,
                provisional,
                confirmed.entity_id
            );
            self.cache
                .remap(collection, provisional, &confirmed.entity_id)
                .await?;
            self.resources
                .reassign_owner(provisional, &confirmed.entity_id);
            self.queue
                .confirm_create(item.sequence, &confirmed.entity_id)
                .await?;
        } else {
            self.queue.remove(item.sequence).await?;
        }

        if item.op == OpKind::Delete {
            self.cache.remove(collection, &confirmed.entity_id).await?;
            return Ok(());
        }

        let superseded =
            self.queue
                .later_update_fields(collection, &confirmed.entity_id, item.sequence);
        match self.cache.get_entity(collection, &confirmed.entity_id) {
            Some(mut entity) => {
                let mut changed = false;
                for (key, value) in confirmed.payload {
                    if superseded.contains(&key) || entity.fields.get(&key) == Some(&value) {
                        continue;
                    }
                    entity.fields.insert(key, value);
                    changed = true;
                }
                if changed {
                    self.cache.put(collection, entity).await?;
                }
            }
            None if !self.queue.has_items_for(collection, &confirmed.entity_id) => {
                if item.op == OpKind::Create {
                    let entity = Entity::new(confirmed.entity_id.clone(), confirmed.payload);
                    self.cache.put(collection, entity).await?;
                }
            }
            None => {}
        }
        Ok(())
    }
}
