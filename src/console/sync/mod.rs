//! # Background Sync Service
//!
//! Decides when the queue is flushed.
//!
//! ## Triggers
//!
//! - a connectivity transition into `Stable` (never `Unstable` or `Poor`, so
//!   a flaky link does not burn attempt budgets)
//! - a periodic retry tick while `Stable` and the queue is not empty, which
//!   picks up items whose backoff has elapsed
//! - a manual `flush` from the UI
//!
//! The service also reloads collections from the remote store, re-applying
//! queued local edits on top so a reload never clobbers them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use stockpile::console::sync::SyncService;
//! # async fn example(mut service: SyncService) {
//! service.start(None);
//! let report = service.flush().await;
//! println!("{} items synced", report.succeeded);
//! service.stop();
//! # }
//! ```

pub mod flush;
pub mod network_monitor;
pub mod sync_state;

pub use flush::FlushEngine;
pub use network_monitor::{
    ConnectivityMonitor, ConnectivityState, MonitorConfig, ReachabilityProbe, Subscription,
};
pub use sync_state::{FlushReport, SyncState};

use crate::console::cache::CacheStore;
use crate::console::offline::queue::{OpKind, SyncQueue};
use crate::console::remote::RemoteStore;
use crate::console::resources::strip_local_refs;
use crate::shared::{CollectionName, Entity, SyncResult};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Flushes and records the outcome in the shared state
#[derive(Debug)]
struct SyncWorker {
    engine: Arc<FlushEngine>,
    queue: Arc<SyncQueue>,
    state: Arc<RwLock<SyncState>>,
}

impl SyncWorker {
    async fn flush(&self) -> FlushReport {
        self.state.write().await.is_flushing = true;
        let report = self.engine.flush().await;

        let mut state = self.state.write().await;
        state.is_flushing = false;
        state.last_flush = Some(Utc::now());
        state.last_report = Some(report.clone());
        state.pending_operations = self.queue.len();
        state.failed_operations = self.queue.failed_items().len();
        report
    }
}

/// Connectivity-driven flush coordinator
pub struct SyncService {
    worker: Arc<SyncWorker>,
    monitor: Arc<ConnectivityMonitor>,
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    retry_interval: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("running", &self.is_running())
            .field("engine", &self.worker.engine)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl SyncService {
    pub fn new(
        engine: Arc<FlushEngine>,
        monitor: Arc<ConnectivityMonitor>,
        cache: Arc<CacheStore>,
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteStore>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            worker: Arc::new(SyncWorker {
                engine,
                queue,
                state: Arc::new(RwLock::new(SyncState::default())),
            }),
            monitor,
            cache,
            remote,
            retry_interval,
            tasks: Vec::new(),
        }
    }

    /// Start the trigger loop, and the monitor's probe loop when a probe is given
    pub fn start(&mut self, probe: Option<Arc<dyn ReachabilityProbe>>) {
        if !self.tasks.is_empty() {
            tracing::warn!("[SYNC] Sync service is already running");
            return;
        }

        self.tasks.push(self.monitor.spawn(probe));

        let worker = Arc::clone(&self.worker);
        let mut status_rx = self.monitor.watch();
        let retry_interval = self.retry_interval.max(Duration::from_millis(100));

        self.tasks.push(tokio::spawn(async move {
            let mut last = *status_rx.borrow_and_update();
            let mut retry = tokio::time::interval(retry_interval);
            retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            retry.tick().await;

            if last.is_stable() && !worker.queue.is_empty() {
                worker.flush().await;
            }

            loop {
                tokio::select! {
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *status_rx.borrow_and_update();
                        let entered_stable = status.is_stable() && !last.is_stable();
                        last = status;
                        worker.state.write().await.connectivity = status;

                        if entered_stable {
                            tracing::info!("[SYNC] Connectivity stable, flushing {} queued items", worker.queue.len());
                            worker.flush().await;
                        }
                    }
                    _ = retry.tick() => {
                        if last.is_stable() && !worker.queue.is_empty() {
                            worker.flush().await;
                        }
                    }
                }
            }
        }));
        tracing::info!("[SYNC] Sync service started");
    }

    /// Stop background tasks
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Manual flush
    pub async fn flush(&self) -> FlushReport {
        self.worker.flush().await
    }

    /// Current sync status
    pub async fn status(&self) -> SyncState {
        let mut state = self.worker.state.read().await.clone();
        state.pending_operations = self.worker.queue.len();
        state.failed_operations = self.worker.queue.failed_items().len();
        state.connectivity = self.monitor.status();
        state
    }

    /// Replace a collection with the remote copy plus every queued local edit
    ///
    /// Returns the number of entities now cached.
    pub async fn reload_collection(&self, collection: &CollectionName) -> SyncResult<usize> {
        let remote_entities = self.remote.list(collection).await?;
        let fetched = remote_entities.len();

        let mut merged: BTreeMap<_, Entity> = remote_entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();

        let mut reapplied = 0;
        for item in self.worker.queue.items() {
            if &item.collection != collection {
                continue;
            }
            reapplied += 1;
            let mut payload = item.payload;
            let previous = merged.get(&item.entity_id).map(|entity| entity.fields.clone());
            strip_local_refs(&mut payload, previous.as_ref());

            match item.op {
                OpKind::Create => {
                    merged
                        .entry(item.entity_id.clone())
                        .and_modify(|entity| entity.apply_patch(&payload))
                        .or_insert_with(|| Entity::new(item.entity_id.clone(), payload.clone()));
                }
                OpKind::Update => {
                    if let Some(entity) = merged.get_mut(&item.entity_id) {
                        entity.apply_patch(&payload);
                    }
                }
                OpKind::Delete => {
                    merged.remove(&item.entity_id);
                }
            }
        }

        let entities: Vec<Entity> = merged.into_values().collect();
        let count = entities.len();
        self.cache.replace_all(collection, entities).await?;
        tracing::info!(
            "[SYNC] Reloaded {}: {} remote, {} queued edits re-applied",
            collection,
            fetched,
            reapplied
        );
        Ok(count)
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.stop();
    }
}
