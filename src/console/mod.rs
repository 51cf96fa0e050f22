//! # Console Data Layer
//!
//! Offline-first data layer of the inventory console. [`Console`] wires the
//! components together and exposes the surface the UI talks to.
//!
//! ## Components
//!
//! - **Connectivity Monitor** (`sync::network_monitor`): debounced link status
//! - **Local Cache Store** (`cache`): the only read source for entity data
//! - **Pending Resource Coordinator** (`resources`): previews and uploads of
//!   selected files
//! - **Sync Queue & Flush Engine** (`offline::queue`, `sync::flush`): durable
//!   mutation queue and its replay
//! - **Optimistic Mutation Dispatcher** (`offline::optimistic`): the single
//!   write entry point
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stockpile::console::{Adapters, Console, Config};
//! use stockpile::console::offline::Mutation;
//! use stockpile::shared::Fields;
//!
//! # async fn example() -> stockpile::shared::SyncResult<()> {
//! let config = Config::load(None)?;
//! let adapters = Adapters::from_config(&config)?;
//! let mut console = Console::open(&config, adapters).await?;
//! console.start();
//!
//! let pending = console.mutate(&"inventory".into(), Mutation::create(Fields::new())).await?;
//! println!("{} items", console.use_entities(&"inventory".into()).len());
//! pending.confirmed().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod local_db;
pub mod offline;
pub mod remote;
pub mod resources;
pub mod sync;

pub use cache::{CacheChange, CacheEvent, CacheStore};
pub use config::Config;

use crate::console::local_db::LocalDatabase;
use crate::console::offline::{
    Mutation, MutationDispatcher, PendingMutation, RetryPolicy, SyncQueue, SyncQueueItem,
};
use crate::console::remote::{
    HttpProbe, HttpRemoteStore, HttpResourceHost, MemoryRemoteStore, MemoryResourceHost,
    RemoteStore, ResourceHost, UploadedResource,
};
use crate::console::resources::{
    HandleStats, PendingResource, ResourceCoordinator, ResourceSlot,
};
use crate::console::sync::{
    ConnectivityMonitor, ConnectivityState, FlushEngine, FlushReport, ReachabilityProbe,
    Subscription, SyncService, SyncState,
};
use crate::shared::config::ResourceSettings;
use crate::shared::{CollectionName, Entity, EntityId, SchemaRegistry, SyncResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// External services the data layer talks to
#[derive(Clone)]
pub struct Adapters {
    pub remote: Arc<dyn RemoteStore>,
    pub resources: Arc<dyn ResourceHost>,
    pub probe: Option<Arc<dyn ReachabilityProbe>>,
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters")
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

impl Adapters {
    /// In-process adapters with no probe
    pub fn in_memory() -> Self {
        Self {
            remote: Arc::new(MemoryRemoteStore::new()),
            resources: Arc::new(MemoryResourceHost::new()),
            probe: None,
        }
    }

    /// HTTP adapters, or in-process ones for a `memory:` remote URL
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        if config.uses_memory_remote() {
            tracing::info!("[CONSOLE] Using in-memory adapters");
            return Ok(Self::in_memory());
        }

        let token = config.api_token().map(str::to_string);
        let probe_timeout = config.monitor_config().poor_latency * 2;
        Ok(Self {
            remote: Arc::new(HttpRemoteStore::new(config.remote_url(), token.clone())?),
            resources: Arc::new(HttpResourceHost::new(config.resource_url(), token)?),
            probe: Some(Arc::new(HttpProbe::new(config.remote_url(), probe_timeout)?)),
        })
    }
}

/// The UI-facing surface of the data layer
pub struct Console {
    db: LocalDatabase,
    cache: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
    resources: Arc<ResourceCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    dispatcher: Arc<MutationDispatcher>,
    sync: SyncService,
    probe: Option<Arc<dyn ReachabilityProbe>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("connectivity", &self.monitor.status())
            .field("queued", &self.queue.len())
            .field("collections", &self.cache.collections())
            .field("sync", &self.sync)
            .finish()
    }
}

impl Console {
    /// Open the on-disk database named by `config`
    pub async fn open(config: &Config, adapters: Adapters) -> SyncResult<Self> {
        let db = LocalDatabase::open(&config.db_path()).await?;
        Self::with_database(db, config, adapters).await
    }

    /// Build every component on top of an open database
    pub async fn with_database(
        db: LocalDatabase,
        config: &Config,
        adapters: Adapters,
    ) -> SyncResult<Self> {
        Self::assemble(
            db,
            adapters,
            SchemaRegistry::builtin(),
            ConnectivityMonitor::new(config.monitor_config()),
            config.retry_policy(),
            config.resource_settings(),
            config.retry_interval(),
        )
        .await
    }

    /// Assemble with explicit parts
    pub async fn assemble(
        db: LocalDatabase,
        adapters: Adapters,
        schemas: SchemaRegistry,
        monitor: ConnectivityMonitor,
        policy: RetryPolicy,
        resource_settings: ResourceSettings,
        retry_interval: Duration,
    ) -> SyncResult<Self> {
        let cache = Arc::new(CacheStore::load(db.clone(), schemas).await?);
        let queue = Arc::new(SyncQueue::load(db.clone()).await?);
        let resources = Arc::new(ResourceCoordinator::new(
            db.clone(),
            adapters.resources,
            resource_settings,
        ));
        let monitor = Arc::new(monitor);

        let dispatcher = Arc::new(MutationDispatcher::new(
            cache.clone(),
            queue.clone(),
            resources.clone(),
            adapters.remote.clone(),
            monitor.clone(),
        ));
        let engine = Arc::new(FlushEngine::new(
            cache.clone(),
            queue.clone(),
            resources.clone(),
            adapters.remote.clone(),
            policy,
        ));
        let sync = SyncService::new(
            engine,
            monitor.clone(),
            cache.clone(),
            queue.clone(),
            adapters.remote,
            retry_interval,
        );

        tracing::info!(
            "[CONSOLE] Ready: {} collections cached, {} mutations queued",
            cache.collections().len(),
            queue.len()
        );

        Ok(Self {
            db,
            cache,
            queue,
            resources,
            monitor,
            dispatcher,
            sync,
            probe: adapters.probe,
        })
    }

    /// Start background flushing and probing
    pub fn start(&mut self) {
        self.sync.start(self.probe.clone());
    }

    pub fn stop(&mut self) {
        self.sync.stop();
    }

    /// Stop background work and close the database
    pub async fn shutdown(mut self) {
        self.sync.stop();
        self.db.close().await;
    }

    /// Entities of a collection as the UI should show them
    pub fn use_entities(&self, collection: &CollectionName) -> Vec<Entity> {
        self.cache.get(collection)
    }

    pub fn entity(&self, collection: &CollectionName, id: &EntityId) -> Option<Entity> {
        self.cache.get_entity(collection, id)
    }

    /// Change events of the cache
    pub fn watch_cache(&self) -> broadcast::Receiver<CacheEvent> {
        self.cache.watch()
    }

    /// Create, update or delete an entity
    pub async fn mutate(
        &self,
        collection: &CollectionName,
        mutation: Mutation,
    ) -> SyncResult<PendingMutation> {
        self.dispatcher.mutate(collection, mutation).await
    }

    /// Track a picked file; returns at once with a live preview handle
    pub fn select_resource(
        &self,
        bytes: Bytes,
        content_type: &str,
        owner: EntityId,
        slot: ResourceSlot,
    ) -> PendingResource {
        self.resources.select(bytes, content_type, owner, slot)
    }

    /// Track a picked file that replaces an uploaded one
    pub fn select_replacement_resource(
        &self,
        bytes: Bytes,
        content_type: &str,
        owner: EntityId,
        slot: ResourceSlot,
        existing_remote_id: &str,
    ) -> PendingResource {
        self.resources
            .select_replacing(bytes, content_type, owner, slot, existing_remote_id)
    }

    /// Cancel a picked file; idempotent
    pub fn discard_resource(&self, resource_id: &str) -> bool {
        self.resources.discard(resource_id)
    }

    /// Upload a picked file now
    pub async fn commit_resource(&self, resource_id: &str) -> SyncResult<UploadedResource> {
        self.resources.commit(resource_id).await
    }

    pub fn pending_resources(&self, owner: &EntityId) -> Vec<PendingResource> {
        self.resources.pending_for(owner)
    }

    /// Bytes behind a preview handle
    pub fn preview(&self, handle: &str) -> Option<Bytes> {
        self.resources.preview(handle)
    }

    pub fn preview_stats(&self) -> HandleStats {
        self.resources.handle_stats()
    }

    /// Queued mutations, failed ones included
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.status()
    }

    pub fn subscribe_connectivity<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        self.monitor.subscribe(callback)
    }

    /// Forward a platform online/offline event
    pub fn set_link_up(&self, up: bool) {
        self.monitor.set_link_up(up);
    }

    /// The connectivity monitor, for feeding probe results or ticks directly
    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Replay the queue now
    pub async fn flush(&self) -> FlushReport {
        self.sync.flush().await
    }

    pub async fn status(&self) -> SyncState {
        self.sync.status().await
    }

    /// Items waiting for a manual retry or discard
    pub fn failed_items(&self) -> Vec<SyncQueueItem> {
        self.queue.failed_items()
    }

    /// Give a failed item a fresh attempt budget; the next flush replays it
    pub async fn retry_item(&self, sequence: u64) -> SyncResult<()> {
        self.queue.retry(sequence).await
    }

    /// Drop a queued item and, when online, reload its collection so the
    /// cache stops showing the abandoned edit
    pub async fn discard_item(&self, sequence: u64) -> SyncResult<SyncQueueItem> {
        let item = self.queue.discard(sequence).await?;
        if self.monitor.status().is_stable() {
            if let Err(e) = self.sync.reload_collection(&item.collection).await {
                tracing::warn!("[CONSOLE] Reload after discard failed: {}", e);
            }
        }
        Ok(item)
    }

    /// Replace a collection with the remote copy, keeping queued edits
    pub async fn reload_collection(&self, collection: &CollectionName) -> SyncResult<usize> {
        self.sync.reload_collection(collection).await
    }
}
