//! # Pending Resource Coordinator
//!
//! Tracks files the user picked before the owning entity is committed.
//!
//! - `select` allocates a preview handle and returns at once; the cache is
//!   not touched
//! - `discard` releases the preview handle; discarding twice is a no-op
//! - `commit` compresses and uploads the bytes, then releases the preview
//!   handle exactly once whether the upload succeeded or not
//! - `commit_all` uploads several resources with bounded concurrency and
//!   reports each outcome separately
//!
//! Mutation payloads reference a selected resource through its local ref
//! (`local://<resource id>`). The bytes behind a mutation's local refs are
//! persisted before the mutation returns, so the upload can still happen at
//! flush time after the UI discarded the resource or the process restarted.
//! Persisted bytes outlive a successful upload until the uploaded URL is
//! stored wherever the local ref was; `release_unreferenced` then drops them.

pub mod compress;
pub mod preview;

pub use preview::{HandleStats, PreviewRegistry, PREVIEW_SCHEME};

use crate::console::local_db::{
    resource_key, resource_meta_key, LocalDatabase, RESOURCE_META_PREFIX, RESOURCE_PREFIX,
};
use crate::console::remote::{ResourceHost, UploadedResource};
use crate::shared::config::ResourceSettings;
use crate::shared::{EntityId, Fields, SyncError, SyncResult};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// URL scheme of local resource references in payloads
pub const LOCAL_REF_SCHEME: &str = "local://";

/// Local reference for a resource id
pub fn local_ref(resource_id: &str) -> String {
    format!("{}{}", LOCAL_REF_SCHEME, resource_id)
}

/// Resource id behind a local reference
pub fn parse_local_ref(value: &str) -> Option<&str> {
    value
        .strip_prefix(LOCAL_REF_SCHEME)
        .filter(|id| !id.is_empty())
}

/// Where a resource lands on its owning entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub field: String,
    /// Position in a list field; `None` for a single-valued field
    pub index: Option<usize>,
}

impl ResourceSlot {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            field: name.into(),
            index: None,
        }
    }

    pub fn indexed(name: impl Into<String>, index: usize) -> Self {
        Self {
            field: name.into(),
            index: Some(index),
        }
    }

    /// Write `value` into the slot of `fields`
    pub fn place(&self, fields: &mut Fields, value: Value) {
        match self.index {
            None => {
                fields.insert(self.field.clone(), value);
            }
            Some(index) => {
                let entry = fields
                    .entry(self.field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !entry.is_array() {
                    *entry = Value::Array(Vec::new());
                }
                if let Value::Array(items) = entry {
                    if index < items.len() {
                        items[index] = value;
                    } else {
                        items.push(value);
                    }
                }
            }
        }
    }
}

/// Lifecycle of a pending resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Selected,
    Uploading,
    Uploaded,
    Failed,
}

/// A user-selected file awaiting upload
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResource {
    pub id: String,
    /// Reference to put in mutation payloads
    pub local_ref: String,
    /// Live preview handle; `None` once released
    pub preview: Option<String>,
    pub owner: EntityId,
    pub slot: ResourceSlot,
    pub content_type: String,
    pub state: ResourceState,
    /// Remote id this upload replaces
    pub replaces: Option<String>,
}

impl PendingResource {
    /// Put this resource's local ref into its slot of `fields`
    pub fn attach_to(&self, fields: &mut Fields) {
        self.slot.place(fields, Value::String(self.local_ref.clone()));
    }
}

/// Metadata persisted next to queued bytes
#[derive(Debug, Serialize, Deserialize)]
struct StoredResource {
    content_type: String,
    replaces: Option<String>,
}

#[derive(Debug)]
struct ResourceEntry {
    resource: PendingResource,
    bytes: Bytes,
}

/// Outcome of one resource in `commit_all`
pub type CommitResult = (String, SyncResult<UploadedResource>);

type HoldCounts = Arc<Mutex<HashMap<String, usize>>>;

/// Keeps persisted resource bytes safe from pruning until dropped
#[derive(Debug)]
pub struct ResourceHold {
    ids: Vec<String>,
    counts: HoldCounts,
}

impl ResourceHold {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl Drop for ResourceHold {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            if let Some(count) = counts.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(id);
                }
            }
        }
    }
}

/// Coordinator of pending resources for one session
pub struct ResourceCoordinator {
    db: LocalDatabase,
    host: Arc<dyn ResourceHost>,
    previews: PreviewRegistry,
    entries: Mutex<HashMap<String, ResourceEntry>>,
    holds: HoldCounts,
    settings: ResourceSettings,
}

impl std::fmt::Debug for ResourceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCoordinator")
            .field("pending", &self.lock().len())
            .field("previews", &self.previews.stats())
            .finish()
    }
}

impl ResourceCoordinator {
    pub fn new(db: LocalDatabase, host: Arc<dyn ResourceHost>, settings: ResourceSettings) -> Self {
        Self {
            db,
            host,
            previews: PreviewRegistry::new(),
            entries: Mutex::new(HashMap::new()),
            holds: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    /// Track a picked file and allocate its preview handle
    pub fn select(
        &self,
        bytes: Bytes,
        content_type: impl Into<String>,
        owner: EntityId,
        slot: ResourceSlot,
    ) -> PendingResource {
        self.select_inner(bytes, content_type.into(), owner, slot, None)
    }

    /// Like `select`, but the upload replaces an existing remote resource
    pub fn select_replacing(
        &self,
        bytes: Bytes,
        content_type: impl Into<String>,
        owner: EntityId,
        slot: ResourceSlot,
        existing_remote_id: impl Into<String>,
    ) -> PendingResource {
        self.select_inner(
            bytes,
            content_type.into(),
            owner,
            slot,
            Some(existing_remote_id.into()),
        )
    }

    fn select_inner(
        &self,
        bytes: Bytes,
        content_type: String,
        owner: EntityId,
        slot: ResourceSlot,
        replaces: Option<String>,
    ) -> PendingResource {
        let id = Uuid::new_v4().to_string();
        let resource = PendingResource {
            local_ref: local_ref(&id),
            preview: Some(self.previews.allocate(bytes.clone())),
            id: id.clone(),
            owner,
            slot,
            content_type,
            state: ResourceState::Selected,
            replaces,
        };
        tracing::debug!(
            "[RESOURCES] Selected {} ({} bytes) for {}",
            id,
            bytes.len(),
            resource.owner
        );
        self.lock().insert(
            id,
            ResourceEntry {
                resource: resource.clone(),
                bytes,
            },
        );
        resource
    }

    /// Drop a pending resource and release its preview; false if unknown
    pub fn discard(&self, resource_id: &str) -> bool {
        let Some(entry) = self.lock().remove(resource_id) else {
            return false;
        };
        if let Some(handle) = entry.resource.preview {
            self.previews.release(&handle);
        }
        tracing::debug!("[RESOURCES] Discarded {}", resource_id);
        true
    }

    /// Snapshot of a tracked resource
    pub fn get(&self, resource_id: &str) -> Option<PendingResource> {
        self.lock()
            .get(resource_id)
            .map(|entry| entry.resource.clone())
    }

    /// Tracked resources owned by an entity
    pub fn pending_for(&self, owner: &EntityId) -> Vec<PendingResource> {
        let mut resources: Vec<_> = self
            .lock()
            .values()
            .filter(|entry| &entry.resource.owner == owner)
            .map(|entry| entry.resource.clone())
            .collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        resources
    }

    /// Number of tracked resources in the given state
    pub fn count_in_state(&self, state: ResourceState) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.resource.state == state)
            .count()
    }

    /// Bytes behind a preview handle
    pub fn preview(&self, handle: &str) -> Option<Bytes> {
        self.previews.get(handle)
    }

    pub fn handle_stats(&self) -> HandleStats {
        self.previews.stats()
    }

    /// Follow a retired owner id after a remap
    pub fn reassign_owner(&self, from: &EntityId, to: &EntityId) {
        for entry in self.lock().values_mut() {
            if &entry.resource.owner == from {
                entry.resource.owner = to.clone();
            }
        }
    }

    /// Persist the bytes of a resource referenced by a mutation
    ///
    /// A resource no longer tracked by the session is fine as long as its
    /// bytes were persisted earlier.
    pub async fn persist(&self, resource_id: &str) -> SyncResult<()> {
        let tracked = self.lock().get(resource_id).map(|entry| {
            (
                entry.bytes.clone(),
                StoredResource {
                    content_type: entry.resource.content_type.clone(),
                    replaces: entry.resource.replaces.clone(),
                },
            )
        });

        let Some((bytes, stored)) = tracked else {
            return match self.db.get_blob(&resource_key(resource_id)).await? {
                Some(_) => Ok(()),
                None => Err(SyncError::not_found(format!("resource {}", resource_id))),
            };
        };
        self.db.put_blob(&resource_key(resource_id), &bytes).await?;
        self.db.put_json(&resource_meta_key(resource_id), &stored).await?;
        tracing::debug!("[RESOURCES] Persisted {} ({} bytes)", resource_id, bytes.len());
        Ok(())
    }

    /// Persist several resources and hold them against pruning
    ///
    /// The hold is taken before the first write.
    pub async fn persist_held(&self, resource_ids: &[String]) -> SyncResult<ResourceHold> {
        let hold = self.hold(resource_ids);
        for resource_id in resource_ids {
            self.persist(resource_id).await?;
        }
        Ok(hold)
    }

    fn hold(&self, resource_ids: &[String]) -> ResourceHold {
        let mut counts = self.holds.lock().unwrap_or_else(PoisonError::into_inner);
        for id in resource_ids {
            *counts.entry(id.clone()).or_default() += 1;
        }
        ResourceHold {
            ids: resource_ids.to_vec(),
            counts: Arc::clone(&self.holds),
        }
    }

    fn is_held(&self, resource_id: &str) -> bool {
        self.holds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(resource_id)
    }

    /// Drop persisted bytes of uploaded resources nothing references anymore
    ///
    /// Call once the uploaded URLs are stored in place of the local refs.
    pub async fn release_unreferenced(&self, resource_ids: &[String], referenced: &HashSet<String>) {
        for resource_id in resource_ids {
            if referenced.contains(resource_id) || self.is_held(resource_id) {
                continue;
            }
            self.forget_persisted(resource_id).await;
        }
    }

    /// Compress and upload one resource
    ///
    /// Bytes come from the session if the resource is tracked, otherwise from
    /// the persisted copy. The preview handle is released on either outcome.
    pub async fn commit(&self, resource_id: &str) -> SyncResult<UploadedResource> {
        let (bytes, content_type, replaces) = self.begin_upload(resource_id).await?;

        let settings = self.settings.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            compress::prepare(
                bytes,
                &content_type,
                settings.max_dimension,
                settings.jpeg_quality,
            )
        })
        .await
        .map_err(|e| SyncError::upload(resource_id, format!("compression task failed: {}", e)));

        let outcome = match prepared {
            Ok(prepared) => self
                .host
                .upload(prepared.bytes, &prepared.content_type, replaces.as_deref())
                .await
                .map_err(|e| match e {
                    SyncError::TransientNetwork { message } => SyncError::upload(resource_id, message),
                    other => other,
                }),
            Err(e) => Err(e),
        };

        self.release_preview(resource_id);

        match outcome {
            Ok(uploaded) => {
                self.lock().remove(resource_id);
                tracing::info!("[RESOURCES] Uploaded {} as {}", resource_id, uploaded.remote_id);

                if let Some(old) = replaces.filter(|old| old != &uploaded.remote_id) {
                    if let Err(e) = self.host.delete(&old).await {
                        tracing::warn!("[RESOURCES] Failed to delete replaced resource {}: {}", old, e);
                    }
                }
                Ok(uploaded)
            }
            Err(e) => {
                if let Some(entry) = self.lock().get_mut(resource_id) {
                    entry.resource.state = ResourceState::Failed;
                }
                tracing::warn!("[RESOURCES] Upload of {} failed: {}", resource_id, e);
                Err(e)
            }
        }
    }

    /// Upload several resources, at most `upload_concurrency` at a time
    pub async fn commit_all(&self, resource_ids: &[String]) -> Vec<CommitResult> {
        let limit = self.settings.upload_concurrency.max(1);
        stream::iter(resource_ids.iter().cloned())
            .map(|id| async move {
                let result = self.commit(&id).await;
                (id, result)
            })
            .buffered(limit)
            .collect()
            .await
    }

    /// Delete persisted bytes that no queued mutation references
    pub async fn prune_persisted(&self, referenced: &HashSet<String>) -> SyncResult<usize> {
        let mut pruned = 0;
        for key in self.db.list_keys(RESOURCE_PREFIX).await? {
            let id = &key[RESOURCE_PREFIX.len()..];
            if referenced.contains(id) || self.lock().contains_key(id) || self.is_held(id) {
                continue;
            }
            self.db.delete_blob(&key).await?;
            self.db.delete_blob(&resource_meta_key(id)).await?;
            pruned += 1;
        }
        for key in self.db.list_keys(RESOURCE_META_PREFIX).await? {
            let id = &key[RESOURCE_META_PREFIX.len()..];
            if !referenced.contains(id)
                && !self.is_held(id)
                && self.db.get_blob(&resource_key(id)).await?.is_none()
            {
                self.db.delete_blob(&key).await?;
            }
        }
        if pruned > 0 {
            tracing::info!("[RESOURCES] Pruned {} orphaned resource payloads", pruned);
        }
        Ok(pruned)
    }

    /// Mark a resource uploading and hand out its bytes
    async fn begin_upload(&self, resource_id: &str) -> SyncResult<(Bytes, String, Option<String>)> {
        {
            let mut entries = self.lock();
            if let Some(entry) = entries.get_mut(resource_id) {
                if entry.resource.state == ResourceState::Uploading {
                    return Err(SyncError::upload(resource_id, "upload already in progress"));
                }
                entry.resource.state = ResourceState::Uploading;
                return Ok((
                    entry.bytes.clone(),
                    entry.resource.content_type.clone(),
                    entry.resource.replaces.clone(),
                ));
            }
        }

        let bytes = self
            .db
            .get_blob(&resource_key(resource_id))
            .await?
            .ok_or_else(|| SyncError::not_found(format!("resource {}", resource_id)))?;
        let stored: Option<StoredResource> = self.db.get_json(&resource_meta_key(resource_id)).await?;
        let (content_type, replaces) = match stored {
            Some(stored) => (stored.content_type, stored.replaces),
            None => ("application/octet-stream".to_string(), None),
        };
        Ok((Bytes::from(bytes), content_type, replaces))
    }

    fn release_preview(&self, resource_id: &str) {
        let handle = self
            .lock()
            .get_mut(resource_id)
            .and_then(|entry| entry.resource.preview.take());
        if let Some(handle) = handle {
            self.previews.release(&handle);
        }
    }

    async fn forget_persisted(&self, resource_id: &str) {
        for key in [resource_key(resource_id), resource_meta_key(resource_id)] {
            if let Err(e) = self.db.delete_blob(&key).await {
                tracing::warn!("[RESOURCES] Failed to delete {}: {}", key, e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResourceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resource ids referenced by local refs anywhere in `fields`, in first-seen order
pub fn collect_local_refs(fields: &Fields) -> Vec<String> {
    fn walk(value: &Value, seen: &mut HashSet<String>, out: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                if let Some(id) = parse_local_ref(s) {
                    if seen.insert(id.to_string()) {
                        out.push(id.to_string());
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|item| walk(item, seen, out)),
            Value::Object(map) => map.values().for_each(|item| walk(item, seen, out)),
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in fields.values() {
        walk(value, &mut seen, &mut out);
    }
    out
}

/// Swap local refs for uploaded URLs; returns how many were replaced
pub fn replace_local_refs(fields: &mut Fields, uploaded: &HashMap<String, String>) -> usize {
    fn walk(value: &mut Value, uploaded: &HashMap<String, String>) -> usize {
        match value {
            Value::String(s) => match parse_local_ref(s).and_then(|id| uploaded.get(id)) {
                Some(url) => {
                    *s = url.clone();
                    1
                }
                None => 0,
            },
            Value::Array(items) => items.iter_mut().map(|item| walk(item, uploaded)).sum(),
            Value::Object(map) => map.values_mut().map(|item| walk(item, uploaded)).sum(),
            _ => 0,
        }
    }

    fields.values_mut().map(|value| walk(value, uploaded)).sum()
}

/// Remove unresolved local refs so `fields` can be shown from the cache
///
/// A field that is itself a local ref falls back to its value in `previous`
/// (or is dropped so schema defaults apply); local refs inside lists are
/// filtered out.
pub fn strip_local_refs(fields: &mut Fields, previous: Option<&Fields>) {
    fn is_local(value: &Value) -> bool {
        value.as_str().and_then(parse_local_ref).is_some()
    }

    fn strip(value: &mut Value) {
        match value {
            Value::Array(items) => {
                items.retain(|item| !is_local(item));
                items.iter_mut().for_each(strip);
            }
            Value::Object(map) => {
                map.retain(|_, item| !is_local(item));
                map.values_mut().for_each(strip);
            }
            _ => {}
        }
    }

    let keys: Vec<String> = fields.keys().cloned().collect();
    for key in keys {
        let fallback = previous.and_then(|previous| previous.get(&key)).cloned();
        let Some(value) = fields.get_mut(&key) else {
            continue;
        };
        if is_local(value) {
            match fallback {
                Some(previous_value) => *value = previous_value,
                None => {
                    fields.remove(&key);
                }
            }
        } else {
            strip(value);
        }
    }
}
