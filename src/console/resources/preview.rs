//! Ephemeral preview handles
//!
//! A preview handle (`preview://<uuid>`) lets the UI render a selected file
//! before it is uploaded. Handles live only in memory and must be released
//! exactly once; the registry counts allocations and releases so leaks are
//! observable.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// URL scheme of preview handles
pub const PREVIEW_SCHEME: &str = "preview://";

/// Allocation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleStats {
    pub allocated: u64,
    pub released: u64,
}

impl HandleStats {
    /// Handles allocated but not yet released
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

#[derive(Debug, Default)]
pub struct PreviewRegistry {
    handles: Mutex<HashMap<String, Bytes>>,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle that serves `bytes`
    pub fn allocate(&self, bytes: Bytes) -> String {
        let handle = format!("{}{}", PREVIEW_SCHEME, Uuid::new_v4());
        self.lock().insert(handle.clone(), bytes);
        self.allocated.fetch_add(1, Ordering::SeqCst);
        handle
    }

    /// Release a handle; false if it was already released or never existed
    pub fn release(&self, handle: &str) -> bool {
        let released = self.lock().remove(handle).is_some();
        if released {
            self.released.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::warn!("[RESOURCES] Release of unknown preview handle {}", handle);
        }
        released
    }

    /// Bytes behind a live handle
    pub fn get(&self, handle: &str) -> Option<Bytes> {
        self.lock().get(handle).cloned()
    }

    pub fn stats(&self) -> HandleStats {
        HandleStats {
            allocated: self.allocated.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
