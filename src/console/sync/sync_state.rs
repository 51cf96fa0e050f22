//! # Sync State
//!
//! Outcome of a flush and the status snapshot the UI shows next to the
//! pending-count indicator.

use crate::console::sync::network_monitor::ConnectivityState;
use crate::shared::SyncError;
use chrono::{DateTime, Utc};

/// Summary of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Items replayed against the remote store
    pub attempted: usize,
    pub succeeded: usize,
    /// Items that failed but stay pending for a later flush
    pub retrying: usize,
    /// Items marked failed during this flush
    pub failed: usize,
    /// Pending items skipped because their backoff has not elapsed
    pub deferred: usize,
    /// Items skipped because an earlier item of the same entity failed
    pub blocked: usize,
    /// Items removed by compaction
    pub compacted: usize,
    /// Provisional ids replaced by remote ids
    pub remapped: usize,
    /// Resources uploaded while resolving local refs
    pub uploaded: usize,
    /// Items that became failed, with the error surfaced to the user
    pub failures: Vec<(u64, SyncError)>,
}

impl FlushReport {
    /// Whether nothing was left behind
    pub fn is_clean(&self) -> bool {
        self.retrying == 0 && self.failed == 0 && self.blocked == 0
    }

    pub(crate) fn merge(&mut self, other: &FlushReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.retrying += other.retrying;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.blocked += other.blocked;
        self.remapped += other.remapped;
        self.uploaded += other.uploaded;
        self.failures.extend(other.failures.iter().cloned());
    }
}

/// Snapshot of the sync layer
#[derive(Debug, Clone)]
pub struct SyncState {
    pub is_flushing: bool,
    pub last_flush: Option<DateTime<Utc>>,
    pub last_report: Option<FlushReport>,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub connectivity: ConnectivityState,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_flushing: false,
            last_flush: None,
            last_report: None,
            pending_operations: 0,
            failed_operations: 0,
            connectivity: ConnectivityState::Offline,
        }
    }
}
