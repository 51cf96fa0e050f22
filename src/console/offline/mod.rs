//! # Offline Mutation Layer
//!
//! Lets the user change entities whether or not the remote store is
//! reachable.
//!
//! - `optimistic.rs`: the mutation dispatcher (cache first, then direct write or queue)
//! - `queue.rs`: the persisted sync queue and its compaction
//! - `retry.rs`: backoff and attempt limits for queued items

pub mod optimistic;
pub mod queue;
pub mod retry;

pub use optimistic::{Mutation, MutationDispatcher, MutationOutcome, PendingMutation, WritePath};
pub use queue::{FailureOutcome, ItemStatus, OpKind, SyncQueue, SyncQueueItem};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
