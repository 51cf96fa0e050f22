//! Stockpile - offline-first data layer for the inventory console
//!
//! Stockpile keeps a field inventory console usable while the network comes
//! and goes. Every edit lands in a local cache at once; writes reach the
//! remote store either directly or through a durable queue that is replayed
//! when connectivity settles.
//!
//! # Module Structure
//!
//! - **`shared`** - Types shared by every layer
//!   - Entities, collection names and schemas
//!   - Error taxonomy
//!   - Application configuration
//!
//! - **`console`** - The data layer itself
//!   - Connectivity monitor and background sync service
//!   - Local cache store over SQLite
//!   - Pending resource coordinator (previews, compression, uploads)
//!   - Sync queue, flush engine and retry policy
//!   - Optimistic mutation dispatcher
//!   - Remote store and resource host adapters (HTTP and in-memory)
//!
//! # Usage
//!
//! ```rust,no_run
//! use stockpile::console::{Adapters, Config, Console};
//! use stockpile::console::offline::Mutation;
//! use stockpile::shared::{EntityId, Fields};
//!
//! # async fn example() -> stockpile::shared::SyncResult<()> {
//! let config = Config::load(None)?;
//! let mut console = Console::open(&config, Adapters::from_config(&config)?).await?;
//! console.start();
//!
//! let mut patch = Fields::new();
//! patch.insert("quantity".into(), 12.into());
//! console
//!     .mutate(&"inventory".into(), Mutation::update(EntityId::new("item-1"), patch))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! Every component is shared behind `Arc` and synchronizes internally, so
//! the UI thread and background tasks may call into the same [`console::Console`].
//!
//! # Error Handling
//!
//! Fallible operations return [`shared::SyncResult`]. Errors carry whether
//! they are retryable; the queue keeps retrying those and parks the rest as
//! failed items for the user to retry or discard.

/// Shared types and data structures
pub mod shared;

/// Offline-first data layer
pub mod console;
