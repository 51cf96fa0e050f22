//! Shared Module
//!
//! Types shared by every layer of the crate: entities and their schemas,
//! the error taxonomy and the application configuration. Nothing in here
//! touches the network or the disk.

/// Entity, collection and schema types
pub mod entity;

/// Shared error types
pub mod error;

/// Application configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use config::{AppConfig, AppConfigBuilder, ConfigError};
pub use entity::{CollectionName, CollectionSchema, Entity, EntityId, Fields, SchemaRegistry};
pub use error::{SyncError, SyncResult};
