//! Entity Types
//!
//! Domain records tracked by the local cache, and the versioned schemas that
//! give every cached record a predictable shape.
//!
//! Records coming from the remote store may omit fields (documents grow new
//! fields over time). Missing fields are filled from the collection's schema
//! defaults when a record crosses into the cache, so nothing downstream ever
//! has to guess whether a field exists.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Field map of an entity or of a partial update
pub type Fields = Map<String, Value>;

/// Identifier of an entity
///
/// Before the remote store confirms an entity this is a client-generated
/// provisional id. The remote may keep it or assign its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a globally unique provisional id
    pub fn provisional() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Name of an entity collection (one per domain type)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A single domain record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity id (provisional until confirmed)
    pub id: EntityId,
    /// Record fields
    #[serde(default)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(id: EntityId, fields: Fields) -> Self {
        Self { id, fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Shallow-merge a partial update into this entity (later values win)
    pub fn apply_patch(&mut self, patch: &Fields) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Replace every string field value equal to `from` with `to`
    ///
    /// Used when a provisional id is remapped by the remote store and other
    /// entities still point at it.
    pub fn rewrite_references(&mut self, from: &EntityId, to: &EntityId) -> bool {
        rewrite_references_in_fields(&mut self.fields, from, to)
    }
}

/// Rewrite id references inside a field map; returns whether anything changed
pub fn rewrite_references_in_fields(fields: &mut Fields, from: &EntityId, to: &EntityId) -> bool {
    let mut changed = false;
    for value in fields.values_mut() {
        changed |= rewrite_value(value, from, to);
    }
    changed
}

fn rewrite_value(value: &mut Value, from: &EntityId, to: &EntityId) -> bool {
    match value {
        Value::String(s) if s == from.as_str() => {
            *s = to.as_str().to_string();
            true
        }
        Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= rewrite_value(item, from, to);
            }
            changed
        }
        Value::Object(map) => rewrite_references_in_fields(map, from, to),
        _ => false,
    }
}

/// Versioned shape of one collection
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    /// Schema version, bumped when defaults change
    pub version: u32,
    /// Default value for every known field
    pub defaults: Fields,
}

impl CollectionSchema {
    pub fn new(version: u32, defaults: Fields) -> Self {
        Self { version, defaults }
    }

    /// Fill fields missing from `entity` with this schema's defaults
    pub fn normalize(&self, entity: &mut Entity) {
        for (key, default) in &self.defaults {
            entity
                .fields
                .entry(key.clone())
                .or_insert_with(|| default.clone());
        }
    }
}

/// Registry of collection schemas
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<CollectionName, CollectionSchema>,
}

impl SchemaRegistry {
    /// Registry with no schemas; records pass through unchanged
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the console's built-in collections
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            CollectionName::new("inventory"),
            CollectionSchema::new(
                1,
                object(json!({
                    "name": "",
                    "quantity": 0,
                    "location": null,
                    "image": null,
                    "tags": [],
                })),
            ),
        );
        registry.register(
            CollectionName::new("projects"),
            CollectionSchema::new(
                1,
                object(json!({
                    "title": "",
                    "status": "active",
                    "cover": null,
                    "item_ids": [],
                })),
            ),
        );
        registry.register(
            CollectionName::new("media"),
            CollectionSchema::new(
                1,
                object(json!({
                    "caption": "",
                    "images": [],
                })),
            ),
        );
        registry
    }

    pub fn register(&mut self, collection: CollectionName, schema: CollectionSchema) {
        self.schemas.insert(collection, schema);
    }

    pub fn schema_for(&self, collection: &CollectionName) -> Option<&CollectionSchema> {
        self.schemas.get(collection)
    }

    /// Apply the collection's defaults to an entity, if a schema is registered
    pub fn normalize(&self, collection: &CollectionName, entity: &mut Entity) {
        if let Some(schema) = self.schemas.get(collection) {
            schema.normalize(entity);
        }
    }
}

fn object(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: Value) -> Fields {
        object(value)
    }

    #[test]
    fn test_provisional_ids_are_unique() {
        assert_ne!(EntityId::provisional(), EntityId::provisional());
    }

    #[test]
    fn test_apply_patch_overwrites_and_keeps_other_fields() {
        let mut entity = Entity::new(
            EntityId::new("a"),
            fields(json!({"name": "Bolt", "quantity": 5})),
        );
        entity.apply_patch(&fields(json!({"quantity": 3})));
        assert_eq!(entity.get("quantity"), Some(&json!(3)));
        assert_eq!(entity.get("name"), Some(&json!("Bolt")));
    }

    #[test]
    fn test_normalize_fills_missing_fields_only() {
        let registry = SchemaRegistry::builtin();
        let mut entity = Entity::new(EntityId::new("a"), fields(json!({"quantity": 7})));
        registry.normalize(&CollectionName::new("inventory"), &mut entity);
        assert_eq!(entity.get("quantity"), Some(&json!(7)));
        assert_eq!(entity.get("name"), Some(&json!("")));
        assert_eq!(entity.get("tags"), Some(&json!([])));
    }

    #[test]
    fn test_unknown_collection_passes_through() {
        let registry = SchemaRegistry::builtin();
        let mut entity = Entity::new(EntityId::new("a"), Fields::new());
        registry.normalize(&CollectionName::new("notes"), &mut entity);
        assert!(entity.fields.is_empty());
    }

    #[test]
    fn test_rewrite_references_nested() {
        let from = EntityId::new("tmp-1");
        let to = EntityId::new("srv-9");
        let mut entity = Entity::new(
            EntityId::new("p"),
            fields(json!({"item_ids": ["tmp-1", "other"], "lead": {"item": "tmp-1"}, "title": "x"})),
        );
        assert!(entity.rewrite_references(&from, &to));
        assert_eq!(entity.get("item_ids"), Some(&json!(["srv-9", "other"])));
        assert_eq!(entity.get("lead"), Some(&json!({"item": "srv-9"})));
        assert!(!entity.rewrite_references(&from, &to));
    }
}
