//! Compaction must never change what the remote store ends up holding

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use stockpile::console::offline::queue::compact_items;
use stockpile::console::offline::{ItemStatus, OpKind, SyncQueueItem};
use stockpile::shared::{CollectionName, EntityId, Fields};

type World = BTreeMap<EntityId, Fields>;

fn item(sequence: u64, op: OpKind, entity: &EntityId, payload: Fields) -> SyncQueueItem {
    SyncQueueItem {
        sequence,
        op,
        collection: CollectionName::new("inventory"),
        entity_id: entity.clone(),
        payload,
        created_at: Utc::now(),
        attempts: 0,
        status: ItemStatus::Pending,
        last_error: None,
        next_attempt_at: None,
    }
}

/// Turn raw choices into a queue that is valid against an initially empty store
fn build_queue(steps: &[(usize, u8, i64)]) -> Vec<SyncQueueItem> {
    let mut exists: BTreeMap<EntityId, bool> = BTreeMap::new();
    let mut items = Vec::with_capacity(steps.len());

    for (index, (entity, choice, value)) in steps.iter().enumerate() {
        let id = EntityId::new(format!("e{}", entity));
        let sequence = index as u64 + 1;
        let present = exists.get(&id).copied().unwrap_or(false);

        let (op, payload) = if !present {
            let mut payload = Fields::new();
            payload.insert("v".into(), json!(value));
            (OpKind::Create, payload)
        } else if *choice == 0 {
            (OpKind::Delete, Fields::new())
        } else {
            let mut payload = Fields::new();
            payload.insert(format!("f{}", choice), json!(value));
            (OpKind::Update, payload)
        };

        exists.insert(id.clone(), op != OpKind::Delete);
        items.push(item(sequence, op, &id, payload));
    }
    items
}

fn replay(items: &[SyncQueueItem]) -> World {
    let mut world = World::new();
    for item in items {
        match item.op {
            OpKind::Create => {
                world.insert(item.entity_id.clone(), item.payload.clone());
            }
            OpKind::Update => {
                if let Some(fields) = world.get_mut(&item.entity_id) {
                    for (key, value) in &item.payload {
                        fields.insert(key.clone(), value.clone());
                    }
                }
            }
            OpKind::Delete => {
                world.remove(&item.entity_id);
            }
        }
    }
    world
}

proptest! {
    #[test]
    fn test_compaction_preserves_final_state(
        steps in prop::collection::vec((0usize..3, 0u8..4, 0i64..100), 0..40)
    ) {
        let items = build_queue(&steps);
        let expected = replay(&items);

        let (compacted, removed) = compact_items(items.clone());
        prop_assert_eq!(compacted.len() + removed, items.len());
        prop_assert_eq!(replay(&compacted), expected);
        prop_assert!(compacted.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));
    }

    #[test]
    fn test_compaction_is_idempotent(
        steps in prop::collection::vec((0usize..3, 0u8..4, 0i64..100), 0..40)
    ) {
        let (once, _) = compact_items(build_queue(&steps));
        let (twice, removed) = compact_items(once.clone());
        prop_assert_eq!(removed, 0);
        prop_assert_eq!(twice, once);
    }
}
