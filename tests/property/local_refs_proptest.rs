//! Local refs never leak into what the cache shows

use proptest::prelude::*;
use serde_json::{json, Value};
use stockpile::console::resources::{collect_local_refs, local_ref, strip_local_refs};
use stockpile::shared::Fields;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|id| Value::String(local_ref(&id))),
        "[a-z ]{0,12}".prop_map(Value::String),
        (0i64..1000).prop_map(|n| json!(n)),
        prop::collection::vec("[a-z]{1,8}".prop_map(|id| Value::String(local_ref(&id))), 0..4)
            .prop_map(Value::Array),
    ]
}

fn fields_strategy() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map("[a-e]", value_strategy(), 0..5)
        .prop_map(|map| map.into_iter().collect())
}

proptest! {
    #[test]
    fn test_stripped_fields_hold_no_local_refs(
        payload in fields_strategy(),
        previous in prop::option::of(fields_strategy()),
    ) {
        // What the cache held before is already clean
        let previous = previous.map(|mut fields| {
            strip_local_refs(&mut fields, None);
            fields
        });

        let mut shown = payload.clone();
        strip_local_refs(&mut shown, previous.as_ref());
        prop_assert!(collect_local_refs(&shown).is_empty());

        // Plain values pass through untouched
        for (key, value) in &payload {
            let plain = match value {
                Value::String(s) => !s.starts_with("local://"),
                Value::Array(_) => false,
                _ => true,
            };
            if plain {
                prop_assert_eq!(shown.get(key), Some(value));
            }
        }
    }
}
