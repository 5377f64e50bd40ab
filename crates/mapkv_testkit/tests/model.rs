//! Random operation sequences checked against an in-memory map.

use mapkv_core::Value;
use mapkv_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::HashMap;

fn apply(store: &mapkv_core::Store, model: &mut HashMap<String, Value>, op: &StoreOperation) {
    match op {
        StoreOperation::Set { key, value } => {
            assert!(store.set(key, value.clone()));
            model.insert(key.clone(), value.clone());
        }
        StoreOperation::Remove { key } => {
            assert_eq!(store.try_remove(key).unwrap(), model.remove(key).is_some());
        }
        StoreOperation::Get { key } => {
            assert_eq!(store.get_value(key).as_ref(), model.get(key));
        }
        StoreOperation::Compact => {
            let result = store.try_compact().unwrap();
            assert_eq!(result.live_records, model.len());
        }
    }
}

fn assert_matches(store: &mapkv_core::Store, model: &HashMap<String, Value>) {
    let mut expected: Vec<String> = model.keys().cloned().collect();
    expected.sort();
    assert_eq!(store.keys(true), expected);
    for (key, value) in model {
        assert_eq!(store.get_value(key).as_ref(), Some(value));
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn store_matches_model_across_reopen(ops in operation_sequence_strategy(12, 1, 200)) {
        let registry = TestRegistry::new();
        let store = registry.store("model");
        let mut model = HashMap::new();

        for op in &ops {
            apply(&store, &mut model, op);
        }
        assert_matches(&store, &model);

        registry.on_exit();
        let store = registry.store("model");
        assert_matches(&store, &model);
    }

    #[test]
    fn encrypted_store_matches_model(ops in operation_sequence_strategy(8, 1, 100)) {
        let registry = TestRegistry::new();
        let store = registry.open_encrypted("model", "model-key");
        let mut model = HashMap::new();

        for op in &ops {
            apply(&store, &mut model, op);
        }

        registry.on_exit();
        let store = registry.open_encrypted("model", "model-key");
        assert_matches(&store, &model);
    }

    #[test]
    fn any_key_and_value_round_trip(key in key_strategy(), value in value_strategy()) {
        let registry = TestRegistry::new();
        let store = registry.store("single");
        prop_assert!(store.set(&key, value.clone()));
        prop_assert_eq!(store.get_value(&key), Some(value));
    }
}
