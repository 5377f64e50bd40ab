//! Store behavior seen through the public API.

use mapkv_core::{CoreError, Ttl, Value};
use mapkv_testkit::prelude::*;
use std::thread;
use std::time::Duration;

#[test]
fn boundary_values_round_trip() {
    let registry = TestRegistry::new();
    let store = registry.store("bounds");

    store.set("i32_min", i32::MIN);
    store.set("i32_max", i32::MAX);
    store.set("u32_max", u32::MAX);
    store.set("i64_min", i64::MIN);
    store.set("u64_max", u64::MAX);
    store.set("f32", f32::MIN_POSITIVE);
    store.set("f64", -0.0f64);
    store.set("empty_str", "");
    store.set("empty_bytes", Vec::<u8>::new());
    store.set("list", vec!["".to_string(), "é".to_string()]);

    registry.on_exit();
    let store = registry.store("bounds");

    assert_eq!(store.get_i32("i32_min", 0), i32::MIN);
    assert_eq!(store.get_i32("i32_max", 0), i32::MAX);
    assert_eq!(store.get_u32("u32_max", 0), u32::MAX);
    assert_eq!(store.get_i64("i64_min", 0), i64::MIN);
    assert_eq!(store.get_u64("u64_max", 0), u64::MAX);
    assert_eq!(store.get_f32("f32", 0.0), f32::MIN_POSITIVE);
    assert!(store.get_f64("f64", 1.0).is_sign_negative());
    assert!(store.contains("empty_str"));
    assert_eq!(store.get_string("empty_str", "default"), "");
    assert_eq!(store.get_bytes("empty_bytes", b"default"), Vec::<u8>::new());
    assert_eq!(
        store.get_string_list("list", &[]),
        vec!["".to_string(), "é".to_string()]
    );
}

#[test]
fn missing_keys_return_defaults() {
    with_temp_store(|store| {
        assert!(!store.get_bool("missing", false));
        assert_eq!(store.get_i32("missing", -7), -7);
        assert_eq!(store.get_string("missing", "fallback"), "fallback");
        assert_eq!(store.get_value("missing"), None);
        assert_eq!(store.value_size("missing"), 0);
    });
}

#[test]
fn overwrite_changes_type() {
    with_temp_store(|store| {
        store.set("k", 5i32);
        store.set("k", "five");
        assert_eq!(store.get_value("k"), Some(Value::Str("five".into())));
        assert_eq!(store.get_i32("k", 0), 0);
        assert_eq!(store.count(true), 1);
    });
}

#[test]
fn remove_semantics() {
    with_temp_store(|store| {
        store.set("a", 1i32);
        store.set("b", 2i32);

        assert!(store.try_remove("a").unwrap());
        assert!(!store.try_remove("a").unwrap());
        assert!(store.remove("never_existed"));
        assert!(!store.contains("a"));

        assert_eq!(store.try_remove_many(&["a", "b", "c"]).unwrap(), 1);
        assert_eq!(store.count(true), 0);
    });
}

#[test]
fn empty_key_is_invalid() {
    with_temp_store(|store| {
        assert!(matches!(
            store.try_set("", 1i32),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(!store.set("", 1i32));
        assert_eq!(store.count(false), 0);
    });
}

#[test]
fn compare_before_set_keeps_size_stable() {
    with_temp_store(|store| {
        store.enable_compare_before_set();
        assert!(store.try_set("k", "same").unwrap());
        let size = store.actual_size();

        for _ in 0..10 {
            assert!(!store.try_set("k", "same").unwrap());
        }
        assert_eq!(store.actual_size(), size);

        assert!(store.try_set("k", "different").unwrap());
        assert!(store.actual_size() > size);

        store.disable_compare_before_set();
        let size = store.actual_size();
        assert!(store.try_set("k", "different").unwrap());
        assert!(store.actual_size() > size);
    });
}

#[test]
fn compare_before_set_still_writes_expiring_values() {
    with_temp_store(|store| {
        store.enable_compare_before_set();
        store.set("k", 1i32);
        assert!(store.try_set_with_ttl("k", 1i32, Ttl::Seconds(60)).unwrap());
        assert!(store.try_set("k", 1i32).unwrap());
    });
}

#[test]
fn ttl_expires_values() {
    with_temp_store(|store| {
        store.set_with_ttl("short", "gone soon", 1);
        store.set_with_ttl("forever", "stays", 0);
        assert!(store.contains("short"));

        thread::sleep(Duration::from_millis(2100));

        assert!(!store.contains("short"));
        assert_eq!(store.get_value("short"), None);
        assert!(store.contains("forever"));
        assert_eq!(store.keys(true), vec!["forever".to_string()]);
        assert_eq!(store.count(false), 2);

        let result = store.try_compact().unwrap();
        assert_eq!(result.expired_dropped, 1);
        assert_eq!(store.count(false), 1);
    });
}

#[test]
fn auto_expire_applies_to_default_ttl_only() {
    with_temp_store(|store| {
        store.enable_auto_key_expire(1);
        store.set("auto", 1i32);
        store.set_with_ttl("pinned", 1i32, 0);
        store.disable_auto_key_expire();
        store.set("plain", 1i32);

        thread::sleep(Duration::from_millis(2100));

        assert!(!store.contains("auto"));
        assert!(store.contains("pinned"));
        assert!(store.contains("plain"));
    });
}

#[test]
fn heavy_overwrites_compact_automatically() {
    with_temp_store(|store| {
        let value = vec![7u8; 200];
        for i in 0..2000 {
            store.set(&format!("k{}", i % 10), value.clone());
        }
        assert!(store.stats().compactions() > 0);
        assert_eq!(store.count(true), 10);
        assert!(store.stale_bytes() < store.actual_size());
    });
}

#[test]
fn clear_all_and_trim_shrink_the_file() {
    with_temp_store(|store| {
        let base = store.total_size();
        for i in 0..500 {
            store.set(&format!("key{i}"), vec![1u8; 100]);
        }
        assert!(store.total_size() > base);

        let keep: Vec<String> = (10..500).map(|i| format!("key{i}")).collect();
        store.remove_many(&keep);
        let before_trim = store.total_size();
        assert!(store.trim());
        assert!(store.total_size() <= before_trim);
        assert_eq!(store.count(true), 10);

        assert!(store.clear_all());
        assert_eq!(store.count(false), 0);
        assert_eq!(store.total_size(), base);
    });
}
