//! Property-based test generators using proptest.

use mapkv_core::Value;
use proptest::prelude::*;

/// Strategy for generating valid keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9_.:-]{1,24}").expect("Invalid regex")
}

/// Strategy for keys drawn from a small pool, so operations collide.
pub fn pooled_key_strategy(pool: usize) -> impl Strategy<Value = String> {
    (0..pool).prop_map(|i| format!("key_{i}"))
}

fn finite_f32() -> impl Strategy<Value = f32> {
    any::<f32>().prop_filter("finite", |v| v.is_finite())
}

fn finite_f64() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("finite", |v| v.is_finite())
}

/// Strategy for generating values of every type. Floats are finite so
/// values compare equal to themselves.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::I32),
        any::<u32>().prop_map(Value::U32),
        any::<i64>().prop_map(Value::I64),
        any::<u64>().prop_map(Value::U64),
        finite_f32().prop_map(Value::F32),
        finite_f64().prop_map(Value::F64),
        ".{0,64}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..256).prop_map(Value::Bytes),
        prop::collection::vec(".{0,16}", 0..8).prop_map(Value::StrList),
    ]
}

/// A single store operation.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Store a value.
    Set {
        /// Key
        key: String,
        /// Value
        value: Value,
    },
    /// Remove a key.
    Remove {
        /// Key
        key: String,
    },
    /// Read a key.
    Get {
        /// Key
        key: String,
    },
    /// Force a compaction.
    Compact,
}

/// Strategy for generating store operations over a pool of `pool` keys.
pub fn store_operation_strategy(pool: usize) -> impl Strategy<Value = StoreOperation> {
    prop_oneof![
        6 => (pooled_key_strategy(pool), value_strategy())
            .prop_map(|(key, value)| StoreOperation::Set { key, value }),
        2 => pooled_key_strategy(pool).prop_map(|key| StoreOperation::Remove { key }),
        3 => pooled_key_strategy(pool).prop_map(|key| StoreOperation::Get { key }),
        1 => Just(StoreOperation::Compact),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    pool: usize,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<StoreOperation>> {
    prop::collection::vec(store_operation_strategy(pool), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
