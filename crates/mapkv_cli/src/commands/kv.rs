//! Single-key commands: get, set, keys, remove.

use super::{CliResult, Target};
use mapkv_core::{Mode, Ttl, Value};
use serde_json::json;

/// Prints the value under `key`.
pub fn get(target: &Target<'_>, id: &str, key: &str, format: &str) -> CliResult<()> {
    let registry = target.registry();
    let store = target.open(&registry, id, Mode::ReadOnly)?;
    let value = store.try_get_value(key)?;
    registry.on_exit();

    let Some(value) = value else {
        return Err(format!("key {key} not found in {id}").into());
    };
    match format {
        "json" => println!("{}", to_json(&value)),
        _ => println!("{}", to_text(&value)),
    }
    Ok(())
}

/// Stores `value` as a string under `key`.
pub fn set(target: &Target<'_>, id: &str, key: &str, value: &str, ttl: Option<u32>) -> CliResult<()> {
    let registry = target.registry();
    let store = target.open(&registry, id, Mode::MultiProcess)?;
    let ttl = ttl.map_or(Ttl::Default, Ttl::from_secs);
    store.try_set_with_ttl(key, value, ttl)?;
    registry.on_exit();
    Ok(())
}

/// Lists keys, one per line.
pub fn keys(target: &Target<'_>, id: &str, include_expired: bool) -> CliResult<()> {
    let registry = target.registry();
    let store = target.open(&registry, id, Mode::ReadOnly)?;
    let keys = store.try_keys(!include_expired)?;
    registry.on_exit();
    for key in keys {
        println!("{key}");
    }
    Ok(())
}

/// Removes `keys`, reporting how many existed.
pub fn remove(target: &Target<'_>, id: &str, keys: &[String]) -> CliResult<()> {
    let registry = target.registry();
    let store = target.open(&registry, id, Mode::MultiProcess)?;
    let removed = store.try_remove_many(keys)?;
    registry.on_exit();
    println!("removed {removed} of {} key(s)", keys.len());
    Ok(())
}

/// Renders a value as JSON.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(v) => json!(v),
        Value::I32(v) => json!(v),
        Value::U32(v) => json!(v),
        Value::I64(v) => json!(v),
        Value::U64(v) => json!(v),
        Value::F32(v) => json!(v),
        Value::F64(v) => json!(v),
        Value::Str(v) => json!(v),
        Value::Bytes(v) => json!(v),
        Value::StrList(v) => json!(v),
    }
}

/// Renders a value as plain text.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Bytes(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        Value::StrList(list) => list.join("\n"),
        other => to_json(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_values() {
        assert_eq!(to_json(&Value::I32(-3)), json!(-3));
        assert_eq!(to_json(&Value::StrList(vec!["a".into()])), json!(["a"]));
        assert_eq!(to_text(&Value::Str("hi".into())), "hi");
        assert_eq!(to_text(&Value::Bytes(vec![0xab, 0x01])), "ab01");
        assert_eq!(to_text(&Value::Bool(true)), "true");
    }
}
