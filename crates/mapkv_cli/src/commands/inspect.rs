//! Inspect command implementation.

use super::{format_size, CliResult, Target};
use mapkv_core::{Mode, StorePaths};
use serde::Serialize;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store id.
    pub id: String,
    /// Data file path.
    pub path: String,
    /// Whether the log is encrypted.
    pub encrypted: bool,
    /// Header sequence.
    pub sequence: u64,
    /// Backing file size in bytes.
    pub file_size: u64,
    /// Offset of the log.
    pub log_start: u64,
    /// Log bytes in use.
    pub actual_size: u64,
    /// Log bytes held by dead records.
    pub stale_bytes: u64,
    /// Live keys.
    pub key_count: usize,
    /// Keys whose expiry has passed but were not compacted yet.
    pub expired_count: usize,
    /// Keys, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// Runs the inspect command.
pub fn run(target: &Target<'_>, id: &str, show_keys: bool, format: &str) -> CliResult<()> {
    let paths = StorePaths::for_id(target.root, id)?;
    if !paths.exists() {
        return Err(format!("no store {id} under {}", target.root.display()).into());
    }
    let registry = target.registry();
    let store = target.open(&registry, id, Mode::ReadOnly)?;
    let header = store.try_header()?;
    let all = store.try_keys(false)?;
    let live = store.try_count(true)?;

    let result = InspectResult {
        id: id.to_string(),
        path: paths.data_path().display().to_string(),
        encrypted: header.encrypted,
        sequence: header.sequence,
        file_size: store.total_size(),
        log_start: header.log_start,
        actual_size: header.actual_size,
        stale_bytes: store.stale_bytes(),
        key_count: live,
        expired_count: all.len().saturating_sub(live),
        keys: show_keys.then_some(all),
    };
    registry.on_exit();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("MapKV Store Inspection");
    println!("======================");
    println!();
    println!("Id:        {}", result.id);
    println!("Path:      {}", result.path);
    println!("Encrypted: {}", result.encrypted);
    println!("Sequence:  {}", result.sequence);
    println!();
    println!("Storage:");
    println!("  File size:   {}", format_size(result.file_size));
    println!("  Log start:   {}", result.log_start);
    println!("  Log size:    {}", format_size(result.actual_size));
    println!("  Stale bytes: {}", format_size(result.stale_bytes));
    println!();
    println!("Keys:");
    println!("  Live:    {}", result.key_count);
    println!("  Expired: {}", result.expired_count);

    if let Some(keys) = &result.keys {
        println!();
        for key in keys {
            println!("  {key}");
        }
    }
}
