//! Compact command implementation.

use super::{format_size, CliResult, Target};
use mapkv_core::Mode;

/// Runs the compact command, optionally shrinking the file afterwards.
pub fn run(target: &Target<'_>, id: &str, trim: bool, dry_run: bool) -> CliResult<()> {
    let registry = target.registry();
    let mode = if dry_run { Mode::ReadOnly } else { Mode::MultiProcess };
    let store = target.open(&registry, id, mode)?;

    let size_before = store.total_size();
    let header = store.try_header()?;
    let stale = store.stale_bytes();

    println!("Compacting {id} under {}", target.root.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
        println!();
        println!("  Log size:    {}", format_size(header.actual_size));
        println!("  Stale bytes: {}", format_size(stale));
        println!("  Reclaimable: {:.1}%", percent(stale, header.actual_size));
        registry.on_exit();
        return Ok(());
    }
    println!();

    let result = store.try_compact()?;
    if trim {
        store.try_trim()?;
    }
    let size_after = store.total_size();
    registry.on_exit();

    println!("Compaction Results:");
    println!("  Live records:    {}", result.live_records);
    println!("  Expired dropped: {}", result.expired_dropped);
    println!("  Log before:      {}", format_size(header.actual_size));
    println!("  Log after:       {}", format_size(result.output_bytes));
    if trim {
        println!("  File before:     {}", format_size(size_before));
        println!("  File after:      {}", format_size(size_after));
    }
    println!();
    println!("✓ Compaction complete");
    Ok(())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_log() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
