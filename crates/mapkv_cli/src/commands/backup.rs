//! Backup and restore commands.

use super::{CliResult, Target};
use std::path::Path;

/// Copies `id`, or every store when `id` is `None`, into `dst`.
pub fn backup(target: &Target<'_>, id: Option<&str>, dst: &Path) -> CliResult<()> {
    let registry = target.registry();
    println!("Backing up {} to {}", target.root.display(), dst.display());

    match id {
        Some(id) => {
            let path = registry.try_backup_one_to_directory(id, dst, None)?;
            println!("✓ {id} -> {}", path.display());
        }
        None => {
            let count = registry.backup_all_to_directory(dst, None);
            println!("✓ {count} store(s) backed up");
        }
    }
    registry.on_exit();
    Ok(())
}

/// Restores `id`, or every store found in `src`, into the root.
pub fn restore(target: &Target<'_>, id: Option<&str>, src: &Path) -> CliResult<()> {
    let registry = target.registry();
    println!("Restoring {} from {}", target.root.display(), src.display());

    match id {
        Some(id) => {
            registry.try_restore_one_from_directory(id, src, None)?;
            println!("✓ {id} restored");
        }
        None => {
            let count = registry.restore_all_from_directory(src, None);
            println!("✓ {count} store(s) restored");
        }
    }
    registry.on_exit();
    Ok(())
}

/// Deletes the files of `id`.
pub fn remove_storage(target: &Target<'_>, id: &str) -> CliResult<()> {
    let registry = target.registry();
    let removed = registry.try_remove_storage(id, None)?;
    if removed {
        println!("✓ {id} removed");
    } else {
        println!("{id} does not exist");
    }
    Ok(())
}
