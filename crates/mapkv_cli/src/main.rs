//! MapKV CLI
//!
//! Command-line tools for MapKV store directories.
//!
//! # Commands
//!
//! - `inspect` - Display store metadata and sizes
//! - `verify` - Check store files for damage
//! - `get` / `set` / `keys` / `remove` - Work with individual keys
//! - `compact` - Rewrite a store's log to reclaim space
//! - `backup` / `restore` - Copy stores to and from a directory
//! - `remove-storage` - Delete a store's files

mod commands;

use clap::{Parser, Subcommand};
use commands::Target;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// MapKV command-line store tools.
#[derive(Parser)]
#[command(name = "mapkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    root: Option<PathBuf>,

    /// Crypt key for encrypted stores
    #[arg(global = true, short = 'k', long)]
    crypt_key: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store metadata and sizes
    Inspect {
        /// Store id
        id: String,

        /// List every key
        #[arg(short = 'K', long)]
        keys: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check store files for damage
    Verify {
        /// Store id (all stores if omitted)
        id: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the value stored under a key
    Get {
        /// Store id
        id: String,

        /// Key
        key: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Store a string value under a key
    Set {
        /// Store id
        id: String,

        /// Key
        key: String,

        /// Value
        value: String,

        /// Expire after this many seconds (0 = never)
        #[arg(short, long)]
        ttl: Option<u32>,
    },

    /// List keys
    Keys {
        /// Store id
        id: String,

        /// Include keys whose expiry has passed
        #[arg(short, long)]
        all: bool,
    },

    /// Remove keys
    Remove {
        /// Store id
        id: String,

        /// Keys to remove
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Rewrite a store's log to reclaim space
    Compact {
        /// Store id
        id: String,

        /// Shrink the file after compacting
        #[arg(short, long)]
        trim: bool,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Copy stores into a backup directory
    Backup {
        /// Destination directory
        dst: PathBuf,

        /// Store id (all stores if omitted)
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Restore stores from a backup directory
    Restore {
        /// Source directory
        src: PathBuf,

        /// Store id (all stores if omitted)
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Delete a store's files
    RemoveStorage {
        /// Store id
        id: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("MapKV CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("MapKV Core v{}", mapkv_core::VERSION);
        return Ok(());
    }

    let root = cli.root.ok_or("Store directory required (--root)")?;
    let target = Target {
        root: &root,
        crypt_key: cli.crypt_key.as_deref(),
    };

    match cli.command {
        Commands::Inspect { id, keys, format } => {
            commands::inspect::run(&target, &id, keys, &format)?;
        }
        Commands::Verify { id, format } => {
            commands::verify::run(&target, id.as_deref(), &format)?;
        }
        Commands::Get { id, key, format } => {
            commands::kv::get(&target, &id, &key, &format)?;
        }
        Commands::Set { id, key, value, ttl } => {
            commands::kv::set(&target, &id, &key, &value, ttl)?;
        }
        Commands::Keys { id, all } => {
            commands::kv::keys(&target, &id, all)?;
        }
        Commands::Remove { id, keys } => {
            commands::kv::remove(&target, &id, &keys)?;
        }
        Commands::Compact { id, trim, dry_run } => {
            commands::compact::run(&target, &id, trim, dry_run)?;
        }
        Commands::Backup { dst, id } => {
            commands::backup::backup(&target, id.as_deref(), &dst)?;
        }
        Commands::Restore { src, id } => {
            commands::backup::restore(&target, id.as_deref(), &src)?;
        }
        Commands::RemoveStorage { id } => {
            commands::backup::remove_storage(&target, &id)?;
        }
        Commands::Version => {}
    }

    Ok(())
}
