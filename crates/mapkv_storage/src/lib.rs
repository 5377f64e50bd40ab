//! # MapKV Storage
//!
//! Mapped region management for MapKV.
//!
//! This crate provides the lowest-level storage abstraction for MapKV.
//! Regions are **opaque, fixed-size byte stores** that can be resized on
//! request - they do not interpret the data they hold.
//!
//! ## Design Principles
//!
//! - Regions expose their bytes as slices (read, write, flush, resize)
//! - No knowledge of headers, records, encryption or locking
//! - Must be `Send + Sync` so a store can be shared across threads
//! - The core crate owns all format interpretation and growth policy
//!
//! ## Available Regions
//!
//! - [`MappedRegion`] - Shared `mmap` of a file, for persistent stores
//! - [`MemoryRegion`] - Heap buffer, for testing
//!
//! ## Example
//!
//! ```rust
//! use mapkv_storage::{MemoryRegion, Region};
//!
//! let mut region = MemoryRegion::new(32);
//! region.write_at(0, b"hello world").unwrap();
//! assert_eq!(region.read(0, 11).unwrap(), b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod mapped;
mod memory;
mod region;

pub use error::{StorageError, StorageResult};
pub use mapped::MappedRegion;
pub use memory::MemoryRegion;
pub use region::Region;

/// Page granularity used for capacity rounding.
pub const PAGE_SIZE: u64 = 4096;

/// Rounds `n` up to a multiple of [`PAGE_SIZE`], with a minimum of one page.
#[must_use]
pub const fn round_to_page(n: u64) -> u64 {
    if n <= PAGE_SIZE {
        return PAGE_SIZE;
    }
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}
