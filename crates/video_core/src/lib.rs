//! GPU buffer cache for console emulators.
//!
//! This crate maps emulated-process addresses onto device buffers and keeps both memories
//! coherent:
//! 1. **Cache:** Obtain, overlap resolution, uploads, invalidation, downloads and fault handling.
//! 2. **Buffers:** Cached buffers, the slot arena and pool that own them, and ring buffers.
//! 3. **Indexing:** The multi-level page table, the interval sets and the address-range index.
//! 4. **Tracking:** Per-page CPU/GPU modification state mirrored to page protection.
//! 5. **Boundaries:** The device, guest memory, page watcher and texture cache interfaces, with
//!    host-memory reference implementations.

/// Cached buffers, the buffer pool and utility ring buffers.
pub mod buffer;
/// The buffer cache and its operations.
pub mod cache;
/// Common types and constants (addresses, ranges, page geometry, errors).
pub mod common;
/// Cache configuration (ring sizes, overlap policy, feature switches).
pub mod config;
/// Device command interface and the host-memory device.
pub mod device;
/// Emulated process memory interface and mmap-backed guest RAM.
pub mod guest;
/// Per-page CPU/GPU modification tracking.
pub mod memory_tracker;
/// Two-level page table keyed by caching page.
pub mod page_table;
/// Interval sets and the split range map.
pub mod range;
/// Cache statistics collection and reporting.
pub mod stats;
/// Page watcher and texture cache collaborator traits.
pub mod traits;

/// Main cache type; construct with `BufferCache::new`.
pub use crate::cache::BufferCache;
/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Error and result types shared by every operation.
pub use crate::common::{CacheError, CacheResult};
