//! Collaborator boundaries.
//!
//! This module defines the traits the cache calls out through besides the device and guest
//! memory. It provides:
//! 1. **PageWatcher:** The host page-protection manager that reports CPU accesses to tracked pages.
//! 2. **TextureCache:** The sibling image cache that may hold newer data than guest memory.
//!
//! Both come with no-op implementations for configurations without the collaborator.

use crate::common::addr::VAddr;
use crate::device::BufferHandle;

/// Host page-protection manager.
///
/// The cache asks it to watch pages for CPU writes once their contents have been uploaded, so
/// the next write calls back into `invalidate_memory`, and to watch for CPU reads while the GPU
/// holds newer data, so the next read calls back into `read_memory`.
pub trait PageWatcher: Send + Sync {
    /// Starts (`watch == true`) or stops watching `[addr, addr + size)` for CPU writes.
    fn update_write_watch(&self, addr: VAddr, size: u64, watch: bool);

    /// Starts or stops watching `[addr, addr + size)` for CPU reads.
    fn update_read_watch(&self, addr: VAddr, size: u64, watch: bool) {
        let _ = (addr, size, watch);
    }
}

/// A watcher that ignores every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPageWatcher;

impl PageWatcher for NullPageWatcher {
    fn update_write_watch(&self, _addr: VAddr, _size: u64, _watch: bool) {}
}

/// The image cache living next to the buffer cache.
pub trait TextureCache: Send + Sync {
    /// Copies the GPU-modified image backing `[addr, addr + size)`, if any, into `dst` at
    /// `dst_offset`.
    ///
    /// # Returns
    ///
    /// `true` if an image covered the range and the copy was recorded.
    fn copy_to_buffer(&self, addr: VAddr, size: u64, dst: BufferHandle, dst_offset: u64) -> bool;
}

/// A texture cache that never holds an image.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTextureCache;

impl TextureCache for NullTextureCache {
    fn copy_to_buffer(&self, _addr: VAddr, _size: u64, _dst: BufferHandle, _dst_offset: u64) -> bool {
        false
    }
}
