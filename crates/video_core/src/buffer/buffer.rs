//! Cached buffer metadata.
//!
//! A `Buffer` describes one device allocation mirroring the guest range
//! `[cpu_addr, cpu_addr + size)`. It never owns the device memory directly:
//! the [`BufferPool`](super::BufferPool) creates and destroys the handle.

use crate::common::addr::{AddrRange, VAddr};
use crate::device::{BufferHandle, DeviceBuffer};

/// Access pattern a device allocation is optimised for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Host-visible, written by the CPU and read once by the GPU.
    Upload,
    /// Host-visible, written by the GPU and read back by the CPU.
    Download,
    /// Host-visible ring for transient per-draw data.
    Stream,
    /// Device-local storage; the usage class of every cached buffer.
    DeviceLocal,
}

/// A cached buffer covering a range of guest memory.
#[derive(Debug, Clone)]
pub struct Buffer {
    cpu_addr: VAddr,
    size: u64,
    handle: BufferHandle,
    device_address: u64,
    usage: MemoryUsage,
    stream_score: u32,
    is_deleted: bool,
}

impl Buffer {
    /// Wraps a freshly created device buffer covering `[cpu_addr, cpu_addr + size)`.
    pub fn new(cpu_addr: VAddr, size: u64, device_buffer: DeviceBuffer, usage: MemoryUsage) -> Self {
        Self {
            cpu_addr,
            size,
            handle: device_buffer.handle,
            device_address: device_buffer.device_address,
            usage,
            stream_score: 0,
            is_deleted: false,
        }
    }

    /// Returns the first guest address mirrored by the buffer.
    #[inline(always)]
    pub const fn cpu_addr(&self) -> VAddr {
        self.cpu_addr
    }

    /// Returns the buffer size in bytes.
    #[inline(always)]
    pub const fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Returns the guest range mirrored by the buffer.
    #[inline(always)]
    pub const fn range(&self) -> AddrRange {
        AddrRange::from_size(self.cpu_addr, self.size)
    }

    /// Returns the device handle.
    #[inline(always)]
    pub const fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Returns the address shaders use to reach the buffer directly.
    pub const fn device_address(&self) -> u64 {
        self.device_address
    }

    /// Returns the usage class.
    pub const fn usage(&self) -> MemoryUsage {
        self.usage
    }

    /// Returns `true` if `[addr, addr + size)` lies inside the buffer.
    pub const fn is_in_bounds(&self, addr: VAddr, size: u64) -> bool {
        self.range().contains(&AddrRange::from_size(addr, size))
    }

    /// Returns the byte offset of guest address `addr` inside the buffer.
    #[inline(always)]
    pub fn offset(&self, addr: VAddr) -> u64 {
        debug_assert!(addr >= self.cpu_addr, "{addr:#x} below buffer base {:#x}", self.cpu_addr);
        addr - self.cpu_addr
    }

    /// Returns the accumulated stream score.
    pub const fn stream_score(&self) -> u32 {
        self.stream_score
    }

    /// Adds `score` to the stream score.
    pub fn increase_stream_score(&mut self, score: u32) {
        self.stream_score = self.stream_score.saturating_add(score);
    }

    /// Returns `true` once the buffer has been tombstoned.
    pub const fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub(super) fn mark_deleted(&mut self) {
        self.is_deleted = true;
    }
}
