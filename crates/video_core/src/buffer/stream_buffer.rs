//! Ring allocator over a utility buffer.
//!
//! Each utility buffer is one device allocation carved up linearly. Every
//! mapped span is watched with the tick that releases it: the device tick for
//! spans only the GPU reads, the download signal tick for spans the download
//! worker reads back. The cursor wraps to the start once the tail is
//! exhausted, and a span can only be reused after its tick is done. Mapping
//! never blocks: when the next span is still in use `map` returns `None` and
//! the caller falls back to a temporary buffer.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;

use super::buffer::MemoryUsage;
use crate::common::addr::align_up;
use crate::common::error::{CacheError, CacheResult};
use crate::device::{BufferHandle, Device};

/// A ring-allocated utility buffer.
pub struct StreamBuffer {
    handle: BufferHandle,
    device_address: u64,
    usage: MemoryUsage,
    capacity: u64,
    cursor: u64,
    /// Mapped spans with the tick that last referenced them, oldest first.
    watches: VecDeque<(Range<u64>, u64)>,
}

impl fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("usage", &self.usage)
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("watches", &self.watches.len())
            .finish()
    }
}

impl StreamBuffer {
    /// Allocates a `capacity`-byte utility buffer for `usage`.
    pub fn new(device: &dyn Device, usage: MemoryUsage, capacity: u64) -> CacheResult<Self> {
        let buffer = device
            .create_buffer(capacity, usage)
            .map_err(|err| CacheError::from_alloc(err, usage))?;
        Ok(Self {
            handle: buffer.handle,
            device_address: buffer.device_address,
            usage,
            capacity,
            cursor: 0,
            watches: VecDeque::new(),
        })
    }

    /// Returns the device handle.
    pub const fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Returns the buffer device address.
    pub const fn device_address(&self) -> u64 {
        self.device_address
    }

    /// Returns the usage class.
    pub const fn usage(&self) -> MemoryUsage {
        self.usage
    }

    /// Returns the total size in bytes.
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the offset the next allocation starts searching from.
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Maps `size` bytes aligned to `alignment`, busy until `tick` is done.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes needed; must be non-zero.
    /// * `alignment` - Power-of-two alignment of the returned offset.
    /// * `tick` - Tick after which the span may be reused.
    /// * `is_done` - Reports whether a previously recorded tick has completed.
    ///
    /// # Returns
    ///
    /// The byte offset of the span, or `None` if `size` exceeds the buffer or the span the
    /// cursor reached is still in use.
    pub fn map(
        &mut self,
        size: u64,
        alignment: u64,
        tick: u64,
        is_done: impl Fn(u64) -> bool,
    ) -> Option<u64> {
        if size == 0 || size > self.capacity {
            return None;
        }
        while let Some((_, watched)) = self.watches.front() {
            if !is_done(*watched) {
                break;
            }
            let _ = self.watches.pop_front();
        }

        let mut offset = align_up(self.cursor, alignment.max(1));
        if offset.checked_add(size).is_none_or(|end| end > self.capacity) {
            offset = 0;
        }
        let span = offset..offset + size;
        let busy = self
            .watches
            .iter()
            .any(|(watched, _)| watched.start < span.end && span.start < watched.end);
        if busy {
            return None;
        }
        self.cursor = span.end;
        self.watches.push_back((span, tick));
        Some(offset)
    }

    /// Releases the device allocation.
    pub fn destroy(&self, device: &dyn Device) {
        device.destroy_buffer(self.handle);
    }
}
