//! Buffer pool with tick-deferred reclamation.
//!
//! The pool is the only owner of cached device buffers. Deleting a buffer only
//! tombstones its slot: the device handle may still be referenced by work
//! recorded at the current tick, so it is queued in a graveyard with that tick
//! and destroyed by [`BufferPool::reclaim`] once the device reports the tick
//! done. Temporary buffers (oversized uploads and downloads) share the same
//! graveyard.

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use tracing::{debug, trace};

use super::buffer::{Buffer, MemoryUsage};
use super::slot_vector::SlotVector;
use super::BufferId;
use crate::common::addr::VAddr;
use crate::common::error::{CacheError, CacheResult};
use crate::device::{BufferHandle, Device};

/// A device handle waiting for its last referencing tick to retire.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    /// Slot to free alongside the handle; `None` for temporary buffers.
    id: Option<BufferId>,
    handle: BufferHandle,
    tick: u64,
}

/// Slot arena owning every cached buffer.
pub struct BufferPool {
    slots: SlotVector<Buffer>,
    graveyard: VecDeque<Tombstone>,
    device: Arc<dyn Device>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("slots", &self.slots)
            .field("graveyard", &self.graveyard.len())
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Creates an empty pool allocating from `device`.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            slots: SlotVector::new(),
            graveyard: VecDeque::new(),
            device,
        }
    }

    /// Allocates a device-local buffer mirroring `[cpu_addr, cpu_addr + size)`.
    ///
    /// # Returns
    ///
    /// The new buffer id, or `CacheError::DeviceMemoryExhausted` when the device refuses the
    /// allocation.
    pub fn create(&mut self, cpu_addr: VAddr, size: u64) -> CacheResult<BufferId> {
        let usage = MemoryUsage::DeviceLocal;
        let device_buffer = self
            .device
            .create_buffer(size, usage)
            .map_err(|err| CacheError::from_alloc(err, usage))?;
        let id = self
            .slots
            .insert(Buffer::new(cpu_addr, size, device_buffer, usage));
        trace!(%id, cpu_addr, size, "buffer created");
        Ok(id)
    }

    /// Returns the buffer in `id`, tombstoned or not.
    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.slots.get(id)
    }

    /// Returns `true` for the null id, a freed slot, or a tombstoned buffer.
    pub fn is_invalid(&self, id: BufferId) -> bool {
        self.slots.get(id).is_none_or(Buffer::is_deleted)
    }

    /// Tombstones `id`; its device buffer is destroyed by a later [`reclaim`](Self::reclaim).
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a live buffer.
    pub fn delete(&mut self, id: BufferId) {
        let tick = self.device.current_tick();
        let buffer = self
            .slots
            .get_mut(id)
            .unwrap_or_else(|| panic!("deleting unknown buffer {id}"));
        assert!(!buffer.is_deleted(), "buffer {id} deleted twice");
        buffer.mark_deleted();
        self.graveyard.push_back(Tombstone {
            id: Some(id),
            handle: buffer.handle(),
            tick,
        });
        trace!(%id, tick, "buffer tombstoned");
    }

    /// Queues a temporary device buffer for destruction after the current tick.
    pub fn defer_destroy(&mut self, handle: BufferHandle) {
        self.graveyard.push_back(Tombstone {
            id: None,
            handle,
            tick: self.device.current_tick(),
        });
    }

    /// Destroys every tombstoned buffer whose tick has completed.
    ///
    /// # Returns
    ///
    /// The number of device buffers destroyed.
    pub fn reclaim(&mut self) -> usize {
        let mut destroyed = 0;
        while let Some(tomb) = self.graveyard.front().copied() {
            if !self.device.is_tick_done(tomb.tick) {
                break;
            }
            let _ = self.graveyard.pop_front();
            if let Some(id) = tomb.id {
                let _ = self.slots.remove(id);
            }
            self.device.destroy_buffer(tomb.handle);
            destroyed += 1;
        }
        if destroyed > 0 {
            debug!(destroyed, pending = self.graveyard.len(), "reclaimed buffers");
        }
        destroyed
    }

    /// Returns the number of live (not tombstoned) buffers.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|(_, b)| !b.is_deleted()).count()
    }

    /// Returns the number of handles waiting in the graveyard.
    pub fn pending_reclaim(&self) -> usize {
        self.graveyard.len()
    }

    /// Iterates live buffers in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = (BufferId, &Buffer)> {
        self.slots.iter().filter(|(_, b)| !b.is_deleted())
    }
}

impl Index<BufferId> for BufferPool {
    type Output = Buffer;

    fn index(&self, id: BufferId) -> &Buffer {
        self.slots
            .get(id)
            .unwrap_or_else(|| panic!("no buffer in slot {id}"))
    }
}

impl IndexMut<BufferId> for BufferPool {
    fn index_mut(&mut self, id: BufferId) -> &mut Buffer {
        self.slots
            .get_mut(id)
            .unwrap_or_else(|| panic!("no buffer in slot {id}"))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for tomb in self.graveyard.drain(..) {
            if tomb.id.is_none() {
                self.device.destroy_buffer(tomb.handle);
            }
        }
        for buffer in self.slots.drain() {
            self.device.destroy_buffer(buffer.handle());
        }
    }
}
