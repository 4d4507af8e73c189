//! Lookup and obtain paths.

use tracing::trace;

use super::overlap::find_buffer_in;
use super::{BufferCache, BufferSlice, CacheGuard, request_range};
use crate::buffer::BufferId;
use crate::common::addr::{AddrRange, VAddr};
use crate::common::error::CacheResult;

impl CacheGuard<'_> {
    /// Returns a synchronized buffer covering `range`, creating it if needed.
    pub(crate) fn obtain(
        &mut self,
        range: AddrRange,
        is_written: bool,
        is_texel_buffer: bool,
        hint: Option<BufferId>,
    ) -> CacheResult<BufferSlice> {
        self.state.stats.obtain_calls += 1;
        let hinted = hint.filter(|&id| {
            !self.pool.is_invalid(id) && self.pool[id].is_in_bounds(range.begin, range.len())
        });
        let found = hinted.unwrap_or_else(|| self.find_buffer(range));
        let id = match found {
            id if id.is_null() => self.create_buffer(range)?,
            id => {
                if !self.state.memory_tracker.is_region_cpu_modified(range) {
                    self.state.stats.fast_path_hits += 1;
                }
                id
            }
        };

        let _ = self.synchronize_buffer(id, range, is_texel_buffer)?;
        if is_written {
            self.mark_gpu_written(range);
        }
        Ok(BufferSlice::new(id, &self.pool[id], range.begin))
    }

    /// Records that the GPU is about to write `range`.
    pub(crate) fn mark_gpu_written(&mut self, range: AddrRange) {
        let state = &mut *self.state;
        for rewritten in state.pending_download_ranges.intersection(range) {
            state.rewritten_ranges.add(rewritten);
        }
        state.gpu_modified_ranges.add(range);
        state.memory_tracker.mark_region_as_gpu_modified(range);
    }
}

impl BufferCache {
    /// Obtains a buffer covering `[gpu_addr, gpu_addr + size)` for a draw or dispatch.
    ///
    /// Reuses a covering buffer when one exists, otherwise creates one absorbing every
    /// overlapping buffer, then uploads the CPU-modified parts of the range.
    ///
    /// # Arguments
    ///
    /// * `gpu_addr` - First guest address accessed.
    /// * `size` - Bytes accessed; zero is treated as one.
    /// * `is_written` - The GPU will write the range; it becomes GPU modified.
    /// * `is_texel_buffer` - Also source newer data from the texture cache.
    /// * `hint` - A buffer id that likely covers the range, checked before the page table.
    ///
    /// # Returns
    ///
    /// The covering buffer and the offset of `gpu_addr` inside it.
    pub fn obtain_buffer(
        &self,
        gpu_addr: VAddr,
        size: u64,
        is_written: bool,
        is_texel_buffer: bool,
        hint: Option<BufferId>,
    ) -> CacheResult<BufferSlice> {
        let range = request_range(gpu_addr, size)?;
        let slice = self.shared.lock().obtain(range, is_written, is_texel_buffer, hint)?;
        trace!(%range, id = %slice.id, offset = slice.offset, is_written, "buffer obtained");
        Ok(slice)
    }

    /// Resolves a buffer for the texture cache without changing which buffers exist.
    ///
    /// Only a single existing buffer covering the whole range qualifies; its CPU-modified parts
    /// are uploaded first.
    ///
    /// # Returns
    ///
    /// The buffer and offset, or `None` when no buffer covers the range.
    pub fn obtain_buffer_for_image(&self, gpu_addr: VAddr, size: u64) -> CacheResult<Option<BufferSlice>> {
        let range = request_range(gpu_addr, size)?;
        let mut guard = self.shared.lock();
        let id = guard.find_buffer(range);
        if id.is_null() {
            return Ok(None);
        }
        let _ = guard.synchronize_buffer(id, range, false)?;
        Ok(Some(BufferSlice::new(id, &guard.pool[id], range.begin)))
    }

    /// Returns the buffer fully covering `[device_addr, device_addr + size)`, or the null id.
    pub fn find_buffer(&self, device_addr: VAddr, size: u64) -> BufferId {
        let Ok(range) = request_range(device_addr, size) else {
            return BufferId::NULL;
        };
        let (state, pool) = self.shared.lock_read();
        find_buffer_in(&state, &pool, range)
    }

    /// Returns `true` if any buffer is registered over part of the range.
    pub fn is_region_registered(&self, addr: VAddr, size: u64) -> bool {
        request_range(addr, size).is_ok_and(|range| {
            !self
                .shared
                .state
                .read()
                .buffer_ranges
                .values_in_range(range)
                .is_empty()
        })
    }

    /// Returns `true` if the CPU modified part of the range since it was last uploaded.
    pub fn is_region_cpu_modified(&self, addr: VAddr, size: u64) -> bool {
        request_range(addr, size).is_ok_and(|range| {
            self.shared
                .state
                .read()
                .memory_tracker
                .is_region_cpu_modified(range)
        })
    }

    /// Returns `true` if the GPU modified part of the range and it was not downloaded yet.
    ///
    /// Byte precise, unlike the CPU query which reports whole tracker pages.
    pub fn is_region_gpu_modified(&self, addr: VAddr, size: u64) -> bool {
        request_range(addr, size).is_ok_and(|range| {
            self.shared.state.read().gpu_modified_ranges.intersects(range)
        })
    }
}
