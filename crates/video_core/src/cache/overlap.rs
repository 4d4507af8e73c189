//! Overlap resolution, buffer creation and registration.
//!
//! A new buffer always replaces every buffer it intersects: overlap resolution widens the
//! requested range to the union of all intersecting buffers, the replacement copies their
//! contents at the right offsets, and the old buffers are deleted. Address-keyed bookkeeping
//! (GPU-modified and pending ranges, page target ticks) carries over unchanged because it never
//! referred to buffer ids.
//!
//! Regions that keep being re-created by growth look like streams. Each buffer carries a stream
//! score (one plus the scores of the buffers it absorbed); once the scores met during one
//! resolution exceed `stream_leap_threshold`, the range is pre-grown by `stream_leap_pages`
//! caching pages on the side opposite the growth and the new buffer starts a fresh score.

use tracing::{debug, trace, warn};

use super::{BufferCache, CacheGuard, CacheState, OverlapResult, request_range};
use crate::buffer::{Buffer, BufferId, BufferPool, NULL_BUFFER_ID};
use crate::common::addr::{AddrRange, VAddr, align_down, align_up};
use crate::common::constants::{ADDRESS_SPACE_END, CACHING_PAGEBITS, CACHING_PAGESIZE};
use crate::common::error::CacheResult;
use crate::config::OverlapConfig;
use crate::device::{Barrier, BufferCopy};

/// Lowest address a stream leap may grow down to; page zero stays unmapped.
const MIN_LEAP_ADDR: VAddr = CACHING_PAGESIZE;

/// Returns the caching page range covering `range`.
pub(crate) fn caching_pages(range: AddrRange) -> std::ops::Range<u64> {
    (range.begin >> CACHING_PAGEBITS)..(align_up(range.end, CACHING_PAGESIZE) >> CACHING_PAGEBITS)
}

/// Returns the live buffer fully covering `range`, or the null id.
pub(crate) fn find_buffer_in(state: &CacheState, pool: &BufferPool, range: AddrRange) -> BufferId {
    let id = state.page_table.get(range.begin >> CACHING_PAGEBITS).buffer_id;
    if id.is_null() {
        return NULL_BUFFER_ID;
    }
    let buffer = &pool[id];
    debug_assert!(!buffer.is_deleted(), "page table points at tombstoned buffer {id}");
    if buffer.is_in_bounds(range.begin, range.len()) {
        id
    } else {
        NULL_BUFFER_ID
    }
}

/// Calls `func` for each buffer registered over `range`, jumping over each buffer's extent.
pub(crate) fn for_each_buffer_in(
    state: &CacheState,
    pool: &BufferPool,
    range: AddrRange,
    mut func: impl FnMut(BufferId, &Buffer),
) {
    let pages = caching_pages(range);
    let mut page = pages.start;
    while page < pages.end {
        let id = state.page_table.get(page).buffer_id;
        if id.is_null() {
            page += 1;
            continue;
        }
        let buffer = &pool[id];
        func(id, buffer);
        page = align_up(buffer.range().end, CACHING_PAGESIZE) >> CACHING_PAGEBITS;
    }
}

/// Computes the unified range and the buffers a new buffer over `range` must absorb.
pub(crate) fn resolve_overlaps_in(
    state: &CacheState,
    pool: &BufferPool,
    policy: &OverlapConfig,
    range: AddrRange,
) -> OverlapResult {
    let mut result = OverlapResult {
        ids: Vec::new(),
        begin: range.begin,
        end: range.end,
        has_stream_leap: false,
    };
    let leap = policy.stream_leap_pages.saturating_mul(CACHING_PAGESIZE);
    let mut stream_score: u64 = 0;

    let mut page = result.begin >> CACHING_PAGEBITS;
    while page < align_up(result.end, CACHING_PAGESIZE) >> CACHING_PAGEBITS {
        let id = state.page_table.get(page).buffer_id;
        page += 1;
        if id.is_null() || result.ids.contains(&id) {
            continue;
        }
        let overlap = &pool[id];
        debug_assert!(!overlap.is_deleted(), "page table points at tombstoned buffer {id}");
        result.ids.push(id);

        let overlap_range = overlap.range();
        let expands_left = overlap_range.begin < result.begin;
        let expands_right = overlap_range.end > result.end;
        result.begin = result.begin.min(overlap_range.begin);
        result.end = result.end.max(overlap_range.end);
        page = page.max(align_up(overlap_range.end, CACHING_PAGESIZE) >> CACHING_PAGEBITS);

        stream_score += u64::from(overlap.stream_score());
        if stream_score > u64::from(policy.stream_leap_threshold) && !result.has_stream_leap {
            result.has_stream_leap = true;
            if expands_right {
                let floor = MIN_LEAP_ADDR.min(result.begin);
                result.begin = result.begin.saturating_sub(leap).max(floor);
                // Rescan from the new start for buffers the growth now reaches.
                page = result.begin >> CACHING_PAGEBITS;
            }
            if expands_left {
                result.end = result.end.saturating_add(leap).min(ADDRESS_SPACE_END);
            }
        }
    }
    result
}

impl CacheGuard<'_> {
    pub(crate) fn find_buffer(&self, range: AddrRange) -> BufferId {
        find_buffer_in(&self.state, &self.pool, range)
    }

    pub(crate) fn for_each_buffer_in_range(&self, range: AddrRange, func: impl FnMut(BufferId, &Buffer)) {
        for_each_buffer_in(&self.state, &self.pool, range, func);
    }

    /// Creates a buffer covering at least `range`, absorbing every buffer it overlaps.
    pub(crate) fn create_buffer(&mut self, range: AddrRange) -> CacheResult<BufferId> {
        let aligned = AddrRange::new(
            align_down(range.begin, CACHING_PAGESIZE),
            align_up(range.end, CACHING_PAGESIZE),
        );
        let overlap = resolve_overlaps_in(&self.state, &self.pool, &self.shared.config.overlap, aligned);
        if overlap.has_stream_leap {
            self.state.stats.stream_leaps += 1;
            debug!(begin = overlap.begin, end = overlap.end, "stream leap");
        }
        let size = overlap.end - overlap.begin;
        let new_id = self.pool.create(overlap.begin, size)?;
        // Overlaps are only deleted once every copy out of them was recorded.
        if let Err(err) = self.fill_and_join(new_id, &overlap) {
            self.pool.delete(new_id);
            return Err(err);
        }
        for &overlap_id in &overlap.ids {
            self.delete_buffer(overlap_id);
            self.state.stats.overlaps_joined += 1;
        }
        self.register(new_id)?;
        self.state.stats.buffers_created += 1;
        trace!(id = %new_id, range = %self.pool[new_id].range(), absorbed = overlap.ids.len(), "buffer ready");
        Ok(new_id)
    }

    /// Clears `new_id` and copies every buffer of `overlap` into it.
    fn fill_and_join(&mut self, new_id: BufferId, overlap: &OverlapResult) -> CacheResult<()> {
        let new_buffer = &self.pool[new_id];
        self.shared
            .device
            .fill_buffer(new_buffer.handle(), 0, new_buffer.size_bytes(), 0)?;
        for &overlap_id in &overlap.ids {
            self.join_overlap(new_id, overlap_id, !overlap.has_stream_leap)?;
        }
        Ok(())
    }

    /// Copies the contents of `overlap_id` into `new_id`.
    ///
    /// The overlap stays registered; the caller deletes it once all joins succeeded.
    fn join_overlap(
        &mut self,
        new_id: BufferId,
        overlap_id: BufferId,
        accumulate_stream_score: bool,
    ) -> CacheResult<()> {
        let overlap = &self.pool[overlap_id];
        let score = overlap.stream_score();
        let src = overlap.handle();
        let overlap_range = overlap.range();
        let new_buffer = &self.pool[new_id];
        let copy = BufferCopy {
            src_offset: 0,
            dst_offset: new_buffer.offset(overlap_range.begin),
            size: overlap_range.len(),
        };
        let dst = new_buffer.handle();

        let device = self.shared.device.as_ref();
        device.barrier(Barrier::ShaderToTransfer);
        device.copy_buffer(src, dst, &[copy])?;
        device.barrier(Barrier::TransferToShader);

        if accumulate_stream_score {
            self.pool[new_id].increase_stream_score(score + 1);
        }
        Ok(())
    }

    pub(crate) fn register(&mut self, id: BufferId) -> CacheResult<()> {
        self.change_register(id, true)
    }

    pub(crate) fn unregister(&mut self, id: BufferId) -> CacheResult<()> {
        self.change_register(id, false)
    }

    /// Updates the page table and range index, then the BDA entries of `id`.
    ///
    /// A failed BDA write leaves the structural update in place.
    fn change_register(&mut self, id: BufferId, insert: bool) -> CacheResult<()> {
        let buffer = &self.pool[id];
        let range = buffer.range();
        let device_address = buffer.device_address();
        let pages = caching_pages(range);

        self.state.page_table.update_range(pages.clone(), |page, entry| {
            if insert {
                assert!(
                    entry.buffer_id.is_null(),
                    "page {page:#x} already owned by buffer {}",
                    entry.buffer_id
                );
                entry.buffer_id = id;
            } else {
                debug_assert_eq!(entry.buffer_id, id, "page {page:#x} not owned by buffer {id}");
                entry.buffer_id = NULL_BUFFER_ID;
            }
        });
        if insert {
            self.state.buffer_ranges.add(range, id);
        } else {
            self.state.buffer_ranges.subtract(range);
        }
        debug_assert!(self.state.buffer_ranges.is_disjoint());

        if let Some(table) = &self.shared.fixed.bda_pagetable {
            let entries: Vec<u8> = (0..pages.end - pages.start)
                .flat_map(|i| {
                    let addr = if insert {
                        device_address + (i << CACHING_PAGEBITS)
                    } else {
                        0
                    };
                    addr.to_le_bytes()
                })
                .collect();
            self.shared
                .device
                .write_buffer(table.handle(), pages.start * 8, &entries)?;
        }
        Ok(())
    }

    /// Unregisters `id` and tombstones it.
    pub(crate) fn delete_buffer(&mut self, id: BufferId) {
        // Unregistering only fails on a BDA table write, which covers in-bounds pages.
        if let Err(err) = self.unregister(id) {
            warn!(%id, %err, "failed to clear BDA entries");
        }
        self.pool.delete(id);
        self.state.stats.buffers_deleted += 1;
    }
}

impl BufferCache {
    /// Resolves the buffers a new buffer over `[device_addr, device_addr + size)` would absorb.
    ///
    /// The range is first widened to caching pages, exactly as buffer creation does. Nothing is
    /// modified.
    ///
    /// # Returns
    ///
    /// The intersecting buffer ids, the unified range and whether a stream leap fired.
    pub fn resolve_overlaps(&self, device_addr: VAddr, size: u64) -> CacheResult<OverlapResult> {
        let range = request_range(device_addr, size)?.align_outward(CACHING_PAGESIZE);
        let (state, pool) = self.shared.lock_read();
        Ok(resolve_overlaps_in(&state, &pool, &self.shared.config.overlap, range))
    }
}
