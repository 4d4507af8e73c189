//! Multi-level page table from device address to cached buffer.
//!
//! A two-level radix table over the 40-bit device address space at caching
//! page granularity. The first level is a flat array of lazily allocated
//! second-level chunks, so memory is only spent on regions the GPU touches:
//! 1. **First level:** one slot per 16 MiB of address space (65536 slots).
//! 2. **Second level:** 1024 entries per chunk, one per 16 KiB caching page.
//!
//! Unallocated entries read as `E::default()`.

use std::ops::Range;

use crate::buffer::{BufferId, NULL_BUFFER_ID};
use crate::common::constants::{ADDRESS_SPACE_BITS, CACHING_PAGEBITS};

/// Address bits covered by one second-level chunk.
const FIRST_LEVEL_BITS: u32 = 24;

/// Entries per second-level chunk.
const CHUNK_ENTRIES: usize = 1 << (FIRST_LEVEL_BITS - CACHING_PAGEBITS);

/// Number of first-level slots.
const FIRST_LEVEL_SLOTS: usize = 1 << (ADDRESS_SPACE_BITS - FIRST_LEVEL_BITS);

/// Per-page state: which buffer owns the page and which download it waits on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageData {
    /// Owning buffer, or `NULL_BUFFER_ID` when the page is unmapped.
    pub buffer_id: BufferId,
    /// Download signal tick the host copy of this page depends on (0 = none).
    pub target_tick: u64,
}

impl PageData {
    /// Returns `true` if a buffer is registered over this page.
    #[inline(always)]
    pub fn is_mapped(&self) -> bool {
        self.buffer_id != NULL_BUFFER_ID
    }
}

/// Two-level page table with lazily allocated leaves.
pub struct MultiLevelPageTable<E> {
    first_level: Vec<Option<Box<[E]>>>,
    allocated_chunks: usize,
}

impl<E: Copy + Default> Default for MultiLevelPageTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for MultiLevelPageTable<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelPageTable")
            .field("allocated_chunks", &self.allocated_chunks)
            .finish_non_exhaustive()
    }
}

impl<E: Copy + Default> MultiLevelPageTable<E> {
    /// Creates an empty table; no leaves are allocated.
    pub fn new() -> Self {
        let mut first_level = Vec::with_capacity(FIRST_LEVEL_SLOTS);
        first_level.resize_with(FIRST_LEVEL_SLOTS, || None);
        Self {
            first_level,
            allocated_chunks: 0,
        }
    }

    /// Returns the number of pages addressable by the table.
    pub const fn num_pages() -> u64 {
        (FIRST_LEVEL_SLOTS * CHUNK_ENTRIES) as u64
    }

    /// Returns the number of allocated second-level chunks.
    pub fn allocated_chunks(&self) -> usize {
        self.allocated_chunks
    }

    #[inline(always)]
    fn split(page: u64) -> (usize, usize) {
        let page = page as usize;
        (page / CHUNK_ENTRIES, page % CHUNK_ENTRIES)
    }

    /// Reads the entry for caching page `page`.
    ///
    /// # Arguments
    ///
    /// * `page` - Caching page index (device address >> `CACHING_PAGEBITS`).
    ///
    /// # Returns
    ///
    /// The stored entry, or `E::default()` if the page was never written or is
    /// outside the address space.
    #[inline(always)]
    pub fn get(&self, page: u64) -> E {
        let (slot, index) = Self::split(page);
        self.first_level
            .get(slot)
            .and_then(Option::as_ref)
            .map_or_else(E::default, |chunk| chunk[index])
    }

    /// Returns a mutable reference to the entry for `page`, allocating its chunk.
    ///
    /// # Panics
    ///
    /// Panics if `page` is outside the device address space; callers validate
    /// ranges before touching the table.
    pub fn get_mut(&mut self, page: u64) -> &mut E {
        let (slot, index) = Self::split(page);
        assert!(slot < FIRST_LEVEL_SLOTS, "page {page:#x} outside the device address space");
        let allocated = &mut self.allocated_chunks;
        let chunk = self.first_level[slot].get_or_insert_with(|| {
            *allocated += 1;
            vec![E::default(); CHUNK_ENTRIES].into_boxed_slice()
        });
        &mut chunk[index]
    }

    /// Applies `func` to every entry in `pages`, allocating chunks as needed.
    pub fn update_range(&mut self, pages: Range<u64>, mut func: impl FnMut(u64, &mut E)) {
        #[cfg(feature = "trace-pages")]
        tracing::trace!(
            first = pages.start,
            last = pages.end,
            chunks = self.allocated_chunks(),
            "page table update"
        );
        for page in pages {
            func(page, self.get_mut(page));
        }
    }
}
