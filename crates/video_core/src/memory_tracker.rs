//! Per-page CPU/GPU modification tracking.
//!
//! Guest memory is tracked at 4 KiB host-page granularity in 4 MiB regions, each holding two
//! bitsets:
//! 1. **CPU modified:** the page changed on the CPU since it was last uploaded. Pages never seen
//!    by the cache are CPU modified, so regions are only allocated once a page is cleaned.
//! 2. **GPU modified:** the GPU wrote the page and the host copy is stale until downloaded.
//!
//! Every transition is mirrored to the [`PageWatcher`]: clean pages are write-watched so the next
//! CPU write is reported, and GPU-modified pages are read-watched when readbacks are enabled.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::addr::{AddrRange, align_up};
use crate::common::constants::{TRACKER_PAGEBITS, TRACKER_PAGESIZE, TRACKER_REGION_BITS};
use crate::traits::PageWatcher;

/// Tracker pages per region.
const PAGES_PER_REGION: u64 = 1 << (TRACKER_REGION_BITS - TRACKER_PAGEBITS);

/// 64-bit words per region bitset.
const WORDS_PER_REGION: usize = (PAGES_PER_REGION / 64) as usize;

#[derive(Debug, Clone)]
struct RegionBits {
    cpu: [u64; WORDS_PER_REGION],
    gpu: [u64; WORDS_PER_REGION],
}

impl Default for RegionBits {
    fn default() -> Self {
        Self {
            cpu: [u64::MAX; WORDS_PER_REGION],
            gpu: [0; WORDS_PER_REGION],
        }
    }
}

#[inline(always)]
fn test(bits: &[u64; WORDS_PER_REGION], index: u64) -> bool {
    bits[(index / 64) as usize] & (1 << (index % 64)) != 0
}

/// Sets or clears one bit; returns `true` if it changed.
#[inline(always)]
fn assign(bits: &mut [u64; WORDS_PER_REGION], index: u64, value: bool) -> bool {
    let word = &mut bits[(index / 64) as usize];
    let mask = 1 << (index % 64);
    let old = *word & mask != 0;
    if value {
        *word |= mask;
    } else {
        *word &= !mask;
    }
    old != value
}

/// Accumulates consecutive pages into byte ranges.
#[derive(Default)]
struct Runs {
    runs: Vec<AddrRange>,
}

impl Runs {
    fn push(&mut self, page: u64) {
        let begin = page << TRACKER_PAGEBITS;
        let end = begin + TRACKER_PAGESIZE;
        match self.runs.last_mut() {
            Some(last) if last.end == begin => last.end = end,
            _ => self.runs.push(AddrRange::new(begin, end)),
        }
    }
}

/// Tracker pages touched by `range`.
fn pages(range: AddrRange) -> std::ops::Range<u64> {
    (range.begin >> TRACKER_PAGEBITS)..(align_up(range.end, TRACKER_PAGESIZE) >> TRACKER_PAGEBITS)
}

/// Page-granular dirty tracking for guest memory.
pub struct MemoryTracker {
    regions: HashMap<u64, Box<RegionBits>>,
    watcher: Arc<dyn PageWatcher>,
    readbacks: bool,
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("regions", &self.regions.len())
            .field("readbacks", &self.readbacks)
            .finish_non_exhaustive()
    }
}

impl MemoryTracker {
    /// Creates a tracker reporting watch changes to `watcher`.
    pub fn new(watcher: Arc<dyn PageWatcher>, readbacks: bool) -> Self {
        Self {
            regions: HashMap::new(),
            watcher,
            readbacks,
        }
    }

    #[inline(always)]
    fn split(page: u64) -> (u64, u64) {
        (page / PAGES_PER_REGION, page % PAGES_PER_REGION)
    }

    fn is_cpu_page(&self, page: u64) -> bool {
        let (region, index) = Self::split(page);
        self.regions.get(&region).is_none_or(|r| test(&r.cpu, index))
    }

    fn is_gpu_page(&self, page: u64) -> bool {
        let (region, index) = Self::split(page);
        self.regions.get(&region).is_some_and(|r| test(&r.gpu, index))
    }

    /// Returns `true` if any page of `range` was modified by the CPU since its last upload.
    pub fn is_region_cpu_modified(&self, range: AddrRange) -> bool {
        pages(range).any(|page| self.is_cpu_page(page))
    }

    /// Returns `true` if any page of `range` holds GPU data not yet downloaded.
    pub fn is_region_gpu_modified(&self, range: AddrRange) -> bool {
        pages(range).any(|page| self.is_gpu_page(page))
    }

    /// Records a CPU write to `range`.
    ///
    /// GPU bits are left alone: a page may still hold GPU bytes outside the written range. The
    /// cache releases them with [`unmark_region_as_gpu_modified`](Self::unmark_region_as_gpu_modified)
    /// once none remain.
    pub fn mark_region_as_cpu_modified(&mut self, range: AddrRange) {
        let mut unwatched = Runs::default();
        for page in pages(range) {
            let (region, index) = Self::split(page);
            // Untracked regions are already CPU modified.
            let Some(bits) = self.regions.get_mut(&region) else {
                continue;
            };
            if assign(&mut bits.cpu, index, true) {
                unwatched.push(page);
            }
        }
        for run in unwatched.runs {
            self.watcher.update_write_watch(run.begin, run.len(), false);
        }
    }

    /// Records a GPU write to `range`; the host copy is stale until downloaded.
    pub fn mark_region_as_gpu_modified(&mut self, range: AddrRange) {
        let mut read_watched = Runs::default();
        for page in pages(range) {
            let (region, index) = Self::split(page);
            let bits = self.regions.entry(region).or_default();
            let _ = assign(&mut bits.cpu, index, false);
            if assign(&mut bits.gpu, index, true) {
                read_watched.push(page);
            }
        }
        if self.readbacks {
            for run in read_watched.runs {
                self.watcher.update_read_watch(run.begin, run.len(), true);
            }
        }
    }

    /// Records that the host copy of `range` is current again (download finished).
    pub fn unmark_region_as_gpu_modified(&mut self, range: AddrRange) {
        let mut unread = Runs::default();
        for page in pages(range) {
            let (region, index) = Self::split(page);
            if let Some(bits) = self.regions.get_mut(&region)
                && assign(&mut bits.gpu, index, false)
            {
                unread.push(page);
            }
        }
        if self.readbacks {
            for run in unread.runs {
                self.watcher.update_read_watch(run.begin, run.len(), false);
            }
        }
    }

    /// Returns the page-aligned runs of `range` modified by the CPU since their last upload.
    ///
    /// Pages may also hold GPU bytes; callers skip those at byte precision. The bits are left
    /// untouched; callers clear them with [`clear_cpu_modified`](Self::clear_cpu_modified) once
    /// the copies are recorded.
    pub fn upload_ranges(&self, range: AddrRange) -> Vec<AddrRange> {
        let mut runs = Runs::default();
        for page in pages(range) {
            if self.is_cpu_page(page) {
                runs.push(page);
            }
        }
        runs.runs
    }

    /// Marks the pages of `runs` clean and starts watching them for CPU writes.
    pub fn clear_cpu_modified(&mut self, runs: &[AddrRange]) {
        for run in runs {
            for page in pages(*run) {
                let (region, index) = Self::split(page);
                let bits = self.regions.entry(region).or_default();
                let _ = assign(&mut bits.cpu, index, false);
            }
            self.watcher.update_write_watch(run.begin, run.len(), true);
        }
    }

    /// Returns the number of allocated 4 MiB regions.
    pub fn tracked_regions(&self) -> usize {
        self.regions.len()
    }
}
