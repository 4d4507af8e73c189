//! Invalidation, commits, read waits and the download worker.
//!
//! GPU writes reach guest memory in three steps:
//! 1. **Commit:** GPU-modified ranges not yet scheduled are copied into a download staging span
//!    and queued with the device tick the copies belong to and a fresh signal tick.
//! 2. **Worker:** A single thread waits for each queued tick in order, writes the staged bytes
//!    back to guest memory and publishes the signal tick.
//! 3. **Read:** `read_memory` blocks until `download_tick` reaches the signal tick recorded on
//!    every page of the range.
//!
//! A download only writes back bytes that are still pending and still owned by it when it
//! completes: CPU writes remove bytes from the pending set, and a later commit over the same
//! bytes takes ownership of them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, trace, warn};

use super::{BufferCache, CacheShared, request_range};
use crate::buffer::MemoryUsage;
use crate::common::addr::{AddrRange, VAddr, align_up};
use crate::common::constants::{CACHING_PAGEBITS, CACHING_PAGESIZE, STAGING_ALIGNMENT};
use crate::common::error::{CacheError, CacheResult};
use crate::device::{Barrier, BufferCopy, BufferHandle};
use crate::range::RangeSet;

/// Monotonic counter with blocking waits.
pub(crate) struct TickSignal {
    value: AtomicU64,
    lock: Mutex<()>,
    changed: Condvar,
}

impl TickSignal {
    pub(crate) fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Raises the counter to `tick` and wakes every waiter.
    pub(crate) fn publish(&self, tick: u64) {
        let _guard = self.lock.lock();
        let _ = self.value.fetch_max(tick, Ordering::AcqRel);
        let _ = self.changed.notify_all();
    }

    /// Blocks until the counter reaches `target`; returns `true` if it had to wait.
    pub(crate) fn wait_for(&self, target: u64) -> bool {
        if self.get() >= target {
            return false;
        }
        let mut guard = self.lock.lock();
        while self.get() < target {
            self.changed.wait(&mut guard);
        }
        true
    }
}

/// Write-back run by the worker once the download's GPU tick has completed.
type DownloadCallback = Box<dyn FnOnce(&CacheShared) + Send>;

/// A queued download.
struct PendingDownload {
    callback: DownloadCallback,
    gpu_tick: u64,
    signal_tick: u64,
    /// Temporary staging buffer to destroy if the download is discarded.
    temp: Option<BufferHandle>,
}

#[derive(Default)]
struct QueueState {
    downloads: VecDeque<PendingDownload>,
    stop: bool,
}

/// FIFO of pending downloads shared with the worker.
pub(crate) struct DownloadQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl DownloadQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        }
    }

    fn push(&self, download: PendingDownload) {
        self.state.lock().downloads.push_back(download);
        let _ = self.available.notify_one();
    }

    /// Blocks for the next download; `None` once a stop was requested.
    fn pop(&self) -> Option<PendingDownload> {
        let mut state = self.state.lock();
        loop {
            if state.stop {
                return None;
            }
            if let Some(download) = state.downloads.pop_front() {
                return Some(download);
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn request_stop(&self) {
        self.state.lock().stop = true;
        let _ = self.available.notify_all();
    }

    fn take_remaining(&self) -> Vec<PendingDownload> {
        self.state.lock().downloads.drain(..).collect()
    }
}

/// Starts the download worker.
pub(crate) fn spawn_worker(shared: Arc<CacheShared>) -> CacheResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("buffer-download".into())
        .spawn(move || download_thread(&shared))
        .map_err(|err| CacheError::WorkerSpawn(err.to_string()))
}

fn download_thread(shared: &CacheShared) {
    debug!("download worker started");
    while let Some(download) = shared.queue.pop() {
        shared.device.wait_tick(download.gpu_tick);
        (download.callback)(shared);
        shared.download_tick.publish(download.signal_tick);
        trace!(signal_tick = download.signal_tick, "download published");
    }

    // Queued write-backs are dropped, but their ticks are still published so no reader stays
    // blocked on a download that will never run.
    let discarded = shared.queue.take_remaining();
    let last = discarded.iter().map(|d| d.signal_tick).max();
    for download in &discarded {
        if let Some(handle) = download.temp {
            shared.device.destroy_buffer(handle);
        }
    }
    if let Some(tick) = last {
        shared.download_tick.publish(tick);
    }
    debug!(discarded = discarded.len(), "download worker stopped");
}

/// A contiguous guest range staged at `staging_offset`.
#[derive(Clone, Copy, Debug)]
struct StagedRange {
    range: AddrRange,
    staging_offset: u64,
}

/// Writes back the parts of `staged` still owned by `signal_tick` and retires them.
fn complete_download(
    shared: &CacheShared,
    staging: BufferHandle,
    staged: &[StagedRange],
    signal_tick: u64,
) {
    let mut state = shared.state.write();
    let mut owned = RangeSet::new();
    for piece in staged {
        state
            .download_owners
            .for_each_in_range(piece.range, |entry, owner| {
                if owner != signal_tick {
                    return;
                }
                if let Some(clip) = entry.intersect(&piece.range) {
                    owned.add(clip);
                }
            });
    }

    let mut bytes = 0;
    for piece in staged {
        for range in owned.intersection(piece.range) {
            let mut data = vec![0u8; range.len() as usize];
            let offset = piece.staging_offset + (range.begin - piece.range.begin);
            let written = shared
                .device
                .read_buffer(staging, offset, &mut data)
                .map_err(CacheError::from)
                .and_then(|()| shared.memory.write(range.begin, &data));
            match written {
                Ok(()) => bytes += range.len(),
                Err(err) => warn!(%range, %err, "download write-back failed"),
            }
        }
    }

    let retired = owned.difference(&state.rewritten_ranges);
    for range in owned.iter() {
        state.download_owners.subtract(range);
        state.pending_download_ranges.subtract(range);
    }
    for range in retired.iter() {
        state.gpu_modified_ranges.subtract(range);
    }
    for range in retired.iter() {
        state.release_gpu_pages(range);
    }
    state.stats.downloads_completed += 1;
    trace!(signal_tick, bytes, "download written back");
}

impl BufferCache {
    /// Handles a CPU write to `[device_addr, device_addr + size)`.
    ///
    /// The range becomes CPU modified and leaves the GPU-modified and pending sets, so no
    /// download overwrites the new CPU data. Buffers lying entirely inside the range are
    /// deleted. Never waits on the GPU.
    pub fn invalidate_memory(&self, device_addr: VAddr, size: u64) -> CacheResult<()> {
        let range = request_range(device_addr, size)?;
        let mut guard = self.shared.lock();
        let state = &mut *guard.state;
        state.stats.invalidations += 1;
        state.memory_tracker.mark_region_as_cpu_modified(range);
        state.gpu_modified_ranges.subtract(range);
        state.pending_download_ranges.subtract(range);
        state.rewritten_ranges.subtract(range);
        state.download_owners.subtract(range);
        state.release_gpu_pages(range);

        let overlapping = state.buffer_ranges.values_in_range(range);
        if overlapping.is_empty() {
            return Ok(());
        }
        if self.shared.config.general.bda_enabled {
            state.dma_sync_ranges.add(range);
        }
        for id in overlapping {
            if range.contains(&guard.pool[id].range()) {
                trace!(%id, %range, "buffer superseded by CPU write");
                guard.delete_buffer(id);
            }
        }
        Ok(())
    }

    /// Blocks until every download the pages of `[device_addr, device_addr + size)` depend on
    /// has been written back.
    ///
    /// Must not be called while holding a cache lock.
    pub fn read_memory(&self, device_addr: VAddr, size: u64) -> CacheResult<()> {
        let range = request_range(device_addr, size)?;
        let target = {
            let state = self.shared.state.read();
            let first = range.begin >> CACHING_PAGEBITS;
            let last = align_up(range.end, CACHING_PAGESIZE) >> CACHING_PAGEBITS;
            (first..last)
                .map(|page| state.page_table.get(page).target_tick)
                .max()
                .unwrap_or(0)
        };
        if target > self.shared.download_tick.get() {
            self.shared.state.write().stats.read_waits += 1;
            let _ = self.shared.download_tick.wait_for(target);
        }
        Ok(())
    }

    /// Schedules every GPU-modified range not yet scheduled for download.
    ///
    /// Ranges rewritten by the GPU since they were scheduled are scheduled again.
    ///
    /// # Arguments
    ///
    /// * `wait_done` - Block until the worker has written the data back.
    ///
    /// # Returns
    ///
    /// `true` if a download was scheduled; `false` when there was nothing to do.
    #[instrument(skip(self), level = "debug")]
    pub fn commit_pending_downloads(&self, wait_done: bool) -> CacheResult<bool> {
        let _ = self.reclaim();
        let mut guard = self.shared.lock();

        let mut scheduled = guard
            .state
            .gpu_modified_ranges
            .difference(&guard.state.pending_download_ranges);
        for range in guard.state.rewritten_ranges.iter() {
            scheduled.add(range);
        }
        if scheduled.is_empty() {
            return Ok(false);
        }

        // Clip every scheduled range to the buffers holding it.
        let mut pieces = Vec::new();
        let mut copies: Vec<(BufferHandle, Vec<BufferCopy>)> = Vec::new();
        let mut total = 0;
        for range in scheduled.iter() {
            guard.for_each_buffer_in_range(range, |_, buffer| {
                let Some(clip) = buffer.range().intersect(&range) else {
                    return;
                };
                let copy = BufferCopy {
                    src_offset: buffer.offset(clip.begin),
                    dst_offset: total,
                    size: clip.len(),
                };
                match copies.last_mut() {
                    Some((handle, list)) if *handle == buffer.handle() => list.push(copy),
                    _ => copies.push((buffer.handle(), vec![copy])),
                }
                pieces.push(StagedRange {
                    range: clip,
                    staging_offset: total,
                });
                total += clip.len();
            });
        }
        if total == 0 {
            return Ok(false);
        }

        let signal_tick = guard.state.current_download_tick + 1;
        let device = self.shared.device.as_ref();
        let download_tick = &self.shared.download_tick;
        let mapped = {
            let mut utility = self.shared.utility.lock();
            let ring = &mut utility.download;
            ring.map(total, STAGING_ALIGNMENT, signal_tick, |tick| {
                download_tick.get() >= tick
            })
            .map(|offset| (ring.handle(), offset))
        };
        let (staging, base, temp) = match mapped {
            Some((handle, offset)) => (handle, offset, None),
            None => {
                let usage = MemoryUsage::Download;
                let buffer = device
                    .create_buffer(total, usage)
                    .map_err(|err| CacheError::from_alloc(err, usage))?;
                (buffer.handle, 0, Some(buffer.handle))
            }
        };

        device.barrier(Barrier::ShaderToTransfer);
        for (src, mut regions) in copies {
            for region in &mut regions {
                region.dst_offset += base;
            }
            device.copy_buffer(src, staging, &regions)?;
        }
        device.barrier(Barrier::TransferToHost);
        for piece in &mut pieces {
            piece.staging_offset += base;
        }

        let state = &mut *guard.state;
        state.current_download_tick = signal_tick;
        for range in scheduled.iter() {
            state.pending_download_ranges.add(range);
            state.download_owners.add(range, signal_tick);
            let first = range.begin >> CACHING_PAGEBITS;
            let last = align_up(range.end, CACHING_PAGESIZE) >> CACHING_PAGEBITS;
            state
                .page_table
                .update_range(first..last, |_, page| page.target_tick = signal_tick);
        }
        state.rewritten_ranges.clear();
        state.stats.downloads_scheduled += 1;
        state.stats.download_bytes += total;

        let gpu_tick = device.flush();
        let callback: DownloadCallback = Box::new(move |shared: &CacheShared| {
            complete_download(shared, staging, &pieces, signal_tick);
            if let Some(handle) = temp {
                shared.device.destroy_buffer(handle);
            }
        });
        self.shared.queue.push(PendingDownload {
            callback,
            gpu_tick,
            signal_tick,
            temp,
        });
        drop(guard);
        debug!(signal_tick, gpu_tick, bytes = total, "download scheduled");

        if wait_done {
            let _ = self.shared.download_tick.wait_for(signal_tick);
        }
        Ok(true)
    }
}
