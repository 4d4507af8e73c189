//! The buffer cache.
//!
//! `BufferCache` maps device addresses onto cached device buffers and keeps them coherent with
//! guest memory. The work is split by concern:
//! 1. **Obtain:** Lookups and the obtain path used by draws and the texture cache.
//! 2. **Overlap:** Overlap resolution, buffer creation, joins and (un)registration.
//! 3. **Sync:** Uploads, inline data, buffer copies and vertex/index binding.
//! 4. **Download:** Invalidation, commits, read waits and the download worker.
//! 5. **Fault:** Fault-buffer processing for buffer device address accesses.
//!
//! # Locking
//!
//! Structural state (range index, page table, tracker, range sets) and the buffer pool sit
//! behind two reader/writer locks, always taken in that order, then the utility-buffer mutex.
//! No lock is held while waiting on the device or on `download_tick`.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{
    MappedMutexGuard, MappedRwLockReadGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferId, BufferPool, MemoryUsage, StreamBuffer};
use crate::common::addr::{AddrRange, VAddr};
use crate::common::constants::{
    ADDRESS_SPACE_END, BDA_PAGETABLE_SIZE, CACHING_PAGEBITS, FAULT_BUFFER_SIZE, TRACKER_PAGESIZE,
};
use crate::common::error::{CacheError, CacheResult};
use crate::config::{Config, StreamConfig};
use crate::device::{BufferHandle, Device, IndexType};
use crate::guest::GuestMemory;
use crate::memory_tracker::MemoryTracker;
use crate::page_table::{MultiLevelPageTable, PageData};
use crate::range::{RangeSet, SplitRangeMap};
use crate::stats::CacheStats;
use crate::traits::{PageWatcher, TextureCache};

/// Invalidation, commits, read waits and the download worker.
mod download;
/// Fault-buffer processing.
mod fault;
/// Lookup and obtain paths.
mod obtain;
/// Overlap resolution and registration.
mod overlap;
/// Uploads and transfer commands.
mod sync;

use download::{DownloadQueue, TickSignal};

/// A cached buffer resolved for one access.
///
/// Handles stay valid until the buffer is reclaimed, which never happens before the work
/// recorded against it completes. The id must be re-resolved after any call that may merge
/// buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSlice {
    /// Cached buffer id.
    pub id: BufferId,
    /// Device handle of the buffer.
    pub handle: BufferHandle,
    /// Byte offset of the requested address inside the buffer.
    pub offset: u64,
    /// Buffer device address of the requested address.
    pub device_address: u64,
}

impl BufferSlice {
    fn new(id: BufferId, buffer: &Buffer, addr: VAddr) -> Self {
        let offset = buffer.offset(addr);
        Self {
            id,
            handle: buffer.handle(),
            offset,
            device_address: buffer.device_address() + offset,
        }
    }
}

/// Outcome of overlap resolution for a requested range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverlapResult {
    /// Distinct live buffers intersecting the (expanded) range, in discovery order.
    pub ids: Vec<BufferId>,
    /// Start of the unified range.
    pub begin: VAddr,
    /// End of the unified range.
    pub end: VAddr,
    /// `true` when the accumulated stream score crossed the threshold.
    pub has_stream_leap: bool,
}

/// One vertex input of a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexInput {
    /// Binding slot.
    pub binding: u32,
    /// Guest address of the first vertex.
    pub base_address: VAddr,
    /// Bytes read by the draw; zero leaves the binding unbound.
    pub size: u64,
    /// Vertex stride in bytes.
    pub stride: u32,
}

/// Index buffer state of a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferDesc {
    /// Guest address of index zero.
    pub base_address: VAddr,
    /// Number of indices drawn.
    pub num_indices: u32,
    /// Index width.
    pub index_type: IndexType,
}

/// Structural cache state guarded by the state lock.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub(crate) buffer_ranges: SplitRangeMap<BufferId>,
    pub(crate) page_table: MultiLevelPageTable<PageData>,
    pub(crate) memory_tracker: MemoryTracker,
    /// GPU writes not yet downloaded.
    pub(crate) gpu_modified_ranges: RangeSet,
    /// Subset of `gpu_modified_ranges` scheduled for download.
    pub(crate) pending_download_ranges: RangeSet,
    /// Pending ranges the GPU wrote again after they were scheduled.
    pub(crate) rewritten_ranges: RangeSet,
    /// Signal tick of the latest download scheduled over each pending range.
    pub(crate) download_owners: SplitRangeMap<u64>,
    /// CPU writes to registered memory to replay by `synchronize_dma_buffers`.
    pub(crate) dma_sync_ranges: RangeSet,
    pub(crate) current_download_tick: u64,
    pub(crate) stats: CacheStats,
}

impl CacheState {
    /// Clears the tracker's GPU bit on the pages of `range` that no longer hold GPU bytes.
    ///
    /// Tracker pages are coarser than `gpu_modified_ranges`; a page keeps its bit while any of
    /// its bytes are still GPU modified.
    pub(crate) fn release_gpu_pages(&mut self, range: AddrRange) {
        let outer = range.align_outward(TRACKER_PAGESIZE);
        let mut page = outer.begin;
        while page < outer.end {
            let page_range = AddrRange::from_size(page, TRACKER_PAGESIZE);
            if !self.gpu_modified_ranges.intersects(page_range) {
                self.memory_tracker.unmark_region_as_gpu_modified(page_range);
            }
            page += TRACKER_PAGESIZE;
        }
    }
}

/// The four ring buffers, destroyed together.
pub(crate) struct UtilityBuffers {
    stream: StreamBuffer,
    download: StreamBuffer,
    upload: StreamBuffer,
    device_local: StreamBuffer,
    device: Arc<dyn Device>,
}

impl std::fmt::Debug for UtilityBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilityBuffers")
            .field("stream", &self.stream)
            .field("download", &self.download)
            .field("upload", &self.upload)
            .field("device_local", &self.device_local)
            .finish_non_exhaustive()
    }
}

impl UtilityBuffers {
    fn new(device: Arc<dyn Device>, sizes: &StreamConfig) -> CacheResult<Self> {
        let dev = device.as_ref();
        let release = |rings: &[&StreamBuffer]| rings.iter().for_each(|ring| ring.destroy(dev));
        let stream = StreamBuffer::new(dev, MemoryUsage::Stream, sizes.stream_size)?;
        let download = StreamBuffer::new(dev, MemoryUsage::Download, sizes.download_size)
            .inspect_err(|_| release(&[&stream]))?;
        let upload = StreamBuffer::new(dev, MemoryUsage::Upload, sizes.staging_size)
            .inspect_err(|_| release(&[&stream, &download]))?;
        let device_local =
            StreamBuffer::new(dev, MemoryUsage::DeviceLocal, sizes.device_local_size)
                .inspect_err(|_| release(&[&stream, &download, &upload]))?;
        Ok(Self {
            stream,
            download,
            upload,
            device_local,
            device,
        })
    }

    pub(crate) fn get_mut(&mut self, usage: MemoryUsage) -> &mut StreamBuffer {
        match usage {
            MemoryUsage::Stream => &mut self.stream,
            MemoryUsage::Download => &mut self.download,
            MemoryUsage::Upload => &mut self.upload,
            MemoryUsage::DeviceLocal => &mut self.device_local,
        }
    }
}

impl Drop for UtilityBuffers {
    fn drop(&mut self) {
        for ring in [&self.stream, &self.download, &self.upload, &self.device_local] {
            ring.destroy(self.device.as_ref());
        }
    }
}

/// Buffers with a fixed role that live as long as the cache.
pub(crate) struct FixedBuffers {
    gds: Buffer,
    bda_pagetable: Option<Buffer>,
    fault: Option<Buffer>,
    device: Arc<dyn Device>,
}

impl std::fmt::Debug for FixedBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedBuffers")
            .field("gds", &self.gds)
            .field("bda_pagetable", &self.bda_pagetable)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

impl FixedBuffers {
    fn new(device: Arc<dyn Device>, config: &Config) -> CacheResult<Self> {
        let usage = MemoryUsage::DeviceLocal;
        let create = |size: u64| -> CacheResult<Buffer> {
            let raw = device
                .create_buffer(size, usage)
                .map_err(|err| CacheError::from_alloc(err, usage))?;
            Ok(Buffer::new(0, size, raw, usage))
        };
        let release = |buffers: &[&Buffer]| {
            buffers
                .iter()
                .for_each(|buffer| device.destroy_buffer(buffer.handle()));
        };

        let gds = create(config.general.gds_size)?;
        let (bda_pagetable, fault) = if config.general.bda_enabled {
            let table = create(BDA_PAGETABLE_SIZE).inspect_err(|_| release(&[&gds]))?;
            let fault = create(FAULT_BUFFER_SIZE).inspect_err(|_| release(&[&gds, &table]))?;
            (Some(table), Some(fault))
        } else {
            (None, None)
        };
        Ok(Self {
            gds,
            bda_pagetable,
            fault,
            device,
        })
    }
}

impl Drop for FixedBuffers {
    fn drop(&mut self) {
        let buffers = [Some(&self.gds), self.bda_pagetable.as_ref(), self.fault.as_ref()];
        for buffer in buffers.into_iter().flatten() {
            self.device.destroy_buffer(buffer.handle());
        }
    }
}

/// State shared between the cache handle and the download worker.
///
/// Field order is teardown order: buffer pool, then utility buffers, then fixed buffers.
pub(crate) struct CacheShared {
    pub(crate) config: Config,
    pub(crate) device: Arc<dyn Device>,
    pub(crate) memory: Arc<dyn GuestMemory>,
    pub(crate) texture_cache: Arc<dyn TextureCache>,
    pub(crate) state: RwLock<CacheState>,
    pub(crate) pool: RwLock<BufferPool>,
    pub(crate) utility: Mutex<UtilityBuffers>,
    pub(crate) fixed: FixedBuffers,
    pub(crate) queue: DownloadQueue,
    pub(crate) download_tick: TickSignal,
}

impl std::fmt::Debug for CacheShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheShared")
            .field("config", &self.config)
            .field("fixed", &self.fixed)
            .field("download_tick", &self.download_tick.get())
            .finish_non_exhaustive()
    }
}

/// Both structural locks, held for one operation.
pub(crate) struct CacheGuard<'a> {
    pub(crate) shared: &'a CacheShared,
    pub(crate) state: RwLockWriteGuard<'a, CacheState>,
    pub(crate) pool: RwLockWriteGuard<'a, BufferPool>,
}

impl CacheShared {
    pub(crate) fn lock(&self) -> CacheGuard<'_> {
        let state = self.state.write();
        let pool = self.pool.write();
        CacheGuard {
            shared: self,
            state,
            pool,
        }
    }

    pub(crate) fn lock_read(&self) -> (RwLockReadGuard<'_, CacheState>, RwLockReadGuard<'_, BufferPool>) {
        let state = self.state.read();
        let pool = self.pool.read();
        (state, pool)
    }
}

/// GPU buffer cache over emulated process memory.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use gpucache_core::cache::BufferCache;
/// use gpucache_core::config::Config;
/// use gpucache_core::device::HostDevice;
/// use gpucache_core::guest::{GuestMemory, GuestRam};
/// use gpucache_core::traits::{NullPageWatcher, NullTextureCache};
///
/// let mut config = Config::default();
/// config.stream.stream_size = 1 << 20;
/// config.stream.staging_size = 1 << 20;
/// config.stream.download_size = 1 << 20;
/// config.stream.device_local_size = 1 << 20;
///
/// let ram = Arc::new(GuestRam::new(0, 1 << 20).unwrap());
/// ram.write(0x1000, &[7; 16]).unwrap();
/// let cache = BufferCache::new(
///     config,
///     Arc::new(HostDevice::new()),
///     ram,
///     Arc::new(NullPageWatcher),
///     Arc::new(NullTextureCache),
/// )
/// .unwrap();
///
/// let slice = cache.obtain_buffer(0x1000, 16, false, false, None).unwrap();
/// assert_eq!(cache.find_buffer(0x1000, 16), slice.id);
/// ```
pub struct BufferCache {
    shared: Arc<CacheShared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("shared", &self.shared)
            .field("worker_running", &self.worker.is_some())
            .finish()
    }
}

impl BufferCache {
    /// Creates the cache, its fixed and utility buffers, and starts the download worker.
    ///
    /// # Arguments
    ///
    /// * `config` - Cache configuration; use [`Config::validate`] on hand-built values.
    /// * `device` - Device buffers are allocated on and commands recorded to.
    /// * `memory` - Guest memory mirrored by the cache.
    /// * `watcher` - Page-protection manager notified of tracking changes.
    /// * `texture_cache` - Image cache consulted for texel buffers.
    ///
    /// # Returns
    ///
    /// The cache, or an error if a fixed buffer cannot be allocated or the worker cannot start.
    pub fn new(
        config: Config,
        device: Arc<dyn Device>,
        memory: Arc<dyn GuestMemory>,
        watcher: Arc<dyn PageWatcher>,
        texture_cache: Arc<dyn TextureCache>,
    ) -> CacheResult<Self> {
        let utility = UtilityBuffers::new(device.clone(), &config.stream)?;
        let fixed = FixedBuffers::new(device.clone(), &config)?;
        let state = CacheState {
            buffer_ranges: SplitRangeMap::new(),
            page_table: MultiLevelPageTable::new(),
            memory_tracker: MemoryTracker::new(watcher, config.general.readbacks),
            gpu_modified_ranges: RangeSet::new(),
            pending_download_ranges: RangeSet::new(),
            rewritten_ranges: RangeSet::new(),
            download_owners: SplitRangeMap::new(),
            dma_sync_ranges: RangeSet::new(),
            current_download_tick: 0,
            stats: CacheStats::default(),
        };
        let shared = Arc::new(CacheShared {
            pool: RwLock::new(BufferPool::new(device.clone())),
            config,
            device,
            memory,
            texture_cache,
            state: RwLock::new(state),
            utility: Mutex::new(utility),
            fixed,
            queue: DownloadQueue::new(),
            download_tick: TickSignal::new(0),
        });
        let worker = download::spawn_worker(shared.clone())?;
        debug!("buffer cache ready");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Returns the configuration the cache was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Returns the global data share buffer.
    pub fn gds_buffer(&self) -> &Buffer {
        &self.shared.fixed.gds
    }

    /// Returns the BDA page table buffer, or `None` when BDA tracking is disabled.
    pub fn bda_pagetable_buffer(&self) -> Option<&Buffer> {
        self.shared.fixed.bda_pagetable.as_ref()
    }

    /// Returns the fault buffer, or `None` when BDA tracking is disabled.
    pub fn fault_buffer(&self) -> Option<&Buffer> {
        self.shared.fixed.fault.as_ref()
    }

    /// Returns the utility ring buffer for `usage`.
    ///
    /// The guard holds the utility lock; drop it before calling back into the cache.
    pub fn utility_buffer(&self, usage: MemoryUsage) -> MappedMutexGuard<'_, StreamBuffer> {
        MutexGuard::map(self.shared.utility.lock(), |u| u.get_mut(usage))
    }

    /// Returns the buffer in slot `id`.
    ///
    /// The guard holds the pool lock; it must not be kept across calls that may create or
    /// delete buffers.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a buffer.
    pub fn buffer(&self, id: BufferId) -> MappedRwLockReadGuard<'_, Buffer> {
        RwLockReadGuard::map(self.shared.pool.read(), |pool| &pool[id])
    }

    /// Returns the number of live (not tombstoned) cached buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.shared.pool.read().live_count()
    }

    /// Returns every live buffer as `(id, range)`, in address order.
    pub fn live_buffers(&self) -> Vec<(BufferId, AddrRange)> {
        let pool = self.shared.pool.read();
        let mut live: Vec<_> = pool.iter_live().map(|(id, b)| (id, b.range())).collect();
        live.sort_by_key(|(_, range)| range.begin);
        live
    }

    /// Returns the page-table entry of the caching page containing `addr`.
    pub fn page_data(&self, addr: VAddr) -> PageData {
        self.shared.state.read().page_table.get(addr >> CACHING_PAGEBITS)
    }

    /// Returns a snapshot of the GPU-modified ranges.
    pub fn gpu_modified_ranges(&self) -> RangeSet {
        self.shared.state.read().gpu_modified_ranges.clone()
    }

    /// Returns a snapshot of the ranges scheduled for download.
    pub fn pending_download_ranges(&self) -> RangeSet {
        self.shared.state.read().pending_download_ranges.clone()
    }

    /// Returns the last download signal tick published by the worker.
    pub fn download_tick(&self) -> u64 {
        self.shared.download_tick.get()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> CacheStats {
        self.shared.state.read().stats.clone()
    }

    /// Destroys tombstoned and temporary buffers whose work has completed.
    ///
    /// # Returns
    ///
    /// The number of device buffers destroyed.
    pub fn reclaim(&self) -> usize {
        self.shared.pool.write().reclaim()
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.shared.queue.request_stop();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("download worker panicked");
        }
        debug!("buffer cache torn down");
    }
}

/// Validates and normalizes a guest range request; zero sizes are widened to one byte.
pub(crate) fn request_range(addr: VAddr, size: u64) -> CacheResult<AddrRange> {
    let size = size.max(1);
    match addr.checked_add(size) {
        Some(end) if end <= ADDRESS_SPACE_END => Ok(AddrRange::new(addr, end)),
        _ => Err(CacheError::AddressOutOfRange { addr, size }),
    }
}
