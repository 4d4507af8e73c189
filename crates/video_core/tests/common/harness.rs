use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gpucache_core::BufferCache;
use gpucache_core::buffer::MemoryUsage;
use gpucache_core::cache::BufferSlice;
use gpucache_core::common::{DeviceError, VAddr};
use gpucache_core::config::Config;
use gpucache_core::device::{
    Barrier, BufferCopy, BufferHandle, Device, DeviceBuffer, HostDevice, IndexType, VertexBinding,
};
use gpucache_core::guest::{GuestMemory, GuestRam};
use gpucache_core::traits::{NullPageWatcher, NullTextureCache, PageWatcher, TextureCache};

/// Guest RAM mapped for every test cache, starting at address zero.
pub const GUEST_SIZE: usize = 16 << 20;

/// Installs a `tracing` subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns a configuration with 1 MiB rings and BDA tracking switched as requested.
pub fn small_config(bda_enabled: bool) -> Config {
    let mut config = Config::default();
    config.stream.stream_size = 1 << 20;
    config.stream.staging_size = 1 << 20;
    config.stream.download_size = 1 << 20;
    config.stream.device_local_size = 1 << 20;
    config.general.bda_enabled = bda_enabled;
    config
}

/// A cache wired to a host device and guest RAM.
pub struct TestCache {
    pub cache: BufferCache,
    pub device: Arc<HostDevice>,
    pub ram: Arc<GuestRam>,
}

impl Default for TestCache {
    fn default() -> Self {
        Self::new(small_config(false))
    }
}

impl TestCache {
    pub fn new(config: Config) -> Self {
        Self::build(
            config,
            HostDevice::new(),
            Arc::new(NullPageWatcher),
            Arc::new(NullTextureCache),
        )
    }

    pub fn build(
        config: Config,
        device: HostDevice,
        watcher: Arc<dyn PageWatcher>,
        texture_cache: Arc<dyn TextureCache>,
    ) -> Self {
        init_tracing();
        let device = Arc::new(device);
        let ram = Arc::new(GuestRam::new(0, GUEST_SIZE).unwrap());
        let cache = BufferCache::new(config, device.clone(), ram.clone(), watcher, texture_cache).unwrap();
        Self { cache, device, ram }
    }

    /// Writes guest memory directly, as the emulated CPU would.
    pub fn cpu_write(&self, addr: VAddr, data: &[u8]) {
        self.ram.write(addr, data).unwrap();
    }

    /// Reads guest memory directly.
    pub fn cpu_read(&self, addr: VAddr, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.ram.read(addr, &mut out).unwrap();
        out
    }

    /// Obtains `[addr, addr + data.len())` for writing and stores `data` as a shader would.
    pub fn gpu_write(&self, addr: VAddr, data: &[u8]) -> BufferSlice {
        let slice = self
            .cache
            .obtain_buffer(addr, data.len() as u64, true, false, None)
            .unwrap();
        self.device.write_buffer(slice.handle, slice.offset, data).unwrap();
        slice
    }

    /// Reads `len` bytes of device memory at a resolved slice.
    pub fn device_read(&self, slice: &BufferSlice, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.device.read_buffer(slice.handle, slice.offset, &mut out).unwrap();
        out
    }

    /// Writes device memory at a resolved slice without telling the cache.
    pub fn device_write(&self, slice: &BufferSlice, data: &[u8]) {
        self.device.write_buffer(slice.handle, slice.offset, data).unwrap();
    }

    /// Returns the tick of the last submission.
    pub fn last_submitted(&self) -> u64 {
        self.device.current_tick() - 1
    }
}

/// A [`HostDevice`] whose buffer copies can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyDevice {
    pub inner: HostDevice,
    fail_copies: AtomicBool,
}

impl FlakyDevice {
    pub fn fail_copies(&self, fail: bool) {
        self.fail_copies.store(fail, Ordering::SeqCst);
    }
}

impl Device for FlakyDevice {
    fn create_buffer(&self, size: u64, usage: MemoryUsage) -> Result<DeviceBuffer, DeviceError> {
        self.inner.create_buffer(size, usage)
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        self.inner.destroy_buffer(handle);
    }

    fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.inner.write_buffer(handle, offset, data)
    }

    fn read_buffer(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        self.inner.read_buffer(handle, offset, out)
    }

    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) -> Result<(), DeviceError> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(DeviceError::UnknownBuffer(src.0));
        }
        self.inner.copy_buffer(src, dst, regions)
    }

    fn fill_buffer(&self, handle: BufferHandle, offset: u64, size: u64, value: u32) -> Result<(), DeviceError> {
        self.inner.fill_buffer(handle, offset, size, value)
    }

    fn barrier(&self, barrier: Barrier) {
        self.inner.barrier(barrier);
    }

    fn bind_vertex_buffers(&self, bindings: &[VertexBinding]) {
        self.inner.bind_vertex_buffers(bindings);
    }

    fn bind_index_buffer(&self, handle: BufferHandle, offset: u64, index_type: IndexType) {
        self.inner.bind_index_buffer(handle, offset, index_type);
    }

    fn scan_fault_buffer(
        &self,
        fault: BufferHandle,
        output: BufferHandle,
        output_offset: u64,
        max_faults: u32,
    ) -> Result<(), DeviceError> {
        self.inner.scan_fault_buffer(fault, output, output_offset, max_faults)
    }

    fn current_tick(&self) -> u64 {
        self.inner.current_tick()
    }

    fn flush(&self) -> u64 {
        self.inner.flush()
    }

    fn is_tick_done(&self, tick: u64) -> bool {
        self.inner.is_tick_done(tick)
    }

    fn wait_tick(&self, tick: u64) {
        self.inner.wait_tick(tick);
    }
}
