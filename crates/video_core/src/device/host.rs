//! Software device backed by sparse host memory.
//!
//! `HostDevice` executes every command eagerly at record time, so the contents of a buffer are
//! always observable through `read_buffer`. What it models faithfully is the timeline:
//! 1. **Ticks:** Commands belong to `current_tick` until `flush` submits it.
//! 2. **Completion:** Submitted ticks complete immediately, or only when the owner calls
//!    `complete_through` after `hold_completion` has been requested.
//! 3. **Budget:** Allocations beyond the configured budget fail with `OutOfMemory`.
//!
//! Buffer storage is sparse in 64 KiB chunks so the large fixed buffers (BDA page table, fault
//! buffer) only cost memory for the regions that are written.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{
    Barrier, BufferCopy, BufferHandle, Device, DeviceBuffer, FAULT_SCAN_LIST_OFFSET, IndexType,
    VertexBinding,
};
use crate::buffer::MemoryUsage;
use crate::common::addr::align_up;
use crate::common::constants::DEVICE_PAGESIZE;
use crate::common::error::DeviceError;

/// Bytes per sparse storage chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// First buffer device address handed out.
const DEVICE_ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Sparse storage of one device buffer.
#[derive(Debug)]
struct HostBuffer {
    size: u64,
    usage: MemoryUsage,
    chunks: BTreeMap<u64, Box<[u8]>>,
}

impl HostBuffer {
    fn new(size: u64, usage: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            chunks: BTreeMap::new(),
        }
    }

    fn check(&self, handle: BufferHandle, offset: u64, len: u64) -> Result<(), DeviceError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DeviceError::OutOfBounds {
                handle: handle.0,
                offset,
                size: len,
            }),
        }
    }

    /// Reads bytes; chunks never written read as zero.
    fn read(&self, offset: u64, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let pos = offset + done as u64;
            let chunk = pos / CHUNK_SIZE as u64;
            let within = (pos % CHUNK_SIZE as u64) as usize;
            let n = (CHUNK_SIZE - within).min(out.len() - done);
            match self.chunks.get(&chunk) {
                Some(data) => out[done..done + n].copy_from_slice(&data[within..within + n]),
                None => out[done..done + n].fill(0),
            }
            done += n;
        }
    }

    /// Writes bytes; all-zero writes to untouched chunks allocate nothing.
    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let chunk = pos / CHUNK_SIZE as u64;
            let within = (pos % CHUNK_SIZE as u64) as usize;
            let n = (CHUNK_SIZE - within).min(data.len() - done);
            let src = &data[done..done + n];
            if let Some(dst) = self.chunks.get_mut(&chunk) {
                dst[within..within + n].copy_from_slice(src);
            } else if src.iter().any(|&b| b != 0) {
                let mut fresh = vec![0u8; CHUNK_SIZE].into_boxed_slice();
                fresh[within..within + n].copy_from_slice(src);
                let _ = self.chunks.insert(chunk, fresh);
            }
            done += n;
        }
    }

    fn resident_bytes(&self) -> u64 {
        (self.chunks.len() * CHUNK_SIZE) as u64
    }
}

/// Mutable device state behind the lock.
#[derive(Debug)]
struct HostState {
    buffers: HashMap<BufferHandle, HostBuffer>,
    next_handle: u64,
    next_address: u64,
    budget: u64,
    used: u64,
    current_tick: u64,
    completed_tick: u64,
    manual_completion: bool,
    barriers: Vec<Barrier>,
    vertex_bindings: Vec<VertexBinding>,
    index_binding: Option<(BufferHandle, u64, IndexType)>,
    copies: u64,
}

impl HostState {
    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer, DeviceError> {
        self.buffers
            .get(&handle)
            .ok_or(DeviceError::UnknownBuffer(handle.0))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut HostBuffer, DeviceError> {
        self.buffers
            .get_mut(&handle)
            .ok_or(DeviceError::UnknownBuffer(handle.0))
    }

    fn submit(&mut self) -> u64 {
        let tick = self.current_tick;
        self.current_tick += 1;
        if !self.manual_completion {
            self.completed_tick = tick;
        }
        tick
    }
}

/// A [`Device`] that runs on the host CPU.
#[derive(Debug)]
pub struct HostDevice {
    state: Mutex<HostState>,
    completion: Condvar,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    /// Creates a device with an unlimited budget and automatic completion.
    pub fn new() -> Self {
        Self::with_budget(u64::MAX)
    }

    /// Creates a device that fails allocations once `budget` bytes are in use.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            state: Mutex::new(HostState {
                buffers: HashMap::new(),
                next_handle: 1,
                next_address: DEVICE_ADDRESS_BASE,
                budget,
                used: 0,
                current_tick: 1,
                completed_tick: 0,
                manual_completion: false,
                barriers: Vec::new(),
                vertex_bindings: Vec::new(),
                index_binding: None,
                copies: 0,
            }),
            completion: Condvar::new(),
        }
    }

    /// Stops submitted ticks from completing until [`complete_through`](Self::complete_through).
    pub fn hold_completion(&self) {
        self.state.lock().manual_completion = true;
    }

    /// Completes every submitted tick up to and including `tick`, waking waiters.
    pub fn complete_through(&self, tick: u64) {
        let mut state = self.state.lock();
        let last_submitted = state.current_tick - 1;
        state.completed_tick = state.completed_tick.max(tick.min(last_submitted));
        drop(state);
        let _ = self.completion.notify_all();
    }

    /// Returns to automatic completion and completes everything submitted so far.
    pub fn release_completion(&self) {
        let mut state = self.state.lock();
        state.manual_completion = false;
        state.completed_tick = state.current_tick - 1;
        drop(state);
        let _ = self.completion.notify_all();
    }

    /// Returns the highest completed tick.
    pub fn completed_tick(&self) -> u64 {
        self.state.lock().completed_tick
    }

    /// Returns the number of live buffers.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Returns the bytes charged against the budget.
    pub fn memory_used(&self) -> u64 {
        self.state.lock().used
    }

    /// Returns the host bytes actually backing buffer contents.
    pub fn resident_bytes(&self) -> u64 {
        self.state
            .lock()
            .buffers
            .values()
            .map(HostBuffer::resident_bytes)
            .sum()
    }

    /// Returns the usage class a live buffer was created with.
    pub fn buffer_usage(&self, handle: BufferHandle) -> Option<MemoryUsage> {
        self.state.lock().buffers.get(&handle).map(|b| b.usage)
    }

    /// Returns every barrier recorded so far.
    pub fn barriers(&self) -> Vec<Barrier> {
        self.state.lock().barriers.clone()
    }

    /// Returns the vertex bindings of the last `bind_vertex_buffers` call.
    pub fn vertex_bindings(&self) -> Vec<VertexBinding> {
        self.state.lock().vertex_bindings.clone()
    }

    /// Returns the last bound index buffer.
    pub fn index_binding(&self) -> Option<(BufferHandle, u64, IndexType)> {
        self.state.lock().index_binding
    }

    /// Returns the number of `copy_buffer` commands executed.
    pub fn copy_count(&self) -> u64 {
        self.state.lock().copies
    }
}

impl Device for HostDevice {
    fn create_buffer(&self, size: u64, usage: MemoryUsage) -> Result<DeviceBuffer, DeviceError> {
        let mut state = self.state.lock();
        let available = state.budget.saturating_sub(state.used);
        if size > available {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available,
            });
        }
        let handle = BufferHandle(state.next_handle);
        state.next_handle += 1;
        let device_address = state.next_address;
        state.next_address = align_up(device_address + size.max(1), DEVICE_PAGESIZE);
        state.used += size;
        let _ = state.buffers.insert(handle, HostBuffer::new(size, usage));
        trace!(handle = handle.0, size, ?usage, "device buffer created");
        Ok(DeviceBuffer {
            handle,
            device_address,
        })
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(buffer) = state.buffers.remove(&handle) {
            state.used -= buffer.size;
            trace!(handle = handle.0, "device buffer destroyed");
        }
    }

    fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let buffer = state.buffer_mut(handle)?;
        buffer.check(handle, offset, data.len() as u64)?;
        buffer.write(offset, data);
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        let state = self.state.lock();
        let buffer = state.buffer(handle)?;
        buffer.check(handle, offset, out.len() as u64)?;
        buffer.read(offset, out);
        Ok(())
    }

    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        for region in regions {
            let mut scratch = vec![0u8; region.size as usize];
            let source = state.buffer(src)?;
            source.check(src, region.src_offset, region.size)?;
            source.read(region.src_offset, &mut scratch);
            let target = state.buffer_mut(dst)?;
            target.check(dst, region.dst_offset, region.size)?;
            target.write(region.dst_offset, &scratch);
        }
        state.copies += 1;
        Ok(())
    }

    fn fill_buffer(&self, handle: BufferHandle, offset: u64, size: u64, value: u32) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let buffer = state.buffer_mut(handle)?;
        buffer.check(handle, offset, size)?;
        let pattern = value.to_le_bytes();
        let data: Vec<u8> = (0..size as usize).map(|i| pattern[i % 4]).collect();
        buffer.write(offset, &data);
        Ok(())
    }

    fn barrier(&self, barrier: Barrier) {
        self.state.lock().barriers.push(barrier);
    }

    fn bind_vertex_buffers(&self, bindings: &[VertexBinding]) {
        self.state.lock().vertex_bindings = bindings.to_vec();
    }

    fn bind_index_buffer(&self, handle: BufferHandle, offset: u64, index_type: IndexType) {
        self.state.lock().index_binding = Some((handle, offset, index_type));
    }

    fn scan_fault_buffer(
        &self,
        fault: BufferHandle,
        output: BufferHandle,
        output_offset: u64,
        max_faults: u32,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let capacity = max_faults as usize;
        let mut pages: Vec<u64> = Vec::new();
        {
            let bits = state.buffer_mut(fault)?;
            'scan: for (&chunk, data) in &mut bits.chunks {
                for (byte_index, byte) in data.iter_mut().enumerate() {
                    while *byte != 0 {
                        if pages.len() == capacity {
                            break 'scan;
                        }
                        let bit = byte.trailing_zeros();
                        *byte &= !(1 << bit);
                        let byte_addr = chunk * CHUNK_SIZE as u64 + byte_index as u64;
                        pages.push(byte_addr * 8 + u64::from(bit));
                    }
                }
            }
        }
        let mut out = Vec::with_capacity(FAULT_SCAN_LIST_OFFSET as usize + pages.len() * 8);
        out.extend_from_slice(&(pages.len() as u32).to_le_bytes());
        out.resize(FAULT_SCAN_LIST_OFFSET as usize, 0);
        for page in &pages {
            out.extend_from_slice(&page.to_le_bytes());
        }
        let target = state.buffer_mut(output)?;
        target.check(output, output_offset, out.len() as u64)?;
        target.write(output_offset, &out);
        Ok(())
    }

    fn current_tick(&self) -> u64 {
        self.state.lock().current_tick
    }

    fn flush(&self) -> u64 {
        let tick = self.state.lock().submit();
        let _ = self.completion.notify_all();
        tick
    }

    fn is_tick_done(&self, tick: u64) -> bool {
        self.state.lock().completed_tick >= tick
    }

    fn wait_tick(&self, tick: u64) {
        let mut state = self.state.lock();
        while state.current_tick <= tick {
            let _ = state.submit();
        }
        while state.completed_tick < tick {
            self.completion.wait(&mut state);
        }
    }
}
