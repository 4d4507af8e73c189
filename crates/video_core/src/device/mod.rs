//! Device (command-submission) boundary.
//!
//! This module defines the `Device` trait through which the cache reaches the GPU. It provides:
//! 1. **Allocation:** Creating and destroying device buffers, each with a buffer device address.
//! 2. **Transfers:** Host-visible reads and writes, buffer-to-buffer copies and fills.
//! 3. **Recording:** Barriers, vertex/index bindings and the fault-buffer scan dispatch.
//! 4. **Timeline:** Submission ticks, flushing, and waiting for a tick's fence.
//!
//! Commands are recorded against `current_tick`; `flush` submits them and opens the next tick.
//! All implementors must be `Send + Sync`: the download worker waits on ticks and reads the
//! download buffer from its own thread.

use std::fmt;

use crate::buffer::MemoryUsage;
use crate::common::error::DeviceError;

/// Software device executing commands on host memory.
pub mod host;

pub use host::HostDevice;

/// Byte offset of the page list in a fault scan output, after the `u32` count.
pub const FAULT_SCAN_LIST_OFFSET: u64 = 8;

/// Opaque handle of a device buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BufferHandle(pub u64);

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({})", self.0)
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A freshly created device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    /// Handle used in every later command.
    pub handle: BufferHandle,
    /// Address shaders use to reach the buffer directly.
    pub device_address: u64,
}

/// One region of a buffer-to-buffer copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    /// Byte offset in the source buffer.
    pub src_offset: u64,
    /// Byte offset in the destination buffer.
    pub dst_offset: u64,
    /// Number of bytes to copy.
    pub size: u64,
}

/// Execution and memory dependencies the cache records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Barrier {
    /// Transfer writes made visible to shader reads and writes.
    TransferToShader,
    /// Shader writes made visible to transfer reads.
    ShaderToTransfer,
    /// Prior writes made visible to host reads.
    TransferToHost,
    /// Full memory barrier covering accesses through buffer device addresses.
    Memory,
}

/// Width of an index buffer element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// 16-bit indices.
    U16,
    /// 32-bit indices.
    U32,
}

impl IndexType {
    /// Returns the size of one index in bytes.
    pub const fn size_bytes(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// A vertex buffer binding recorded for a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    /// Binding slot.
    pub binding: u32,
    /// Bound buffer.
    pub handle: BufferHandle,
    /// Offset of the first vertex in the buffer.
    pub offset: u64,
    /// Bound size in bytes.
    pub size: u64,
    /// Vertex stride in bytes.
    pub stride: u32,
}

/// The GPU device as seen by the buffer cache.
///
/// Buffers are identified by [`BufferHandle`]. Offsets and sizes are in bytes and must lie
/// inside the addressed buffer; implementations report violations as `DeviceError::OutOfBounds`.
pub trait Device: Send + Sync {
    /// Allocates a buffer of `size` bytes for `usage`.
    fn create_buffer(&self, size: u64, usage: MemoryUsage) -> Result<DeviceBuffer, DeviceError>;
    /// Releases a buffer. Unknown handles are ignored.
    fn destroy_buffer(&self, handle: BufferHandle);
    /// Writes host bytes into a buffer (an upload through host-visible memory).
    fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    /// Reads buffer bytes back to the host.
    fn read_buffer(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), DeviceError>;
    /// Records a copy of `regions` from `src` to `dst`.
    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) -> Result<(), DeviceError>;
    /// Records a fill of `size` bytes at `offset` with the repeated dword `value`.
    fn fill_buffer(&self, handle: BufferHandle, offset: u64, size: u64, value: u32) -> Result<(), DeviceError>;
    /// Records a pipeline barrier.
    fn barrier(&self, barrier: Barrier);
    /// Binds vertex buffers for the next draw.
    fn bind_vertex_buffers(&self, bindings: &[VertexBinding]);
    /// Binds the index buffer for the next draw.
    fn bind_index_buffer(&self, handle: BufferHandle, offset: u64, index_type: IndexType);

    /// Dispatches the fault scan.
    ///
    /// Collects up to `max_faults` set bits of the bit-per-page `fault` buffer into `output` at
    /// `output_offset` as a `u32` count followed, at [`FAULT_SCAN_LIST_OFFSET`], by that many
    /// `u64` page indices, and clears the collected bits.
    fn scan_fault_buffer(
        &self,
        fault: BufferHandle,
        output: BufferHandle,
        output_offset: u64,
        max_faults: u32,
    ) -> Result<(), DeviceError>;

    /// Returns the tick commands are currently recorded against.
    fn current_tick(&self) -> u64;
    /// Submits recorded work; returns the submitted tick.
    fn flush(&self) -> u64;
    /// Returns `true` once all work of `tick` has completed.
    fn is_tick_done(&self, tick: u64) -> bool;
    /// Blocks until `tick` completes, submitting it first if it is still being recorded.
    fn wait_tick(&self, tick: u64);
}
