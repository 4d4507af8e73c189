//! Emulated process memory.
//!
//! The cache mirrors guest memory into device buffers and copies downloads
//! back into it. `GuestMemory` is the boundary to whatever owns that memory;
//! `GuestRam` is an mmap-backed implementation mapped at a fixed guest base.

use crate::common::addr::VAddr;
use crate::common::error::CacheResult;

/// Anonymous-mapping guest RAM.
pub mod ram;

pub use ram::GuestRam;

/// Byte-addressed access to emulated process memory.
///
/// Implementations are shared between the emulation thread and the download worker.
pub trait GuestMemory: Send + Sync {
    /// Returns `true` if every byte of `[addr, addr + size)` is backed.
    fn is_mapped(&self, addr: VAddr, size: u64) -> bool;
    /// Copies `out.len()` bytes starting at `addr` into `out`.
    fn read(&self, addr: VAddr, out: &mut [u8]) -> CacheResult<()>;
    /// Copies `data` into guest memory at `addr`.
    fn write(&self, addr: VAddr, data: &[u8]) -> CacheResult<()>;

    /// Copies `size` bytes from `src` to `dst` inside guest memory.
    fn copy(&self, dst: VAddr, src: VAddr, size: u64) -> CacheResult<()> {
        let mut scratch = vec![0u8; size as usize];
        self.read(src, &mut scratch)?;
        self.write(dst, &scratch)
    }
}
