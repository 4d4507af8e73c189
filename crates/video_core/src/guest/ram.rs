//! Guest RAM backed by an anonymous mapping.
//!
//! On Unix the region is reserved with `mmap`, so pages the guest never
//! touches cost no host memory. Accesses go through a reader/writer lock:
//! the download worker writes back into RAM while the emulation thread reads
//! and writes it.

use std::io;

use parking_lot::RwLock;

use super::GuestMemory;
use crate::common::addr::{AddrRange, VAddr};
use crate::common::error::{CacheError, CacheResult};

/// Raw owning pointer to the mapping.
struct Mapping {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is owned exclusively by `GuestRam` and every access is
// serialized by its lock.
unsafe impl Send for Mapping {}
// SAFETY: see above; shared access only reads through the read guard.
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(size: usize) -> io::Result<Self> {
        #[cfg(unix)]
        {
            // SAFETY: anonymous private mapping with no fixed address; the
            // result is checked against MAP_FAILED before use.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                ptr: ptr.cast::<u8>(),
                size,
            })
        }

        #[cfg(not(unix))]
        {
            let leaked = Box::leak(vec![0u8; size].into_boxed_slice());
            Ok(Self {
                ptr: leaked.as_mut_ptr(),
                size,
            })
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: `ptr`/`size` describe the mapping created in `new`, unmapped once.
        unsafe {
            let _ = libc::munmap(self.ptr.cast(), self.size);
        }

        #[cfg(not(unix))]
        // SAFETY: reconstructs the boxed slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr, self.size)));
        }
    }
}

/// Guest RAM mapped at guest addresses `[base, base + size)`.
pub struct GuestRam {
    base: VAddr,
    mapping: RwLock<Mapping>,
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.mapping.read().size))
            .finish()
    }
}

impl GuestRam {
    /// Maps `size` bytes of zeroed guest RAM at guest address `base`.
    ///
    /// # Arguments
    ///
    /// * `base` - Guest address of the first byte.
    /// * `size` - Size of the region in bytes.
    ///
    /// # Returns
    ///
    /// The mapped RAM, or the OS error if the mapping could not be created.
    pub fn new(base: VAddr, size: usize) -> io::Result<Self> {
        Ok(Self {
            base,
            mapping: RwLock::new(Mapping::new(size)?),
        })
    }

    /// Returns the guest address of the first byte.
    pub const fn base(&self) -> VAddr {
        self.base
    }

    /// Returns the mapped range.
    pub fn range(&self) -> AddrRange {
        AddrRange::from_size(self.base, self.mapping.read().size as u64)
    }

    fn offset_of(&self, addr: VAddr, len: usize) -> CacheResult<usize> {
        if !self.is_mapped(addr, len as u64) {
            return Err(CacheError::GuestAccess {
                addr,
                size: len as u64,
            });
        }
        Ok((addr - self.base) as usize)
    }
}

impl GuestMemory for GuestRam {
    fn is_mapped(&self, addr: VAddr, size: u64) -> bool {
        self.range().contains(&AddrRange::from_size(addr, size))
            && addr.checked_add(size).is_some()
    }

    fn read(&self, addr: VAddr, out: &mut [u8]) -> CacheResult<()> {
        let offset = self.offset_of(addr, out.len())?;
        let mapping = self.mapping.read();
        // SAFETY: `offset_of` checked `[offset, offset + len)` lies in the
        // mapping; the read guard excludes concurrent writers.
        unsafe {
            std::ptr::copy_nonoverlapping(mapping.ptr.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write(&self, addr: VAddr, data: &[u8]) -> CacheResult<()> {
        let offset = self.offset_of(addr, data.len())?;
        let mapping = self.mapping.write();
        // SAFETY: bounds checked by `offset_of`; the write guard gives exclusive access.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapping.ptr.add(offset), data.len());
        }
        Ok(())
    }

    fn copy(&self, dst: VAddr, src: VAddr, size: u64) -> CacheResult<()> {
        let len = size as usize;
        let src_offset = self.offset_of(src, len)?;
        let dst_offset = self.offset_of(dst, len)?;
        let mapping = self.mapping.write();
        // SAFETY: both spans are bounds checked; `copy` tolerates overlap.
        unsafe {
            std::ptr::copy(mapping.ptr.add(src_offset), mapping.ptr.add(dst_offset), len);
        }
        Ok(())
    }
}
