//! Global cache constants.
//!
//! This module defines the geometry shared by the page table, the memory tracker
//! and the fault machinery. It includes:
//! 1. **Caching pages:** The 16 KiB granularity at which buffers are registered.
//! 2. **Tracker pages:** The 4 KiB host-page granularity of CPU/GPU dirty tracking.
//! 3. **Address space:** The 40-bit device address space and the derived table sizes.
//! 4. **Fixed buffers:** Sizes of the BDA page table and fault buffers.

/// Number of bits in a caching page offset.
pub const CACHING_PAGEBITS: u32 = 14;

/// Caching page size in bytes (16 KiB).
pub const CACHING_PAGESIZE: u64 = 1 << CACHING_PAGEBITS;

/// Device page size in bytes; buffer device addresses are aligned to this.
pub const DEVICE_PAGESIZE: u64 = 16 * 1024;

/// Width of the emulated device address space in bits.
pub const ADDRESS_SPACE_BITS: u32 = 40;

/// One past the highest addressable device byte.
pub const ADDRESS_SPACE_END: u64 = 1 << ADDRESS_SPACE_BITS;

/// Number of caching pages in the device address space.
pub const CACHING_NUMPAGES: u64 = 1 << (ADDRESS_SPACE_BITS - CACHING_PAGEBITS);

/// Size of the BDA page table buffer: one 64-bit device address per caching page.
pub const BDA_PAGETABLE_SIZE: u64 = CACHING_NUMPAGES * 8;

/// Size of the fault buffer: one bit per caching page.
pub const FAULT_BUFFER_SIZE: u64 = CACHING_NUMPAGES / 8;

/// Number of bits in a memory tracker page offset (4 KiB host pages).
pub const TRACKER_PAGEBITS: u32 = 12;

/// Memory tracker page size in bytes.
pub const TRACKER_PAGESIZE: u64 = 1 << TRACKER_PAGEBITS;

/// Number of bits covered by one memory tracker region (4 MiB).
pub const TRACKER_REGION_BITS: u32 = 22;

/// Alignment used for staging and download sub-allocations.
pub const STAGING_ALIGNMENT: u64 = 256;

/// Alignment required for `InlineData` destinations.
pub const INLINE_DATA_ALIGNMENT: u64 = 4;
