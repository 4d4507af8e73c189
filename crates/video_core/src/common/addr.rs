//! Device addresses and half-open address ranges.
//!
//! Device addresses are emulated-process virtual addresses. The cache never
//! dereferences them directly; they are keys into the page table and range
//! index, and offsets into guest memory.

use std::fmt;

/// An emulated-process virtual address as seen by the GPU.
pub type VAddr = u64;

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline(always)]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
///
/// Saturates to the highest aligned value instead of overflowing.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    match value.checked_add(alignment - 1) {
        Some(v) => align_down(v, alignment),
        None => align_down(u64::MAX, alignment),
    }
}

/// A half-open range of device addresses `[begin, end)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AddrRange {
    /// First address in the range.
    pub begin: VAddr,
    /// One past the last address in the range.
    pub end: VAddr,
}

impl AddrRange {
    /// Creates a range from its bounds.
    #[inline(always)]
    pub const fn new(begin: VAddr, end: VAddr) -> Self {
        Self { begin, end }
    }

    /// Creates a range from a base address and a byte size.
    ///
    /// # Arguments
    ///
    /// * `addr` - First address of the range.
    /// * `size` - Length of the range in bytes.
    ///
    /// # Returns
    ///
    /// The range `[addr, addr + size)`, saturating at `u64::MAX`.
    #[inline(always)]
    pub const fn from_size(addr: VAddr, size: u64) -> Self {
        Self {
            begin: addr,
            end: addr.saturating_add(size),
        }
    }

    /// Returns the length of the range in bytes.
    #[inline(always)]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// Returns `true` if the range covers no addresses.
    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Returns `true` if `other` lies entirely inside this range.
    #[inline(always)]
    pub const fn contains(&self, other: &Self) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Returns `true` if the two ranges share at least one address.
    #[inline(always)]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Returns the common part of two ranges, or `None` if they are disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        (begin < end).then_some(Self { begin, end })
    }

    /// Returns the smallest range containing both ranges.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }

    /// Expands the range outwards to multiples of `alignment`.
    pub const fn align_outward(&self, alignment: u64) -> Self {
        Self {
            begin: align_down(self.begin, alignment),
            end: align_up(self.end, alignment),
        }
    }
}

impl fmt::Debug for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
