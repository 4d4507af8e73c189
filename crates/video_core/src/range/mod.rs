//! Interval structures over the device address space.
//!
//! This module provides the two ordered interval containers the cache is built on:
//! 1. **RangeSet:** A set of disjoint, coalesced address intervals (GPU-modified and
//!    pending-download bookkeeping, DMA sync ranges).
//! 2. **SplitRangeMap:** A map from disjoint address intervals to a value, split on
//!    partial overwrite (the address-range index from device address to buffer id).

/// Coalescing set of disjoint address intervals.
pub mod range_set;

/// Interval map that splits entries on partial overwrite.
pub mod split_range_map;

pub use range_set::RangeSet;
pub use split_range_map::SplitRangeMap;
