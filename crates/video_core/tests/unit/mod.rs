//! # Cache Units
//!
//! Integration tests of the public cache surface, grouped by concern.



/// Upload tracking and CPU invalidation.
pub mod coherence;

/// Download scheduling, write-back and read waits.
pub mod downloads;

/// Inline data, buffer copies and vertex/index binding.
pub mod transfers;

/// BDA page table and fault-buffer processing.
pub mod faults;
