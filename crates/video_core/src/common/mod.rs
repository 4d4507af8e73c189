//! Common types and helpers used throughout the buffer cache.
//!
//! This module provides the building blocks shared by every cache component:
//! 1. **Addresses:** The device address type, half-open address ranges and alignment helpers.
//! 2. **Constants:** Caching page geometry, address-space limits and fixed buffer sizes.
//! 3. **Errors:** The `thiserror` error enums returned by cache and device operations.

/// Device address type and half-open address ranges.
pub mod addr;

/// Page geometry and fixed sizes.
pub mod constants;

/// Error types for cache, device and configuration operations.
pub mod error;

pub use addr::{AddrRange, VAddr, align_down, align_up};
pub use constants::{CACHING_PAGEBITS, CACHING_PAGESIZE};
pub use error::{CacheError, CacheResult, ConfigError, DeviceError};
