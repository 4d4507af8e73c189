//! Error types for the buffer cache.
//!
//! Errors fall into the three classes the cache distinguishes:
//! 1. **Resource exhaustion:** device allocations that fail are surfaced, never retried.
//! 2. **Invalid requests:** guest accesses outside mapped memory or malformed GDS accesses.
//! 3. **Configuration:** malformed or unreadable configuration files.
//!
//! Invariant violations (overlapping live buffers, stale page-table entries) are
//! programming errors and assert instead of producing a value here.

use thiserror::Error;

use super::addr::VAddr;
use crate::buffer::MemoryUsage;

/// Errors reported by the device layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device could not satisfy an allocation.
    #[error("device out of memory allocating {requested:#x} bytes ({available:#x} available)")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Bytes still available in the device budget.
        available: u64,
    },

    /// A command referenced a buffer handle the device does not know.
    #[error("unknown device buffer handle {0}")]
    UnknownBuffer(u64),

    /// A command accessed bytes outside a device buffer.
    #[error("access [{offset:#x}, +{size:#x}) out of bounds of device buffer {handle}")]
    OutOfBounds {
        /// Buffer handle.
        handle: u64,
        /// Offset of the access.
        offset: u64,
        /// Size of the access.
        size: u64,
    },
}

/// Errors returned by [`BufferCache`](crate::cache::BufferCache) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A device allocation failed; fatal for the caller.
    #[error("device memory exhausted allocating {requested:#x} bytes for {usage:?} buffer")]
    DeviceMemoryExhausted {
        /// Bytes requested from the device.
        requested: u64,
        /// Usage class of the failed allocation.
        usage: MemoryUsage,
    },

    /// Any other device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The range is not backed by guest memory.
    #[error("guest access [{addr:#x}, +{size:#x}) outside mapped guest memory")]
    GuestAccess {
        /// First address accessed.
        addr: VAddr,
        /// Size of the access.
        size: u64,
    },

    /// The range does not fit in the 40-bit device address space.
    #[error("range [{addr:#x}, +{size:#x}) outside the device address space")]
    AddressOutOfRange {
        /// First address of the range.
        addr: VAddr,
        /// Size of the range.
        size: u64,
    },

    /// Inline data or GDS offsets must be dword aligned.
    #[error("address {0:#x} is not dword aligned")]
    Misaligned(VAddr),

    /// A GDS access falls outside the GDS buffer.
    #[error("GDS access [{offset:#x}, +{size:#x}) exceeds GDS size {gds_size:#x}")]
    GdsOutOfRange {
        /// Offset into GDS.
        offset: u64,
        /// Size of the access.
        size: u64,
        /// Size of the GDS buffer.
        gds_size: u64,
    },

    /// Buffer device address tracking is disabled in the configuration.
    #[error("buffer device address tracking is disabled")]
    BdaDisabled,

    /// The download worker thread could not be started.
    #[error("failed to spawn download worker: {0}")]
    WorkerSpawn(String),
}

impl CacheError {
    /// Converts a device allocation failure into the exhaustion error for `usage`.
    pub(crate) fn from_alloc(err: DeviceError, usage: MemoryUsage) -> Self {
        match err {
            DeviceError::OutOfMemory { requested, .. } => {
                Self::DeviceMemoryExhausted { requested, usage }
            }
            other => Self::Device(other),
        }
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised while loading a [`Config`](crate::config::Config).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration was not valid JSON for the config schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value parsed but is unusable.
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
