//! Configuration for the buffer cache.
//!
//! This module defines the configuration structures used to parameterize the
//! cache. It provides:
//! 1. **Defaults:** Baseline sizes for the utility buffers and GDS, and overlap policy values.
//! 2. **Structures:** Hierarchical config for general behaviour, utility buffers and overlap policy.
//! 3. **Loading:** JSON parsing from strings or files with validation.
//!
//! Every field has a default, so an empty JSON object is a valid configuration.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::common::error::ConfigError;

/// Default configuration constants for the cache.
mod defaults {
    /// Size of the transient stream buffer (64 MiB).
    pub const STREAM_SIZE: u64 = 64 * 1024 * 1024;

    /// Size of the host-to-device staging buffer (128 MiB).
    pub const STAGING_SIZE: u64 = 128 * 1024 * 1024;

    /// Size of the device-to-host download buffer (128 MiB).
    pub const DOWNLOAD_SIZE: u64 = 128 * 1024 * 1024;

    /// Size of the persistent device-local scratch buffer (128 MiB).
    pub const DEVICE_LOCAL_SIZE: u64 = 128 * 1024 * 1024;

    /// Accumulated stream score above which a region is treated as a stream.
    ///
    /// A buffer's score grows by one plus the score of every buffer it absorbs,
    /// so this is roughly the number of times a region was re-created by growth.
    pub const STREAM_LEAP_THRESHOLD: u32 = 16;

    /// Caching pages added on the opposite side once a stream leap fires (2 MiB).
    pub const STREAM_LEAP_PAGES: u64 = 128;

    /// Size of the global data share buffer (64 KiB).
    pub const GDS_SIZE: u64 = 64 * 1024;

    /// Maximum number of faulting pages gathered per fault-buffer scan.
    pub const MAX_PAGE_FAULTS: u32 = 1024;
}

/// Root configuration structure containing all cache settings.
///
/// # Examples
///
/// ```
/// use gpucache_core::config::Config;
///
/// let config = Config::default();
/// assert!(config.general.readbacks);
/// assert_eq!(config.overlap.stream_leap_threshold, 16);
/// ```
///
/// Deserializing from JSON:
///
/// ```
/// use gpucache_core::config::Config;
///
/// let json = r#"{
///     "general": { "readbacks": false, "bda_enabled": true, "max_page_faults": 256 },
///     "stream": { "download_size": 1048576 },
///     "overlap": { "stream_leap_threshold": 4 }
/// }"#;
///
/// let config = Config::from_json_str(json).unwrap();
/// assert!(!config.general.readbacks);
/// assert_eq!(config.stream.download_size, 1 << 20);
/// assert_eq!(config.overlap.stream_leap_threshold, 4);
/// assert_eq!(config.overlap.stream_leap_pages, 128);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// General behaviour switches
    #[serde(default)]
    pub general: GeneralConfig,
    /// Utility buffer sizes
    #[serde(default)]
    pub stream: StreamConfig,
    /// Overlap resolution policy
    #[serde(default)]
    pub overlap: OverlapConfig,
}

impl Config {
    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Arguments
    ///
    /// * `json` - JSON text; missing fields take their defaults.
    ///
    /// # Returns
    ///
    /// The validated configuration, or a `ConfigError` describing the problem.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a JSON configuration file.
    ///
    /// # Returns
    ///
    /// The validated configuration, or a `ConfigError` if the file is unreadable or invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks values that deserialize but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("stream.stream_size", self.stream.stream_size),
            ("stream.staging_size", self.stream.staging_size),
            ("stream.download_size", self.stream.download_size),
            ("stream.device_local_size", self.stream.device_local_size),
        ];
        for (field, size) in sizes {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "utility buffers must not be empty".into(),
                });
            }
        }
        if self.general.gds_size == 0 || self.general.gds_size % 4 != 0 {
            return Err(ConfigError::Invalid {
                field: "general.gds_size",
                reason: format!("{} is not a non-zero multiple of 4", self.general.gds_size),
            });
        }
        if self.general.max_page_faults == 0 {
            return Err(ConfigError::Invalid {
                field: "general.max_page_faults",
                reason: "at least one fault must fit in a scan".into(),
            });
        }
        Ok(())
    }
}

/// General cache behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Watch GPU-modified pages for CPU reads so they are downloaded before use
    #[serde(default = "GeneralConfig::default_readbacks")]
    pub readbacks: bool,

    /// Maintain the BDA page table and fault buffer for direct-address access
    #[serde(default = "GeneralConfig::default_bda_enabled")]
    pub bda_enabled: bool,

    /// Maximum faulting pages collected per `process_fault_buffer` call
    #[serde(default = "GeneralConfig::default_max_page_faults")]
    pub max_page_faults: u32,

    /// Global data share size in bytes
    #[serde(default = "GeneralConfig::default_gds_size")]
    pub gds_size: u64,
}

impl GeneralConfig {
    /// Readbacks are on by default; without them GPU writes never reach the CPU.
    fn default_readbacks() -> bool {
        true
    }

    /// BDA tracking is on by default.
    fn default_bda_enabled() -> bool {
        true
    }

    /// Returns the default fault-scan capacity.
    fn default_max_page_faults() -> u32 {
        defaults::MAX_PAGE_FAULTS
    }

    /// Returns the default GDS size.
    fn default_gds_size() -> u64 {
        defaults::GDS_SIZE
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            readbacks: true,
            bda_enabled: true,
            max_page_faults: defaults::MAX_PAGE_FAULTS,
            gds_size: defaults::GDS_SIZE,
        }
    }
}

/// Sizes of the four utility (streaming) buffers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Transient stream buffer size in bytes
    #[serde(default = "StreamConfig::default_stream_size")]
    pub stream_size: u64,

    /// Upload staging buffer size in bytes
    #[serde(default = "StreamConfig::default_staging_size")]
    pub staging_size: u64,

    /// Download (readback) buffer size in bytes
    #[serde(default = "StreamConfig::default_download_size")]
    pub download_size: u64,

    /// Device-local scratch buffer size in bytes
    #[serde(default = "StreamConfig::default_device_local_size")]
    pub device_local_size: u64,
}

impl StreamConfig {
    /// Returns the default stream buffer size.
    fn default_stream_size() -> u64 {
        defaults::STREAM_SIZE
    }

    /// Returns the default staging buffer size.
    fn default_staging_size() -> u64 {
        defaults::STAGING_SIZE
    }

    /// Returns the default download buffer size.
    fn default_download_size() -> u64 {
        defaults::DOWNLOAD_SIZE
    }

    /// Returns the default device-local buffer size.
    fn default_device_local_size() -> u64 {
        defaults::DEVICE_LOCAL_SIZE
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_size: defaults::STREAM_SIZE,
            staging_size: defaults::STAGING_SIZE,
            download_size: defaults::DOWNLOAD_SIZE,
            device_local_size: defaults::DEVICE_LOCAL_SIZE,
        }
    }
}

/// Policy knobs for overlap resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlapConfig {
    /// Stream score above which overlapping buffers are treated as a stream
    #[serde(default = "OverlapConfig::default_threshold")]
    pub stream_leap_threshold: u32,

    /// Caching pages to pre-grow by once a stream leap fires
    #[serde(default = "OverlapConfig::default_pages")]
    pub stream_leap_pages: u64,
}

impl OverlapConfig {
    /// Returns the default stream leap threshold.
    fn default_threshold() -> u32 {
        defaults::STREAM_LEAP_THRESHOLD
    }

    /// Returns the default stream leap growth in caching pages.
    fn default_pages() -> u64 {
        defaults::STREAM_LEAP_PAGES
    }
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            stream_leap_threshold: defaults::STREAM_LEAP_THRESHOLD,
            stream_leap_pages: defaults::STREAM_LEAP_PAGES,
        }
    }
}
