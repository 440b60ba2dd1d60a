//! Configuration for a zoned disk
//!
//! Every field has a serde default so a TOML file only needs to name the
//! device path.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn default_zone_size() -> u64 {
    256 * MIB
}

const fn default_page_size() -> u64 {
    4096
}

const fn default_superblock_zone() -> u32 {
    61
}

const fn default_conventional_zones() -> u32 {
    64
}

const fn default_create_if_missing() -> bool {
    true
}

const fn default_io_retries() -> u32 {
    3
}

const fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_no_space_threshold() -> u64 {
    10 * GIB
}

/// Configuration for a single zoned disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Path to the block device or emulated image
    pub path: PathBuf,
    /// Zone size in bytes
    #[serde(default = "default_zone_size")]
    pub zone_size: u64,
    /// Total number of zones; derived from the device size when absent
    #[serde(default)]
    pub num_zones: Option<u32>,
    /// I/O alignment in bytes
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// First of the three superblock zones
    #[serde(default = "default_superblock_zone")]
    pub superblock_zone: u32,
    /// Zones below this number accept random writes
    #[serde(default = "default_conventional_zones")]
    pub conventional_zones: u32,
    /// Format the device when no good superblock is found
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
    /// Attempts per physical read or write
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,
    /// Sleep between attempts, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Free bytes below which the disk reports no space
    #[serde(default = "default_no_space_threshold")]
    pub no_space_threshold: u64,
    /// Use direct I/O (`O_DIRECT` on Linux)
    #[serde(default)]
    pub direct_io: bool,
}

impl DiskConfig {
    /// Configuration with defaults for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            zone_size: default_zone_size(),
            num_zones: None,
            page_size: default_page_size(),
            superblock_zone: default_superblock_zone(),
            conventional_zones: default_conventional_zones(),
            create_if_missing: default_create_if_missing(),
            io_retries: default_io_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            no_space_threshold: default_no_space_threshold(),
            direct_io: false,
        }
    }

    #[must_use]
    pub const fn with_zone_size(mut self, zone_size: u64) -> Self {
        self.zone_size = zone_size;
        self
    }

    #[must_use]
    pub const fn with_num_zones(mut self, num_zones: u32) -> Self {
        self.num_zones = Some(num_zones);
        self
    }

    #[must_use]
    pub const fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_no_space_threshold(mut self, bytes: u64) -> Self {
        self.no_space_threshold = bytes;
        self
    }

    #[must_use]
    pub const fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    /// Sleep between I/O attempts
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Check geometry constraints
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.zone_size == 0 || self.zone_size % self.page_size != 0 {
            return Err(Error::Configuration(format!(
                "zone size {} is not a multiple of the page size {}",
                self.zone_size, self.page_size
            )));
        }
        if self.zone_size % 512 != 0 {
            return Err(Error::Configuration(
                "zone size must be sector aligned".into(),
            ));
        }
        if self.io_retries == 0 {
            return Err(Error::Configuration("io_retries must be at least 1".into()));
        }
        // Three superblocks, pad, two log zones, pad.
        let reserved_end = self.superblock_zone + 7;
        if self.superblock_zone <= 4 || reserved_end > self.conventional_zones + 4 {
            return Err(Error::Configuration(format!(
                "superblock zone {} does not fit the conventional region",
                self.superblock_zone
            )));
        }
        if let Some(n) = self.num_zones {
            if n <= reserved_end {
                return Err(Error::Configuration(format!(
                    "{n} zones leave no room for data"
                )));
            }
        }
        Ok(())
    }
}
