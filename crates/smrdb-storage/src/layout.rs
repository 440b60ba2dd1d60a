//! On-disk layout and zone geometry
//!
//! Zone map of a formatted device (`S` is the first superblock zone):
//! ```text
//! +--------+-------------------+-------------+-----+----------+-----+-----------------+
//! | 0..=3  | 4..S              | S, S+1, S+2 | S+3 | S+4, S+5 | S+6 | S+7..           |
//! |reserved| manifests (conv.) | superblocks | pad | log zones| pad | sequential data |
//! +--------+-------------------+-------------+-----+----------+-----+-----------------+
//! ```

use smrdb_common::{DiskConfig, Error, FileType, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Device sector size used for LBA arithmetic
pub const SECTOR_SIZE: u64 = 512;

/// Magic number at the start of every superblock page
pub const MAGIC_NUMBER: u64 = 0x534d_524b_5644_534b;

/// Number of redundant superblock copies
pub const NUMBER_SUPERBLOCKS: usize = 3;

/// Maximum bytes a superblock may occupy inside its zone
pub const SUPERBLOCK_CAPACITY: u64 = 5 * MIB;

/// Number of LSM levels tracked by the disk
pub const NUM_LEVELS: usize = 10;
/// Level holding manifest files
pub const DESCRIPTOR_LEVEL: usize = 7;
/// Level holding write-ahead logs
pub const LOG_LEVEL: usize = 8;
/// Level holding value files
pub const VALUE_LEVEL: usize = 9;

/// Writable staging window of the buffered writer
pub const MAP_REGION_SIZE: u64 = 5 * MIB;
/// Largest region mapped by the random access reader (5.25 MiB)
pub const MAX_READ_REGION: u64 = 5 * MIB + 256 * KIB;
/// Largest single random access read
pub const MAX_READ_SIZE: u64 = 5 * MIB + 264 * KIB;
/// Chunk size for sequential reads and segment moves
pub const SEQUENTIAL_CHUNK: u64 = MIB;

/// Round `value` up to a multiple of `alignment` (a power of two)
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment` (a power of two)
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Level that owns files of the given kind
#[must_use]
pub const fn level_for(kind: FileType, requested: usize) -> usize {
    match kind {
        FileType::Descriptor => DESCRIPTOR_LEVEL,
        FileType::Log => LOG_LEVEL,
        FileType::Value => VALUE_LEVEL,
        _ => requested,
    }
}

/// Zone geometry of one device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Zone size in bytes
    pub zone_size: u64,
    /// Total zones on the device
    pub num_zones: u32,
    /// I/O alignment
    pub page_size: u64,
    /// First superblock zone
    pub superblock_zone: u32,
    /// Zones below this number are conventional
    pub conventional_zones: u32,
    /// Free bytes below which the disk reports no space
    pub no_space_threshold: u64,
}

impl Geometry {
    /// Derive the geometry from configuration and the device size
    pub fn from_config(config: &DiskConfig, device_size: u64) -> Result<Self> {
        config.validate()?;
        let num_zones = match config.num_zones {
            Some(n) => n,
            None => u32::try_from(device_size / config.zone_size).map_err(|_| {
                Error::Configuration(format!("device of {device_size} bytes has too many zones"))
            })?,
        };
        let geometry = Self {
            zone_size: config.zone_size,
            num_zones,
            page_size: config.page_size,
            superblock_zone: config.superblock_zone,
            conventional_zones: config.conventional_zones,
            no_space_threshold: config.no_space_threshold,
        };
        if num_zones <= geometry.first_data_zone() {
            return Err(Error::Configuration(format!(
                "device has {num_zones} zones, need more than {}",
                geometry.first_data_zone()
            )));
        }
        if geometry.total_bytes() > device_size {
            return Err(Error::Configuration(format!(
                "{num_zones} zones of {} bytes exceed device size {device_size}",
                config.zone_size
            )));
        }
        Ok(geometry)
    }

    /// Byte address of the first byte of `zone`
    #[must_use]
    pub const fn zone_start(&self, zone: u32) -> u64 {
        zone as u64 * self.zone_size
    }

    /// Byte address one past the last byte of `zone`
    #[must_use]
    pub const fn zone_end(&self, zone: u32) -> u64 {
        self.zone_start(zone) + self.zone_size
    }

    /// Zone containing the byte address
    #[must_use]
    pub const fn zone_of(&self, addr: u64) -> u32 {
        (addr / self.zone_size) as u32
    }

    /// Expected starting LBA of `zone`
    #[must_use]
    pub const fn lba_of(&self, zone: u32) -> u64 {
        self.zone_start(zone) / SECTOR_SIZE
    }

    /// Zones holding the three superblock copies
    #[must_use]
    pub const fn superblock_zones(&self) -> [u32; NUMBER_SUPERBLOCKS] {
        let s = self.superblock_zone;
        [s, s + 1, s + 2]
    }

    /// Byte address of superblock `index`
    #[must_use]
    pub const fn superblock_addr(&self, index: usize) -> u64 {
        self.zone_start(self.superblock_zone + index as u32)
    }

    /// Bytes available to one superblock copy
    #[must_use]
    pub const fn superblock_capacity(&self) -> u64 {
        if self.zone_size < SUPERBLOCK_CAPACITY {
            self.zone_size
        } else {
            SUPERBLOCK_CAPACITY
        }
    }

    /// The two zones that alternate between log files
    #[must_use]
    pub const fn log_zones(&self) -> [u32; 2] {
        [self.superblock_zone + 4, self.superblock_zone + 5]
    }

    /// First zone handed out for table and value data
    #[must_use]
    pub const fn first_data_zone(&self) -> u32 {
        self.superblock_zone + 7
    }

    /// Zones available to manifests (conventional, below the superblocks)
    #[must_use]
    pub const fn manifest_zones(&self) -> std::ops::Range<u32> {
        4..self.superblock_zone
    }

    /// Whether `zone` is outside the allocator's reach for good
    #[must_use]
    pub const fn is_reserved(&self, zone: u32) -> bool {
        zone <= 3 || (zone >= self.superblock_zone && zone <= self.superblock_zone + 6)
    }

    /// Whether `zone` is conventional (no write pointer)
    #[must_use]
    pub const fn is_conventional(&self, zone: u32) -> bool {
        zone < self.conventional_zones
    }

    /// Bytes covered by all zones
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.num_zones as u64 * self.zone_size
    }

    /// Bytes usable for table and value data
    #[must_use]
    pub const fn usable_capacity(&self) -> u64 {
        (self.num_zones - self.first_data_zone()) as u64 * self.zone_size
    }

    /// Free bytes at which a no-space disk accepts writes again
    #[must_use]
    pub const fn available_threshold(&self) -> u64 {
        2 * self.no_space_threshold
    }

    /// Used bytes past which the disk counts as highly utilized
    #[must_use]
    pub const fn high_usage_threshold(&self) -> u64 {
        10 * self.no_space_threshold
    }
}
