//! Core types for the SMR storage core
//!
//! This module defines the small value types that cross crate boundaries:
//! file kinds, zone conditions reported by the zoned device, and the
//! diagnostic snapshots attached to allocation failures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of logical file stored on the zoned device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    /// Sorted table file (`NNNNNN.sst`)
    Table,
    /// Unsorted table file (`NNNNNN.ust`)
    UnsortedTable,
    /// Write-ahead log (`NNNNNN.log`)
    Log,
    /// Manifest/descriptor (`MANIFEST-NNNNNN`)
    Descriptor,
    /// Temporary database file (`NNNNNN.dbtmp`)
    Temp,
    /// Temporary table file (`NNNNNN.ssttmp`)
    TableTemp,
    /// Out-of-line value file (`NNNNNN.dat`)
    Value,
}

impl FileType {
    /// Conventional on-disk name for a file of this kind
    #[must_use]
    pub fn file_name(self, number: u64) -> String {
        match self {
            Self::Table => format!("{number:06}.sst"),
            Self::UnsortedTable => format!("{number:06}.ust"),
            Self::Log => format!("{number:06}.log"),
            Self::Descriptor => format!("MANIFEST-{number:06}"),
            Self::Temp => format!("{number:06}.dbtmp"),
            Self::TableTemp => format!("{number:06}.ssttmp"),
            Self::Value => format!("{number:06}.dat"),
        }
    }

    /// Parse a conventional file name back into its number and kind
    #[must_use]
    pub fn parse_file_name(name: &str) -> Option<(u64, Self)> {
        if let Some(rest) = name.strip_prefix("MANIFEST-") {
            return rest.parse().ok().map(|n| (n, Self::Descriptor));
        }
        let (stem, ext) = name.split_once('.')?;
        let number = stem.parse().ok()?;
        let kind = match ext {
            "sst" => Self::Table,
            "ust" => Self::UnsortedTable,
            "log" => Self::Log,
            "dbtmp" => Self::Temp,
            "ssttmp" => Self::TableTemp,
            "dat" => Self::Value,
            _ => return None,
        };
        Some((number, kind))
    }

    /// Whether this kind lives in the value file map
    #[must_use]
    pub const fn is_value(self) -> bool {
        matches!(self, Self::Value)
    }
}

/// Zone condition as reported by the zoned device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ZoneCondition {
    /// Write pointer at zone start
    Empty,
    /// Opened implicitly by a write
    ImplicitOpen,
    /// Opened explicitly by the host
    ExplicitOpen,
    /// Write pointer at zone end
    Full,
    /// Conventional zone without a write pointer
    NonSequential,
    /// Zone cannot be used
    Offline,
}

impl ZoneCondition {
    /// Conditions included in the periodic usage snapshot
    pub const SNAPSHOT: [Self; 5] = [
        Self::Empty,
        Self::ImplicitOpen,
        Self::ExplicitOpen,
        Self::Full,
        Self::NonSequential,
    ];

    /// Short label used in reports
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::ImplicitOpen => "IMP_OPEN",
            Self::ExplicitOpen => "EXP_OPEN",
            Self::Full => "FULL",
            Self::NonSequential => "NON_SEQ",
            Self::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for ZoneCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Description of a single zone, queried from the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    /// Zone number
    pub zone: u32,
    /// Current condition
    pub condition: ZoneCondition,
    /// First LBA of the zone (512-byte sectors)
    pub start_lba: u64,
    /// Write pointer LBA (512-byte sectors)
    pub write_pointer: u64,
}

impl fmt::Display for ZoneDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zone {} cond {} start_lba {} wp {}",
            self.zone, self.condition, self.start_lba, self.write_pointer
        )
    }
}

/// Count of zones per condition
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConditionSnapshot {
    /// (condition, number of zones) in report order
    pub counts: Vec<(ZoneCondition, u32)>,
}

impl ZoneConditionSnapshot {
    /// Number of zones with the given condition
    #[must_use]
    pub fn count(&self, condition: ZoneCondition) -> u32 {
        self.counts
            .iter()
            .find(|(c, _)| *c == condition)
            .map_or(0, |(_, n)| *n)
    }
}

impl fmt::Display for ZoneConditionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (condition, n) in &self.counts {
            writeln!(f, "  {:<9} {n}", condition.label())?;
        }
        Ok(())
    }
}

/// Capacity status of the disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStatus {
    /// Accepting writes
    #[default]
    Normal,
    /// Free capacity dropped below the no-space threshold
    NoSpace,
}

/// Disk capacity summary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Usable bytes
    pub total: u64,
    /// Bytes held by data zones
    pub used: u64,
}

impl Capacity {
    /// Bytes not yet used
    #[must_use]
    pub const fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}
