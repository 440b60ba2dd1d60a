//! Zone-management collaborator
//!
//! The allocator talks to the drive through [`ZoneDevice`]: allocate (reset)
//! a zone, query one zone's descriptor, and snapshot zone conditions for the
//! usage report. [`EmulatedZoneDevice`] keeps the same contract in memory
//! for image-backed disks and tests, and enforces sequential writes inside
//! every sequential zone it has reset.

use crate::layout::Geometry;
use parking_lot::Mutex;
use smrdb_common::{
    Error, Result, ZoneCondition, ZoneConditionSnapshot, ZoneDescriptor,
};
use std::collections::HashSet;
use tracing::debug;

/// Zone-management commands issued by the allocator
pub trait ZoneDevice: Send + Sync {
    /// Reset the zone's write pointer and return its starting LBA
    fn allocate_zone(&self, zone: u32) -> Result<u64>;

    /// Describe one zone
    fn zone_info(&self, zone: u32) -> Result<ZoneDescriptor>;

    /// Count zones per condition, restricted to `conditions`
    fn condition_snapshot(&self, conditions: &[ZoneCondition]) -> Result<ZoneConditionSnapshot>;

    /// Validate and account a data write of `len` bytes at `addr`
    fn check_write(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct ZoneState {
    condition: ZoneCondition,
    write_pointer: u64,
    // Reset during this session; untracked zones hold data of unknown extent.
    tracked: bool,
}

/// In-memory zoned device for image files
pub struct EmulatedZoneDevice {
    geometry: Geometry,
    zones: Mutex<Vec<ZoneState>>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    fail_allocate: HashSet<u32>,
    lba_skew: Option<u64>,
}

impl EmulatedZoneDevice {
    /// Device with every sequential zone empty
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let zones = (0..geometry.num_zones)
            .map(|z| ZoneState {
                condition: if geometry.is_conventional(z) {
                    ZoneCondition::NonSequential
                } else {
                    ZoneCondition::Empty
                },
                write_pointer: geometry.zone_start(z),
                tracked: false,
            })
            .collect();
        Self {
            geometry,
            zones: Mutex::new(zones),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Make allocation of `zone` fail until cleared
    pub fn fail_allocation(&self, zone: u32) {
        self.faults.lock().fail_allocate.insert(zone);
    }

    /// Stop failing allocations
    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.fail_allocate.clear();
        faults.lba_skew = None;
    }

    /// Report LBAs shifted by `sectors` on allocation
    pub fn skew_lba(&self, sectors: u64) {
        self.faults.lock().lba_skew = Some(sectors);
    }

    /// Move the write pointer of a zone as if it had been written
    pub fn mark_written(&self, zone: u32, bytes: u64) {
        let mut zones = self.zones.lock();
        if let Some(state) = zones.get_mut(zone as usize) {
            let start = self.geometry.zone_start(zone);
            state.write_pointer = (start + bytes).min(self.geometry.zone_end(zone));
            state.condition = self.condition_after_write(zone, state.write_pointer);
        }
    }

    fn condition_after_write(&self, zone: u32, write_pointer: u64) -> ZoneCondition {
        if self.geometry.is_conventional(zone) {
            ZoneCondition::NonSequential
        } else if write_pointer >= self.geometry.zone_end(zone) {
            ZoneCondition::Full
        } else if write_pointer == self.geometry.zone_start(zone) {
            ZoneCondition::Empty
        } else {
            ZoneCondition::ImplicitOpen
        }
    }

    fn check_zone(&self, zone: u32) -> Result<()> {
        if zone >= self.geometry.num_zones {
            return Err(Error::invalid_argument(format!(
                "zone {zone} out of range (device has {})",
                self.geometry.num_zones
            )));
        }
        Ok(())
    }
}

impl ZoneDevice for EmulatedZoneDevice {
    fn allocate_zone(&self, zone: u32) -> Result<u64> {
        self.check_zone(zone)?;
        let faults = self.faults.lock();
        if faults.fail_allocate.contains(&zone) {
            return Err(Error::Io(format!("reset write pointer of zone {zone} failed")));
        }
        let skew = faults.lba_skew.unwrap_or(0);
        drop(faults);

        let mut zones = self.zones.lock();
        let state = &mut zones[zone as usize];
        state.write_pointer = self.geometry.zone_start(zone);
        state.tracked = true;
        if !self.geometry.is_conventional(zone) {
            state.condition = ZoneCondition::Empty;
        }
        debug!("reset zone {zone}");
        Ok(self.geometry.lba_of(zone) + skew)
    }

    fn zone_info(&self, zone: u32) -> Result<ZoneDescriptor> {
        self.check_zone(zone)?;
        let state = self.zones.lock()[zone as usize];
        Ok(ZoneDescriptor {
            zone,
            condition: state.condition,
            start_lba: self.geometry.lba_of(zone),
            write_pointer: state.write_pointer / crate::layout::SECTOR_SIZE,
        })
    }

    fn condition_snapshot(&self, conditions: &[ZoneCondition]) -> Result<ZoneConditionSnapshot> {
        let zones = self.zones.lock();
        let counts = conditions
            .iter()
            .map(|c| {
                let n = zones.iter().filter(|z| z.condition == *c).count();
                (*c, u32::try_from(n).unwrap_or(u32::MAX))
            })
            .collect();
        Ok(ZoneConditionSnapshot { counts })
    }

    fn check_write(&self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let zone = self.geometry.zone_of(addr);
        self.check_zone(zone)?;
        if addr + len > self.geometry.zone_end(zone) {
            return Err(Error::invalid_argument(format!(
                "write of {len} bytes at {addr} crosses the end of zone {zone}"
            )));
        }
        if self.geometry.is_conventional(zone) {
            return Ok(());
        }
        let mut zones = self.zones.lock();
        let state = &mut zones[zone as usize];
        if !state.tracked {
            state.write_pointer = state.write_pointer.max(addr + len);
            state.condition = self.condition_after_write(zone, state.write_pointer);
            return Ok(());
        }
        if addr != state.write_pointer {
            return Err(Error::invalid_argument(format!(
                "unaligned write to zone {zone}: at {addr}, write pointer at {}",
                state.write_pointer
            )));
        }
        state.write_pointer = addr + len;
        state.condition = self.condition_after_write(zone, state.write_pointer);
        Ok(())
    }
}
