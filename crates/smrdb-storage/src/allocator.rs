//! Zone allocator
//!
//! Placement policy per file kind:
//! - manifests: first fit among conventional zones below the superblocks
//! - logs: alternate between the two log zones
//! - everything else: first fit over sequential data zones
//!
//! Each pool keeps a resume cursor and wraps around once, so consecutive
//! allocations walk the device instead of hammering its lowest free zone.

use crate::device::ZoneDevice;
use crate::layout::Geometry;
use crate::zone::{Zone, ZoneBitmap};
use smrdb_common::{DiskStatus, Error, FileType, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Owner of the zone-usage bitmap and the device handle
pub struct ZoneAllocator {
    geometry: Geometry,
    device: Arc<dyn ZoneDevice>,
    bitmap: ZoneBitmap,
    manifest_cursor: u32,
    data_cursor: u32,
    cur_log_zone: u32,
    status: DiskStatus,
}

impl ZoneAllocator {
    /// Allocator over a freshly formatted bitmap
    pub fn new(geometry: Geometry, device: Arc<dyn ZoneDevice>) -> Self {
        let mut allocator = Self {
            geometry,
            device,
            bitmap: ZoneBitmap::new(geometry.num_zones),
            manifest_cursor: geometry.manifest_zones().start,
            data_cursor: geometry.first_data_zone(),
            cur_log_zone: geometry.log_zones()[0],
            status: DiskStatus::Normal,
        };
        allocator.reset();
        allocator
    }

    /// Clear the bitmap and reserve the fixed zones
    pub fn reset(&mut self) {
        self.bitmap.clear();
        for zone in 0..self.geometry.num_zones {
            if self.geometry.is_reserved(zone) {
                self.bitmap.set_used(zone);
            }
        }
        self.manifest_cursor = self.geometry.manifest_zones().start;
        self.data_cursor = self.geometry.first_data_zone();
        self.cur_log_zone = self.geometry.log_zones()[0];
        self.status = DiskStatus::Normal;
    }

    /// Replace the bitmap with a persisted one
    pub fn load(&mut self, bitmap: &[u8], cur_log_zone: u32) {
        self.bitmap = ZoneBitmap::from_bytes(bitmap, self.geometry.num_zones);
        for zone in 0..self.geometry.num_zones {
            if self.geometry.is_reserved(zone) {
                self.bitmap.set_used(zone);
            }
        }
        if self.geometry.log_zones().contains(&cur_log_zone) {
            self.cur_log_zone = cur_log_zone;
        }
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ZoneDevice> {
        &self.device
    }

    #[must_use]
    pub const fn bitmap(&self) -> &ZoneBitmap {
        &self.bitmap
    }

    #[must_use]
    pub const fn cur_log_zone(&self) -> u32 {
        self.cur_log_zone
    }

    #[must_use]
    pub const fn status(&self) -> DiskStatus {
        self.status
    }

    pub const fn set_status(&mut self, status: DiskStatus) {
        self.status = status;
    }

    /// Number of free zones
    #[must_use]
    pub const fn free_zones(&self) -> u32 {
        self.bitmap.free()
    }

    /// Free zones in the sequential data region
    #[must_use]
    pub fn free_data_zones(&self) -> u32 {
        let free = (self.geometry.first_data_zone()..self.geometry.num_zones)
            .filter(|z| !self.bitmap.is_used(*z))
            .count();
        u32::try_from(free).unwrap_or(u32::MAX)
    }

    /// Number of used zones
    #[must_use]
    pub const fn used_zones(&self) -> u32 {
        self.bitmap.used()
    }

    /// Choose a free zone for `kind` without claiming it
    ///
    /// `held` reports log zones still referenced by a live log.
    #[must_use]
    pub fn pick_free_zone(&mut self, kind: FileType, held: impl Fn(u32) -> bool) -> Option<u32> {
        match kind {
            FileType::Descriptor => {
                let range = self.geometry.manifest_zones();
                let zone = self
                    .bitmap
                    .first_free(range.start, range.end, self.manifest_cursor)?;
                self.manifest_cursor = zone + 1;
                Some(zone)
            }
            FileType::Log => {
                let [a, b] = self.geometry.log_zones();
                let next = if self.cur_log_zone == a { b } else { a };
                let zone = [next, self.cur_log_zone].into_iter().find(|z| !held(*z))?;
                self.cur_log_zone = zone;
                Some(zone)
            }
            _ => {
                let zone = self.bitmap.first_free(
                    self.geometry.first_data_zone(),
                    self.geometry.num_zones,
                    self.data_cursor,
                )?;
                self.data_cursor = zone + 1;
                Some(zone)
            }
        }
    }

    /// Allocate a zone for `kind`: reset it on the device and mark it used
    pub fn allocate_zone(&mut self, kind: FileType, held: impl Fn(u32) -> bool) -> Result<Zone> {
        let Some(zone) = self.pick_free_zone(kind, held) else {
            return Err(Error::no_space(format!(
                "no free zone for {kind:?} ({} of {} zones used)",
                self.bitmap.used(),
                self.bitmap.num_zones()
            )));
        };

        let lba = match self.device.allocate_zone(zone) {
            Ok(lba) => lba,
            Err(e) => {
                let diagnostics = self.device.zone_info(zone).ok();
                error!("zone {zone} allocation failed: {e}");
                return Err(Error::ZoneAllocation {
                    zone,
                    reason: e.to_string(),
                    diagnostics,
                });
            }
        };
        let expected = self.geometry.lba_of(zone);
        if lba != expected {
            error!("zone {zone} allocated at LBA {lba}, expected {expected}");
            return Err(Error::LbaMismatch {
                zone,
                expected,
                actual: lba,
            });
        }

        self.bitmap.set_used(zone);
        Ok(Zone::new(zone, self.geometry.zone_size))
    }

    /// Claim a zone recorded in persisted metadata
    pub fn mark_used(&mut self, zone: u32) {
        self.bitmap.set_used(zone);
    }

    /// Return a zone to the free pool; reserved zones stay used
    pub fn free_zone(&mut self, zone: u32) {
        if self.geometry.is_reserved(zone) {
            return;
        }
        if !self.bitmap.set_free(zone) {
            warn!("freeing zone {zone} that was not in use");
            return;
        }
        if self.status == DiskStatus::NoSpace {
            let free_bytes = u64::from(self.free_data_zones()) * self.geometry.zone_size;
            if free_bytes >= self.geometry.available_threshold() {
                info!("free space recovered ({free_bytes} bytes), accepting writes");
                self.status = DiskStatus::Normal;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedZoneDevice;
    use crate::layout::MIB;
    use smrdb_common::DiskConfig;

    fn setup() -> (ZoneAllocator, Arc<EmulatedZoneDevice>) {
        let cfg = DiskConfig::new("/tmp/x")
            .with_zone_size(MIB)
            .with_num_zones(96)
            .with_no_space_threshold(4 * MIB);
        let geometry = Geometry::from_config(&cfg, 96 * MIB).unwrap();
        let device = Arc::new(EmulatedZoneDevice::new(geometry));
        (ZoneAllocator::new(geometry, device.clone()), device)
    }

    #[test]
    fn test_reserved_zones_marked() {
        let (alloc, _) = setup();
        // 0..=3 and 61..=67
        assert_eq!(alloc.used_zones(), 11);
        assert_eq!(alloc.used_zones() + alloc.free_zones(), 96);
    }

    #[test]
    fn test_data_first_fit_with_cursor() {
        let (mut alloc, _) = setup();
        let a = alloc.allocate_zone(FileType::Table, |_| false).unwrap();
        let b = alloc.allocate_zone(FileType::Table, |_| false).unwrap();
        assert_eq!(a.number(), 68);
        assert_eq!(b.number(), 69);
        alloc.free_zone(68);
        // resumes after the cursor before wrapping back to 68
        assert_eq!(alloc.allocate_zone(FileType::Value, |_| false).unwrap().number(), 70);
    }

    #[test]
    fn test_data_wraps_once_then_no_space() {
        let (mut alloc, _) = setup();
        for _ in 68..96 {
            alloc.allocate_zone(FileType::Table, |_| false).unwrap();
        }
        alloc.free_zone(75);
        assert_eq!(alloc.allocate_zone(FileType::Table, |_| false).unwrap().number(), 75);
        let err = alloc.allocate_zone(FileType::Table, |_| false).unwrap_err();
        assert!(err.is_no_space());
    }

    #[test]
    fn test_manifest_and_log_pools() {
        let (mut alloc, _) = setup();
        assert_eq!(alloc.allocate_zone(FileType::Descriptor, |_| false).unwrap().number(), 4);
        assert_eq!(alloc.allocate_zone(FileType::Descriptor, |_| false).unwrap().number(), 5);
        assert_eq!(alloc.allocate_zone(FileType::Log, |_| false).unwrap().number(), 66);
        assert_eq!(alloc.allocate_zone(FileType::Log, |_| false).unwrap().number(), 65);
        // 66 still held by a live log
        assert_eq!(alloc.allocate_zone(FileType::Log, |z| z == 66).unwrap().number(), 65);
        assert!(alloc.allocate_zone(FileType::Log, |_| true).unwrap_err().is_no_space());
        // log zones are never released
        alloc.free_zone(65);
        assert!(alloc.bitmap().is_used(65));
    }

    #[test]
    fn test_device_failure_carries_diagnostics() {
        let (mut alloc, dev) = setup();
        dev.fail_allocation(68);
        match alloc.allocate_zone(FileType::Table, |_| false).unwrap_err() {
            Error::ZoneAllocation { zone, diagnostics, .. } => {
                assert_eq!(zone, 68);
                assert_eq!(diagnostics.unwrap().zone, 68);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!alloc.bitmap().is_used(68));
    }

    #[test]
    fn test_lba_mismatch_is_fatal() {
        let (mut alloc, dev) = setup();
        dev.skew_lba(1);
        let err = alloc.allocate_zone(FileType::Table, |_| false).unwrap_err();
        assert!(matches!(err, Error::LbaMismatch { zone: 68, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_free_zone_recovers_from_no_space() {
        let (mut alloc, _) = setup();
        for _ in 68..96 {
            alloc.allocate_zone(FileType::Table, |_| false).unwrap();
        }
        alloc.set_status(DiskStatus::NoSpace);
        // threshold is 2 * 4 MiB: needs 8 free zones
        for zone in 68..75 {
            alloc.free_zone(zone);
        }
        assert_eq!(alloc.status(), DiskStatus::NoSpace);
        assert_eq!(alloc.free_data_zones(), 7);
        alloc.free_zone(75);
        assert_eq!(alloc.status(), DiskStatus::Normal);
    }
}
