//! Per-level zone pools
//!
//! Every level owns the zones its files were written into. A zone is in at
//! most one of two working sets: `writable` (room left, no active writer) or
//! `in_writing` (holds an incomplete segment). Zones in neither set are
//! settled and become candidates for defragmentation once they hold dead
//! space.

use crate::allocator::ZoneAllocator;
use crate::file_info::{FileInfo, FileKey};
use crate::layout::{DESCRIPTOR_LEVEL, Geometry, LOG_LEVEL};
use crate::zone::{Segment, SegmentArena, SegmentId, Zone};
use smrdb_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Rows of the zone histogram: files wholly inside a zone, capped at 5
pub const HISTOGRAM_ROWS: usize = 6;
/// Columns of the zone histogram: files spanning zones, capped at 2
pub const HISTOGRAM_COLS: usize = 3;

/// Full zones bucketed by (whole files, partial files)
pub type ZoneHistogram = [[u32; HISTOGRAM_COLS]; HISTOGRAM_ROWS];

/// Most zones moved by one defragmentation pass
const FRAGMENTED_ZONES_PER_PASS: usize = 2;

/// Zone placement counts for one level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PlacementCounts {
    /// Zones inside the pool the level is meant to use
    pub designated: u32,
    /// Zones outside it
    pub non_designated: u32,
}

/// One LSM level and the zones it owns
#[derive(Debug)]
pub struct Level {
    number: usize,
    zones: BTreeMap<u32, Zone>,
    writable: BTreeSet<u32>,
    in_writing: BTreeSet<u32>,
}

impl Level {
    #[must_use]
    pub const fn new(number: usize) -> Self {
        Self {
            number,
            zones: BTreeMap::new(),
            writable: BTreeSet::new(),
            in_writing: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    #[must_use]
    pub fn zone(&self, number: u32) -> Option<&Zone> {
        self.zones.get(&number)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    #[must_use]
    pub fn owns_zone(&self, number: u32) -> bool {
        self.zones.contains_key(&number)
    }

    #[must_use]
    pub fn is_writable(&self, zone: u32) -> bool {
        self.writable.contains(&zone)
    }

    #[must_use]
    pub fn is_in_writing(&self, zone: u32) -> bool {
        self.in_writing.contains(&zone)
    }

    /// Start a new segment for `owner`
    ///
    /// Value files always get a zone of their own. Other files reuse the
    /// first writable zone with room before claiming a fresh zone.
    pub fn allocate_segment(
        &mut self,
        owner: FileKey,
        alloc: &mut ZoneAllocator,
        arena: &mut SegmentArena,
    ) -> Result<SegmentId> {
        let page = alloc.geometry().page_size;
        let mut placement = None;

        if !owner.kind.is_value() {
            while let Some(number) = self.writable.pop_first() {
                let Some(zone) = self.zones.get(&number) else {
                    continue;
                };
                let Some(addr) = zone.next_segment_addr(page) else {
                    continue;
                };
                // an empty last segment still owns its start address
                let last_addr = zone.last_segment().and_then(|id| arena.get(id)).map(|s| s.addr);
                if last_addr.is_none_or(|last| addr > last) {
                    placement = Some((number, addr));
                    break;
                }
            }
        }

        let (number, addr) = match placement {
            Some(p) => p,
            None => {
                let zones = &self.zones;
                let zone = alloc.allocate_zone(owner.kind, |z| zones.contains_key(&z))?;
                let number = zone.number();
                let addr = zone.start();
                self.zones.insert(number, zone);
                (number, addr)
            }
        };

        let id = arena.insert(Segment {
            addr,
            size: 0,
            zone: number,
            level: self.number,
            owner,
            complete: false,
        });
        let zone = self
            .zones
            .get_mut(&number)
            .ok_or_else(|| Error::internal(format!("zone {number} vanished from level {}", self.number)))?;
        zone.attach(addr, id);
        self.in_writing.insert(number);
        debug!("level {}: segment at {addr:#x} in zone {number} for {owner}", self.number);
        Ok(id)
    }

    /// Create a file with its first segment
    pub fn allocate_file(
        &mut self,
        key: FileKey,
        alloc: &mut ZoneAllocator,
        arena: &mut SegmentArena,
    ) -> Result<FileInfo> {
        let id = self.allocate_segment(key, alloc, arena)?;
        let mut info = FileInfo::new(key, self.number);
        info.push_segment(id);
        Ok(info)
    }

    /// Account `new_size` bytes in an incomplete segment
    pub fn record_write(&mut self, id: SegmentId, new_size: u64, arena: &mut SegmentArena, page: u64) {
        let Some(seg) = arena.get_mut(id) else {
            return;
        };
        let old_size = seg.size;
        seg.size = new_size.max(old_size);
        if let Some(zone) = self.zones.get_mut(&seg.zone) {
            zone.grow(seg.addr, old_size, seg.size, page);
        }
    }

    /// Seal a segment; its zone goes back to the writable pool if it has room
    pub fn complete_segment(&mut self, id: SegmentId, arena: &mut SegmentArena, page: u64) {
        let Some(seg) = arena.get_mut(id) else {
            return;
        };
        if seg.complete {
            return;
        }
        seg.complete = true;
        let (zone_number, is_value) = (seg.zone, seg.owner.kind.is_value());
        self.in_writing.remove(&zone_number);
        if let Some(zone) = self.zones.get(&zone_number) {
            let is_last = zone.last_segment() == Some(id);
            if is_last && !is_value && zone.next_segment_addr(page).is_some() {
                self.writable.insert(zone_number);
            }
        }
    }

    /// Release every segment of `info`, newest first
    pub fn deallocate_file(&mut self, info: &FileInfo, alloc: &mut ZoneAllocator, arena: &mut SegmentArena) {
        for id in info.segments().iter().rev() {
            self.deallocate_segment(*id, alloc, arena);
        }
    }

    /// Release one segment; an emptied zone returns to the free pool
    pub fn deallocate_segment(
        &mut self,
        id: SegmentId,
        alloc: &mut ZoneAllocator,
        arena: &mut SegmentArena,
    ) -> Option<Segment> {
        let page = alloc.geometry().page_size;
        let seg = arena.remove(id)?;
        let Some(zone) = self.zones.get_mut(&seg.zone) else {
            debug!("level {}: zone {} of segment {:#x} not found", self.number, seg.zone, seg.addr);
            return Some(seg);
        };
        let was_last = zone.last_segment() == Some(id);
        zone.detach(seg.addr, seg.size, page);
        if !seg.complete {
            self.in_writing.remove(&seg.zone);
        }

        if zone.is_deallocatable() {
            self.zones.remove(&seg.zone);
            self.writable.remove(&seg.zone);
            self.in_writing.remove(&seg.zone);
            alloc.free_zone(seg.zone);
            debug!("level {}: released zone {}", self.number, seg.zone);
        } else if was_last {
            self.writable.remove(&seg.zone);
        }
        Some(seg)
    }

    /// Adopt a zone recorded in persisted metadata
    pub fn restore_zone(&mut self, zone: Zone) {
        self.zones.insert(zone.number(), zone);
    }

    pub fn zone_mut(&mut self, number: u32) -> Option<&mut Zone> {
        self.zones.get_mut(&number)
    }

    /// Put every zone with room into the writable pool
    pub fn rebuild_writable(&mut self, page: u64, value_level: bool) {
        self.writable.clear();
        self.in_writing.clear();
        if value_level {
            return;
        }
        self.writable.extend(
            self.zones
                .values()
                .filter(|z| z.next_segment_addr(page).is_some())
                .map(Zone::number),
        );
    }

    pub fn set_zone_writable(&mut self, zone: u32) {
        if self.zones.contains_key(&zone) {
            self.writable.insert(zone);
        }
    }

    pub fn set_zone_not_writable(&mut self, zone: u32) {
        self.writable.remove(&zone);
    }

    /// Settled zones holding dead space, at most two
    #[must_use]
    pub fn fragmented_zones(&self) -> Vec<u32> {
        self.settled_fragmented()
            .take(FRAGMENTED_ZONES_PER_PASS)
            .collect()
    }

    /// More than one settled zone holds dead space
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.settled_fragmented().nth(1).is_some()
    }

    fn settled_fragmented(&self) -> impl Iterator<Item = u32> + '_ {
        self.zones
            .values()
            .filter(|z| {
                !self.writable.contains(&z.number())
                    && !self.in_writing.contains(&z.number())
                    && z.is_fragmented()
            })
            .map(Zone::number)
    }

    /// Full zones bucketed by how many files sit wholly inside them
    ///
    /// `zones_of` returns how many zones a file spans.
    #[must_use]
    pub fn zone_histogram(&self, arena: &SegmentArena, zones_of: impl Fn(FileKey) -> usize) -> ZoneHistogram {
        let mut histogram = [[0; HISTOGRAM_COLS]; HISTOGRAM_ROWS];
        for zone in self.zones.values().filter(|z| z.is_full()) {
            let (mut whole, mut partial) = (0usize, 0usize);
            for seg in zone.segments().filter_map(|id| arena.get(id)) {
                match zones_of(seg.owner) {
                    0 => {}
                    1 => whole += 1,
                    _ => partial += 1,
                }
            }
            histogram[whole.min(HISTOGRAM_ROWS - 1)][partial.min(HISTOGRAM_COLS - 1)] += 1;
        }
        histogram
    }

    /// Count zones inside and outside the pool this level should draw from
    #[must_use]
    pub fn placement_counts(&self, geometry: &Geometry) -> PlacementCounts {
        let mut counts = PlacementCounts::default();
        for number in self.zones.keys().copied() {
            let designated = match self.number {
                DESCRIPTOR_LEVEL => geometry.manifest_zones().contains(&number),
                LOG_LEVEL => geometry.log_zones().contains(&number),
                _ => number >= geometry.first_data_zone(),
            };
            if designated {
                counts.designated += 1;
            } else {
                counts.non_designated += 1;
            }
        }
        counts
    }

    /// Forget every zone; the caller resets the allocator
    pub fn clear(&mut self) {
        self.zones.clear();
        self.writable.clear();
        self.in_writing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedZoneDevice;
    use crate::layout::MIB;
    use smrdb_common::{DiskConfig, FileType};
    use std::sync::Arc;

    const PAGE: u64 = 4096;

    fn allocator() -> ZoneAllocator {
        let cfg = DiskConfig::new("/tmp/x").with_zone_size(MIB).with_num_zones(96);
        let geometry = Geometry::from_config(&cfg, 96 * MIB).unwrap();
        ZoneAllocator::new(geometry, Arc::new(EmulatedZoneDevice::new(geometry)))
    }

    fn table(n: u64) -> FileKey {
        FileKey::new(n, FileType::Table)
    }

    #[test]
    fn test_reuses_writable_zone() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(0);

        let a = level.allocate_file(table(1), &mut alloc, &mut arena).unwrap();
        let first = a.segments()[0];
        level.record_write(first, 5000, &mut arena, PAGE);
        level.complete_segment(first, &mut arena, PAGE);
        assert!(level.is_writable(68));

        let b = level.allocate_file(table(2), &mut alloc, &mut arena).unwrap();
        let seg = arena.get(b.segments()[0]).unwrap();
        assert_eq!(seg.zone, 68);
        assert_eq!(seg.addr, 68 * MIB + 8192);
        assert!(level.is_in_writing(68));
        assert!(!level.is_writable(68));
        assert_eq!(level.zone_count(), 1);
    }

    #[test]
    fn test_empty_segment_keeps_its_address() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(0);
        let a = level.allocate_file(table(1), &mut alloc, &mut arena).unwrap();
        level.complete_segment(a.segments()[0], &mut arena, PAGE);
        assert!(level.is_writable(68));

        let b = level.allocate_file(table(2), &mut alloc, &mut arena).unwrap();
        assert_eq!(arena.get(b.segments()[0]).unwrap().zone, 69);
        assert_eq!(level.zone(68).unwrap().segment_count(), 1);
    }

    #[test]
    fn test_in_writing_zone_not_shared() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(0);
        let a = level.allocate_file(table(1), &mut alloc, &mut arena).unwrap();
        let b = level.allocate_file(table(2), &mut alloc, &mut arena).unwrap();
        let za = arena.get(a.segments()[0]).unwrap().zone;
        let zb = arena.get(b.segments()[0]).unwrap().zone;
        assert_ne!(za, zb);
    }

    #[test]
    fn test_value_files_get_fresh_zones() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(9);
        let a = level
            .allocate_file(FileKey::new(1, FileType::Value), &mut alloc, &mut arena)
            .unwrap();
        let id = a.segments()[0];
        level.record_write(id, PAGE, &mut arena, PAGE);
        level.complete_segment(id, &mut arena, PAGE);
        assert!(!level.is_writable(68));
        let b = level
            .allocate_file(FileKey::new(2, FileType::Value), &mut alloc, &mut arena)
            .unwrap();
        assert_eq!(arena.get(b.segments()[0]).unwrap().zone, 69);
    }

    #[test]
    fn test_deallocate_releases_empty_zones() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(0);
        let used_before = alloc.used_zones();

        let info = level.allocate_file(table(1), &mut alloc, &mut arena).unwrap();
        let id = info.segments()[0];
        level.record_write(id, 100, &mut arena, PAGE);
        level.complete_segment(id, &mut arena, PAGE);
        assert_eq!(alloc.used_zones(), used_before + 1);

        level.deallocate_file(&info, &mut alloc, &mut arena);
        assert_eq!(alloc.used_zones(), used_before);
        assert_eq!(level.zone_count(), 0);
        assert!(arena.is_empty());
        assert!(!level.is_writable(68));
    }

    #[test]
    fn test_deallocating_last_segment_retires_zone_from_pool() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(0);

        let a = level.allocate_file(table(1), &mut alloc, &mut arena).unwrap();
        level.record_write(a.segments()[0], PAGE, &mut arena, PAGE);
        level.complete_segment(a.segments()[0], &mut arena, PAGE);
        let b = level.allocate_file(table(2), &mut alloc, &mut arena).unwrap();
        level.record_write(b.segments()[0], PAGE, &mut arena, PAGE);
        level.complete_segment(b.segments()[0], &mut arena, PAGE);
        assert!(level.is_writable(68));

        level.deallocate_file(&b, &mut alloc, &mut arena);
        assert!(level.owns_zone(68));
        assert!(!level.is_writable(68));
        // the zone now holds dead space behind the write pointer
        assert_eq!(level.fragmented_zones(), vec![68]);
        assert!(!level.is_fragmented());
    }

    #[test]
    fn test_fragmented_zones_capped() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(1);
        let mut files = Vec::new();
        for n in 0..6 {
            let info = level.allocate_file(table(n), &mut alloc, &mut arena).unwrap();
            let id = info.segments()[0];
            // fill the zone so it leaves the writable pool
            level.record_write(id, MIB, &mut arena, PAGE);
            level.complete_segment(id, &mut arena, PAGE);
            files.push(info);
        }
        assert!(level.fragmented_zones().is_empty());

        // shrink usage in three zones by replacing their content
        for info in &files[..3] {
            let id = info.segments()[0];
            let seg = arena.get(id).unwrap().clone();
            let zone = level.zone_mut(seg.zone).unwrap();
            zone.detach(seg.addr, MIB, PAGE);
            zone.attach(seg.addr, id);
            zone.grow(seg.addr, 0, PAGE, PAGE);
        }
        assert_eq!(level.fragmented_zones().len(), 2);
        assert!(level.is_fragmented());
    }

    #[test]
    fn test_zone_histogram() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(0);
        let mut infos = Vec::new();
        // three whole files share zone 68, the third fills it
        for (n, size) in [(1, 4 * PAGE), (2, 4 * PAGE), (3, MIB - 8 * PAGE)] {
            let info = level.allocate_file(table(n), &mut alloc, &mut arena).unwrap();
            level.record_write(info.segments()[0], size, &mut arena, PAGE);
            level.complete_segment(info.segments()[0], &mut arena, PAGE);
            infos.push(info);
        }
        let hist = level.zone_histogram(&arena, |_| 1);
        assert_eq!(hist[3][0], 1);
        assert_eq!(hist.iter().flatten().sum::<u32>(), 1);

        let hist = level.zone_histogram(&arena, |key| if key.number == 3 { 2 } else { 1 });
        assert_eq!(hist[2][1], 1);
    }

    #[test]
    fn test_placement_counts() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut manifests = Level::new(7);
        manifests
            .allocate_file(FileKey::new(1, FileType::Descriptor), &mut alloc, &mut arena)
            .unwrap();
        let counts = manifests.placement_counts(alloc.geometry());
        assert_eq!(counts.designated, 1);
        assert_eq!(counts.non_designated, 0);
    }

    #[test]
    fn test_no_space_propagates() {
        let mut alloc = allocator();
        let mut arena = SegmentArena::new();
        let mut level = Level::new(9);
        for n in 0..28 {
            level
                .allocate_file(FileKey::new(n, FileType::Value), &mut alloc, &mut arena)
                .unwrap();
        }
        let err = level
            .allocate_file(FileKey::new(99, FileType::Value), &mut alloc, &mut arena)
            .unwrap_err();
        assert!(err.is_no_space());
    }
}
