//! Zones, segments and the zone-usage bitmap
//!
//! This module provides:
//! - `ZoneBitmap`: one bit per zone, set while the zone is owned or reserved
//! - `Segment` and `SegmentArena`: segments live in an arena and are
//!   referenced by `SegmentId` handles from zones and files
//! - `Zone`: an append-only region with a monotonic write pointer

use crate::file_info::FileKey;
use crate::layout::align_up;
use std::collections::BTreeMap;

/// Bitmap for tracking zone ownership
///
/// Uses one bit per zone: 0 = free, 1 = used
#[derive(Clone, Debug)]
pub struct ZoneBitmap {
    bits: Vec<u8>,
    num_zones: u32,
    used: u32,
}

impl ZoneBitmap {
    /// Create a bitmap with every zone free
    #[must_use]
    pub fn new(num_zones: u32) -> Self {
        Self {
            bits: vec![0u8; num_zones.div_ceil(8) as usize],
            num_zones,
            used: 0,
        }
    }

    /// Load bitmap from bytes
    #[must_use]
    pub fn from_bytes(data: &[u8], num_zones: u32) -> Self {
        let mut bits = vec![0u8; num_zones.div_ceil(8) as usize];
        let copy_len = bits.len().min(data.len());
        bits[..copy_len].copy_from_slice(&data[..copy_len]);

        let used = (0..num_zones)
            .filter(|z| Self::is_set_in_slice(&bits, *z))
            .count();
        Self {
            bits,
            num_zones,
            used: u32::try_from(used).unwrap_or(num_zones),
        }
    }

    /// Get the bitmap data as bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Total zones tracked
    #[must_use]
    pub const fn num_zones(&self) -> u32 {
        self.num_zones
    }

    /// Zones currently marked used
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }

    /// Zones currently free
    #[must_use]
    pub const fn free(&self) -> u32 {
        self.num_zones - self.used
    }

    /// Check if a zone is used; out of range zones count as used
    #[must_use]
    pub fn is_used(&self, zone: u32) -> bool {
        if zone >= self.num_zones {
            return true;
        }
        Self::is_set_in_slice(&self.bits, zone)
    }

    /// Mark a zone used; returns false if it already was
    pub fn set_used(&mut self, zone: u32) -> bool {
        if zone >= self.num_zones || Self::is_set_in_slice(&self.bits, zone) {
            return false;
        }
        let (byte, bit) = Self::position(zone);
        self.bits[byte] |= 1 << bit;
        self.used += 1;
        true
    }

    /// Mark a zone free; returns false if it already was
    pub fn set_free(&mut self, zone: u32) -> bool {
        if zone >= self.num_zones || !Self::is_set_in_slice(&self.bits, zone) {
            return false;
        }
        let (byte, bit) = Self::position(zone);
        self.bits[byte] &= !(1 << bit);
        self.used -= 1;
        true
    }

    /// Mark every zone free
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.used = 0;
    }

    /// First free zone in `[start, end)`, scanning from `cursor` and wrapping once
    #[must_use]
    pub fn first_free(&self, start: u32, end: u32, cursor: u32) -> Option<u32> {
        let end = end.min(self.num_zones);
        if start >= end {
            return None;
        }
        let from = cursor.clamp(start, end);
        (from..end)
            .chain(start..from)
            .find(|z| !Self::is_set_in_slice(&self.bits, *z))
    }

    const fn position(zone: u32) -> (usize, u8) {
        ((zone / 8) as usize, (zone % 8) as u8)
    }

    fn is_set_in_slice(data: &[u8], zone: u32) -> bool {
        let (byte, bit) = Self::position(zone);
        data[byte] & (1 << bit) != 0
    }
}

/// Handle to a segment in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u32);

impl SegmentId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A contiguous byte range inside one zone, owned by one file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Device byte address of the first byte
    pub addr: u64,
    /// Bytes written so far
    pub size: u64,
    /// Zone containing the segment
    pub zone: u32,
    /// Level owning the zone
    pub level: usize,
    /// File owning the segment
    pub owner: FileKey,
    /// No more appends allowed
    pub complete: bool,
}

impl Segment {
    /// Device address one past the last written byte
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }

    /// Bytes left between the page-rounded end and `zone_end`
    #[must_use]
    pub const fn space_left(&self, zone_end: u64, page_size: u64) -> u64 {
        zone_end.saturating_sub(align_up(self.end(), page_size))
    }
}

/// Owner of every live segment
#[derive(Debug, Default)]
pub struct SegmentArena {
    slots: Vec<Option<Segment>>,
    free: Vec<u32>,
    live: usize,
}

impl SegmentArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a segment and return its handle
    pub fn insert(&mut self, segment: Segment) -> SegmentId {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(segment);
            return SegmentId(idx);
        }
        self.slots.push(Some(segment));
        SegmentId(u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX))
    }

    /// Remove a segment, invalidating its handle
    pub fn remove(&mut self, id: SegmentId) -> Option<Segment> {
        let taken = self.slots.get_mut(id.index())?.take();
        if taken.is_some() {
            self.live -= 1;
            self.free.push(id.0);
        }
        taken
    }

    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Number of live segments
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every segment
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }
}

/// A fixed-size append-only region of the device
#[derive(Clone, Debug)]
pub struct Zone {
    number: u32,
    start: u64,
    end: u64,
    usage: u64,
    write_pointer: u64,
    segments: BTreeMap<u64, SegmentId>,
}

impl Zone {
    /// Fresh zone with its write pointer at the start
    #[must_use]
    pub fn new(number: u32, zone_size: u64) -> Self {
        let start = u64::from(number) * zone_size;
        Self {
            number,
            start,
            end: start + zone_size,
            usage: 0,
            write_pointer: start,
            segments: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }

    /// Page-rounded bytes held by segments
    #[must_use]
    pub const fn usage(&self) -> u64 {
        self.usage
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Highest address written, page rounded
    #[must_use]
    pub const fn write_pointer(&self) -> u64 {
        self.write_pointer
    }

    /// Segments in address order
    pub fn segments(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.segments.values().copied()
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment with the highest address
    #[must_use]
    pub fn last_segment(&self) -> Option<SegmentId> {
        self.segments.values().next_back().copied()
    }

    /// Address where the next segment would start, if any room is left
    #[must_use]
    pub const fn next_segment_addr(&self, page_size: u64) -> Option<u64> {
        let addr = align_up(self.write_pointer, page_size);
        if addr >= self.end { None } else { Some(addr) }
    }

    /// Link a segment placed at `addr`
    pub fn attach(&mut self, addr: u64, id: SegmentId) {
        self.segments.insert(addr, id);
        self.write_pointer = self.write_pointer.max(addr);
    }

    /// Raise the write pointer to `addr`, clamped to the zone end
    pub fn advance_write_pointer(&mut self, addr: u64) {
        self.write_pointer = self.write_pointer.max(addr.min(self.end));
    }

    /// Unlink the segment at `addr` and release its page-rounded size
    pub fn detach(&mut self, addr: u64, size: u64, page_size: u64) -> Option<SegmentId> {
        let id = self.segments.remove(&addr)?;
        self.usage = self.usage.saturating_sub(align_up(size, page_size));
        Some(id)
    }

    /// Account growth of the segment at `addr` from `old_size` to `new_size`
    pub fn grow(&mut self, addr: u64, old_size: u64, new_size: u64, page_size: u64) {
        let before = align_up(old_size, page_size);
        let after = align_up(new_size, page_size);
        self.usage = (self.usage + after).saturating_sub(before);
        self.write_pointer = self.write_pointer.max(align_up(addr + new_size, page_size));
    }

    /// Whether usage covers the whole zone
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.usage >= self.end - self.start
    }

    /// Whether the zone holds dead space worth reclaiming
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.segments.is_empty() || !self.is_full()
    }

    /// Whether no segment references the zone
    #[must_use]
    pub fn is_deallocatable(&self) -> bool {
        self.segments.is_empty()
    }
}
