//! Per-file metadata
//!
//! A file is an ordered list of segment handles. Logical offset `n` maps to
//! the segment where the cumulative size first exceeds `n`.

use crate::level::Level;
use crate::zone::{SegmentArena, SegmentId};
use serde::{Deserialize, Serialize};
use smrdb_common::FileType;
use std::collections::BTreeSet;
use std::fmt;

/// Identity of a logical file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    pub number: u64,
    pub kind: FileType,
}

impl FileKey {
    #[must_use]
    pub const fn new(number: u64, kind: FileType) -> Self {
        Self { number, kind }
    }

    /// Conventional file name
    #[must_use]
    pub fn name(&self) -> String {
        self.kind.file_name(self.number)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Entry bookkeeping for value files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValueInfo {
    /// Entries written
    pub total: u16,
    /// Entries no longer referenced
    pub deleted: u16,
}

impl FileValueInfo {
    pub fn incr_total(&mut self, n: u16) {
        self.total = self.total.saturating_add(n);
    }

    pub fn incr_deleted(&mut self, n: u16) {
        self.deleted = self.deleted.saturating_add(n).min(self.total);
    }

    /// Every written entry has been deleted
    #[must_use]
    pub const fn all_deleted(&self) -> bool {
        self.total > 0 && self.deleted >= self.total
    }
}

/// Metadata for one logical file
#[derive(Clone, Debug)]
pub struct FileInfo {
    key: FileKey,
    level: usize,
    segments: Vec<SegmentId>,
    value_info: FileValueInfo,
}

impl FileInfo {
    #[must_use]
    pub const fn new(key: FileKey, level: usize) -> Self {
        Self {
            key,
            level,
            segments: Vec::new(),
            value_info: FileValueInfo {
                total: 0,
                deleted: 0,
            },
        }
    }

    #[must_use]
    pub const fn key(&self) -> FileKey {
        self.key
    }

    #[must_use]
    pub const fn number(&self) -> u64 {
        self.key.number
    }

    #[must_use]
    pub const fn kind(&self) -> FileType {
        self.key.kind
    }

    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn segments(&self) -> &[SegmentId] {
        &self.segments
    }

    #[must_use]
    pub fn last_segment(&self) -> Option<SegmentId> {
        self.segments.last().copied()
    }

    #[must_use]
    pub const fn value_info(&self) -> FileValueInfo {
        self.value_info
    }

    pub fn value_info_mut(&mut self) -> &mut FileValueInfo {
        &mut self.value_info
    }

    /// Append a segment in write order
    pub fn push_segment(&mut self, id: SegmentId) {
        self.segments.push(id);
    }

    /// Position of a segment in the list
    #[must_use]
    pub fn index_of(&self, id: SegmentId) -> Option<usize> {
        self.segments.iter().position(|s| *s == id)
    }

    /// Replace `old` with `new` in place; false if `old` is not ours
    pub fn replace_segment(&mut self, old: SegmentId, new: &[SegmentId]) -> bool {
        let Some(idx) = self.index_of(old) else {
            return false;
        };
        self.segments.splice(idx..=idx, new.iter().copied());
        true
    }

    /// Drop a segment from the list
    pub fn remove_segment(&mut self, id: SegmentId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.segments.remove(idx);
        true
    }

    /// Logical size: sum of segment sizes
    #[must_use]
    pub fn size(&self, arena: &SegmentArena) -> u64 {
        self.segments
            .iter()
            .filter_map(|id| arena.get(*id))
            .map(|s| s.size)
            .sum()
    }

    /// Device address of logical `offset`, clamped to the file size
    #[must_use]
    pub fn address_of(&self, offset: u64, arena: &SegmentArena) -> Option<u64> {
        self.locate(offset, arena).map(|(addr, _)| addr)
    }

    /// Bytes from logical `offset` to the end of its segment
    #[must_use]
    pub fn size_to_segment_end(&self, offset: u64, arena: &SegmentArena) -> u64 {
        self.locate(offset, arena).map_or(0, |(_, left)| left)
    }

    /// (device address, bytes left in segment) for logical `offset`
    fn locate(&self, offset: u64, arena: &SegmentArena) -> Option<(u64, u64)> {
        let offset = offset.min(self.size(arena));
        let mut base = 0;
        let mut last = None;
        for seg in self.segments.iter().filter_map(|id| arena.get(*id)) {
            if offset < base + seg.size {
                let within = offset - base;
                return Some((seg.addr + within, seg.size - within));
            }
            base += seg.size;
            last = Some(seg);
        }
        // offset == size: one past the end of the last segment
        last.map(|s| (s.end(), 0))
    }

    /// Distinct zones holding the file
    #[must_use]
    pub fn num_zones(&self, arena: &SegmentArena) -> usize {
        self.segments
            .iter()
            .filter_map(|id| arena.get(*id))
            .map(|s| s.zone)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Closed, and its last zone takes no more writes from anyone
    #[must_use]
    pub fn is_defragmentable(&self, arena: &SegmentArena, level: &Level) -> bool {
        self.last_segment()
            .and_then(|id| arena.get(id))
            .is_some_and(|s| s.complete && !level.is_writable(s.zone) && !level.is_in_writing(s.zone))
    }
}
