//! File tables
//!
//! The disk keeps two maps: table-like files and value files. The value map
//! additionally tracks which file is being defragmented and which files have
//! no live entries left.

use crate::file_info::{FileInfo, FileKey};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Number-indexed file table
#[derive(Debug, Default)]
pub struct FileMap {
    files: BTreeMap<u64, FileInfo>,
    blocked_by_defragment: Option<u64>,
    obsolete: BTreeSet<u64>,
}

/// Per-file line of a map summary
#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub name: String,
    pub level: usize,
    pub segments: usize,
    pub total: u16,
    pub deleted: u16,
}

impl FileMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: FileInfo) {
        self.files.insert(info.number(), info);
    }

    pub fn remove(&mut self, number: u64) -> Option<FileInfo> {
        self.obsolete.remove(&number);
        if self.blocked_by_defragment == Some(number) {
            self.blocked_by_defragment = None;
        }
        self.files.remove(&number)
    }

    #[must_use]
    pub fn get(&self, number: u64) -> Option<&FileInfo> {
        self.files.get(&number)
    }

    pub fn get_mut(&mut self, number: u64) -> Option<&mut FileInfo> {
        self.files.get_mut(&number)
    }

    #[must_use]
    pub fn contains(&self, number: u64) -> bool {
        self.files.contains_key(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.obsolete.clear();
        self.blocked_by_defragment = None;
    }

    /// Pick the value file with the most deleted entries and block it
    ///
    /// `defragmentable` decides whether a file's storage is settled (its last
    /// zone is neither writable nor being written). Files whose entries are
    /// all deleted move to the obsolete set instead of being picked.
    pub fn pick_for_defrag(&mut self, defragmentable: impl Fn(&FileInfo) -> bool) -> Option<FileKey> {
        let mut best: Option<(u16, FileKey)> = None;
        let mut newly_obsolete = Vec::new();
        for info in self.files.values() {
            let value = info.value_info();
            if value.deleted == 0 || self.obsolete.contains(&info.number()) || !defragmentable(info) {
                continue;
            }
            if value.all_deleted() {
                newly_obsolete.push(info.number());
                continue;
            }
            if best.is_none_or(|(d, _)| value.deleted > d) {
                best = Some((value.deleted, info.key()));
            }
        }
        self.obsolete.extend(newly_obsolete);
        let (_, key) = best?;
        self.blocked_by_defragment = Some(key.number);
        Some(key)
    }

    /// Currently blocked file, if any
    #[must_use]
    pub const fn blocked(&self) -> Option<u64> {
        self.blocked_by_defragment
    }

    /// Clear the block only if it belongs to `number`
    pub fn unblock(&mut self, number: u64) {
        if self.blocked_by_defragment == Some(number) {
            self.blocked_by_defragment = None;
        }
    }

    /// Record that `number` has no live entries
    pub fn mark_obsolete(&mut self, number: u64) -> bool {
        self.files.contains_key(&number) && self.obsolete.insert(number)
    }

    #[must_use]
    pub fn is_obsolete(&self, number: u64) -> bool {
        self.obsolete.contains(&number)
    }

    /// Obsolete files awaiting deletion
    pub fn obsolete(&self) -> impl Iterator<Item = u64> + '_ {
        self.obsolete.iter().copied()
    }

    /// Any settled, non-obsolete file with deleted entries
    #[must_use]
    pub fn is_fragmented(&self, defragmentable: impl Fn(&FileInfo) -> bool) -> bool {
        self.files.values().any(|info| {
            info.value_info().deleted > 0
                && !self.obsolete.contains(&info.number())
                && defragmentable(info)
        })
    }

    /// Summary for logging and tooling
    #[must_use]
    pub fn summary(&self) -> Vec<FileSummary> {
        self.files
            .values()
            .map(|info| FileSummary {
                name: info.key().name(),
                level: info.level(),
                segments: info.segments().len(),
                total: info.value_info().total,
                deleted: info.value_info().deleted,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smrdb_common::FileType;

    fn value_file(number: u64, total: u16, deleted: u16) -> FileInfo {
        let mut info = FileInfo::new(FileKey::new(number, FileType::Value), 9);
        info.value_info_mut().incr_total(total);
        info.value_info_mut().incr_deleted(deleted);
        info
    }

    #[test]
    fn test_pick_most_deleted() {
        let mut map = FileMap::new();
        map.insert(value_file(1, 10, 2));
        map.insert(value_file(2, 10, 7));
        map.insert(value_file(3, 10, 0));
        let key = map.pick_for_defrag(|_| true).unwrap();
        assert_eq!(key.number, 2);
        assert_eq!(map.blocked(), Some(2));
    }

    #[test]
    fn test_pick_skips_unsettled_and_obsolete() {
        let mut map = FileMap::new();
        map.insert(value_file(1, 4, 4));
        map.insert(value_file(2, 10, 9));
        map.insert(value_file(3, 10, 1));
        let key = map.pick_for_defrag(|f| f.number() != 2).unwrap();
        assert_eq!(key.number, 3);
        assert!(map.is_obsolete(1));
        assert!(map.is_fragmented(|_| true));
    }

    #[test]
    fn test_pick_none() {
        let mut map = FileMap::new();
        map.insert(value_file(1, 5, 0));
        assert!(map.pick_for_defrag(|_| true).is_none());
        assert!(map.blocked().is_none());
        assert!(!map.is_fragmented(|_| true));
    }

    #[test]
    fn test_unblock_requires_match() {
        let mut map = FileMap::new();
        map.insert(value_file(5, 10, 3));
        map.pick_for_defrag(|_| true);
        map.unblock(4);
        assert_eq!(map.blocked(), Some(5));
        map.unblock(5);
        assert_eq!(map.blocked(), None);
    }

    #[test]
    fn test_remove_clears_state() {
        let mut map = FileMap::new();
        map.insert(value_file(5, 10, 3));
        assert!(map.mark_obsolete(5));
        assert!(!map.mark_obsolete(5));
        assert!(!map.mark_obsolete(6));
        assert!(map.remove(5).is_some());
        assert!(!map.is_obsolete(5));
        assert_eq!(map.obsolete().count(), 0);
    }
}
