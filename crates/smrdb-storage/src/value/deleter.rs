//! Deletion accounting for value files
//!
//! Compaction drops external locators as it rewrites tables. The deleter
//! tallies them per value file and applies the counts in one pass.

use crate::disk::Disk;
use crate::value::store::ExternalLocator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct ValueDeleter {
    disk: Arc<Disk>,
    counts: BTreeMap<u64, u64>,
}

impl ValueDeleter {
    #[must_use]
    pub const fn new(disk: Arc<Disk>) -> Self {
        Self {
            disk,
            counts: BTreeMap::new(),
        }
    }

    /// Note that `locator` is no longer referenced
    pub fn delete(&mut self, locator: &ExternalLocator) {
        *self.counts.entry(locator.file).or_default() += 1;
    }

    /// Apply the tallies; returns the files left without live entries
    ///
    /// Files that no longer exist are ignored. A file still being written
    /// keeps its counts but is not retired yet.
    pub fn finalize(self) -> Vec<u64> {
        let mut obsolete = Vec::new();
        for (file, mut n) in self.counts {
            let mut info = None;
            while n > 0 {
                let step = n.min(u64::from(u16::MAX));
                n -= step;
                info = self.disk.mark_values_deleted(file, step as u16);
                if info.is_none() {
                    break;
                }
            }
            let Some(info) = info else {
                debug!("value file {file} is gone, dropping its deletions");
                continue;
            };
            if !info.all_deleted() {
                continue;
            }
            if self.disk.value_file_in_writing(file) {
                debug!("value file {file} is fully deleted but still being written");
                continue;
            }
            self.disk.obsolete_value_file(file);
            obsolete.push(file);
        }
        obsolete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::SmrDirectWritableFile;
    use crate::layout::MIB;
    use smrdb_common::{DiskConfig, FileType};
    use std::time::Duration;

    fn disk(dir: &std::path::Path) -> Arc<Disk> {
        let cfg = DiskConfig::new(dir.join("disk.img"))
            .with_zone_size(MIB)
            .with_num_zones(96)
            .with_retry_backoff(Duration::ZERO);
        Disk::open(cfg).unwrap()
    }

    fn locator(file: u64) -> ExternalLocator {
        ExternalLocator {
            file,
            offset: 0,
            size: 1,
        }
    }

    #[test]
    fn test_partial_and_full_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        for number in [1, 2] {
            let key = disk.allocate_file(number, FileType::Value, 0).unwrap();
            disk.add_value_entries(number, 3).unwrap();
            disk.complete_last_segment(key).unwrap();
        }

        let mut deleter = ValueDeleter::new(Arc::clone(&disk));
        deleter.delete(&locator(1));
        for _ in 0..3 {
            deleter.delete(&locator(2));
        }
        deleter.delete(&locator(99));
        assert_eq!(deleter.finalize(), vec![2]);
        assert_eq!(disk.value_info(1).unwrap().deleted, 1);
        assert!(disk.is_obsolete_value_file(2));
        assert!(!disk.is_obsolete_value_file(1));
    }

    #[test]
    fn test_file_in_writing_is_not_retired() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let key = disk.allocate_file(7, FileType::Value, 0).unwrap();
        let writer = SmrDirectWritableFile::new(Arc::clone(&disk), key).unwrap();
        writer.append(b"payload").unwrap();
        disk.add_value_entries(7, 1).unwrap();

        let mut deleter = ValueDeleter::new(Arc::clone(&disk));
        deleter.delete(&locator(7));
        assert!(deleter.finalize().is_empty());
        assert!(disk.value_info(7).unwrap().all_deleted());
        assert!(!disk.is_obsolete_value_file(7));
        writer.close().unwrap();
    }
}
