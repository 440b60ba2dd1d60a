//! Value file defragmentation
//!
//! Walks the sections of one value file and offers every indexed value back
//! to the engine through a conditional put. Keys that still reference the
//! old location get their payload stored inline; keys that moved on are
//! skipped. Each put commits on its own, so an aborted pass leaves nothing
//! half done.

use crate::disk::Disk;
use crate::file::SmrRandomAccessFile;
use crate::file_info::FileKey;
use crate::value::section::{decode_index, recover_sections};
use crate::value::store::{ExternalComparator, ExternalLocator, PutOutcome, ValueStore};
use serde::Serialize;
use smrdb_common::{Error, FileType, Result};
use std::sync::Arc;
use tracing::debug;

/// Outcome of one mover pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MoveStats {
    pub sections: usize,
    pub moved: u64,
    pub skipped: u64,
}

pub struct ValueMover {
    disk: Arc<Disk>,
    number: u64,
}

impl ValueMover {
    #[must_use]
    pub const fn new(disk: Arc<Disk>, number: u64) -> Self {
        Self { disk, number }
    }

    /// Move every live value out of the file
    ///
    /// A file that is gone or already obsolete is not attempted. Corrupt
    /// sections are reported with a zone condition snapshot.
    pub fn run(&self, store: &dyn ValueStore) -> Result<MoveStats> {
        let key = FileKey::new(self.number, FileType::Value);
        if !self.disk.contains_file(key) || self.disk.is_obsolete_value_file(self.number) {
            return Err(Error::not_attempted(format!("{key} has nothing to move")));
        }
        let reader = SmrRandomAccessFile::open(Arc::clone(&self.disk), key)?;
        let size = reader.size()?;
        let sections = recover_sections(size, |offset, buf| reader.read(offset, buf).map(|_| ()))
            .map_err(|e| self.escalate(key, e))?;

        let mut stats = MoveStats {
            sections: sections.len(),
            ..MoveStats::default()
        };
        for section in &sections {
            let block = reader.read_vec(u64::from(section.sst_offset), section.sst_size as usize)?;
            let entries = decode_index(&block).map_err(|e| self.escalate(key, e))?;
            for entry in entries {
                let locator = ExternalLocator {
                    file: self.number,
                    offset: entry.offset,
                    size: entry.size,
                };
                let mut cmp = ExternalComparator::new(locator, &reader);
                match store.conditional_put(&entry.key, &mut cmp)? {
                    PutOutcome::Written => stats.moved += 1,
                    PutOutcome::NotAttempted => stats.skipped += 1,
                }
            }
        }
        debug!("{key}: {stats:?}");
        Ok(stats)
    }

    fn escalate(&self, key: FileKey, e: Error) -> Error {
        if e.is_corruption() {
            self.disk.diagnose_corruption(format!("{key}: {e}"))
        } else {
            e
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MIB;
    use crate::value::{MemValueStore, StoredValue, ValueBuilder, ValueDeleter};
    use smrdb_common::DiskConfig;
    use std::time::Duration;

    fn disk(dir: &std::path::Path) -> Arc<Disk> {
        let cfg = DiskConfig::new(dir.join("disk.img"))
            .with_zone_size(MIB)
            .with_num_zones(96)
            .with_retry_backoff(Duration::ZERO);
        Disk::open(cfg).unwrap()
    }

    /// Value file 1 holding k0..k4, each referenced from the store
    fn populate(disk: &Arc<Disk>) -> (MemValueStore, Vec<ExternalLocator>) {
        let store = MemValueStore::new();
        let mut builder = ValueBuilder::new(Arc::clone(disk), || 1);
        let mut locators = Vec::new();
        for i in 0..5u8 {
            let key = format!("k{i}");
            let locator = builder.add(key.as_bytes(), &vec![i; 6000]).unwrap();
            store.put(key, StoredValue::External(locator));
            locators.push(locator);
        }
        builder.finish().unwrap();
        (store, locators)
    }

    #[test]
    fn test_moves_live_values_and_skips_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let (store, locators) = populate(&disk);
        store.put("k1", StoredValue::Internal(b"newer".to_vec()));
        store.delete(b"k3");

        let stats = ValueMover::new(Arc::clone(&disk), 1).run(&store).unwrap();
        assert_eq!(stats, MoveStats { sections: 1, moved: 3, skipped: 2 });
        assert_eq!(store.get(b"k0"), Some(StoredValue::Internal(vec![0; 6000])));
        assert_eq!(store.get(b"k1"), Some(StoredValue::Internal(b"newer".to_vec())));
        assert_eq!(store.get(b"k3"), None);
        assert_eq!(store.get(b"k4"), Some(StoredValue::Internal(vec![4; 6000])));
        assert_eq!(locators.len(), 5);
    }

    #[test]
    fn test_second_pass_is_not_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let (store, locators) = populate(&disk);
        store.put("k2", StoredValue::Internal(b"x".to_vec()));
        let mut deleter = ValueDeleter::new(Arc::clone(&disk));
        deleter.delete(&locators[2]);
        assert!(deleter.finalize().is_empty());

        let stats = disk.defragment_external(&store).unwrap();
        assert_eq!((stats.moved, stats.skipped), (4, 1));
        assert!(disk.is_obsolete_value_file(1));

        let again = disk.defragment_external(&store).unwrap_err();
        assert!(again.is_not_attempted());
        let direct = ValueMover::new(Arc::clone(&disk), 1).run(&store).unwrap_err();
        assert!(direct.is_not_attempted());

        assert_eq!(disk.delete_obsolete_value_files(), vec![1]);
        assert!(ValueMover::new(Arc::clone(&disk), 1).run(&store).unwrap_err().is_not_attempted());
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_corrupt_index_is_diagnosed() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let (store, _) = populate(&disk);
        // flip a byte of the index block, which starts right after five
        // two-page payloads
        let (addr, _) = disk.locate(FileKey::new(1, FileType::Value), 5 * 8192 + 4).unwrap();
        let mut page = vec![0u8; 4096];
        let page_addr = addr - addr % 4096;
        disk.read_data(page_addr, &mut page).unwrap();
        page[(addr - page_addr) as usize] ^= 0xFF;
        std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("disk.img"))
            .and_then(|f| std::os::unix::fs::FileExt::write_all_at(&f, &page, page_addr))
            .unwrap();

        let err = ValueMover::new(Arc::clone(&disk), 1).run(&store).unwrap_err();
        assert!(err.is_corruption());
    }
}
