//! Value file writer
//!
//! Appends large values out of line through the direct writer and returns
//! the locator the engine stores in their place. Every 512000 bytes of index,
//! and whenever a file is closed, the pending keys are written out as one
//! section so the file stays recoverable from its tail.

use crate::disk::Disk;
use crate::file::SmrDirectWritableFile;
use crate::layout::{VALUE_LEVEL, align_up};
use crate::value::deleter::ValueDeleter;
use crate::value::section::{
    DESCRIPTOR_SIZE, IndexEntry, SectionDescriptor, encode_index, section_tail_len,
};
use crate::value::store::ExternalLocator;
use smrdb_common::{Error, FileType, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Index bytes that trigger a section flush
pub const SECTION_INDEX_LIMIT: usize = 512_000;

/// Entries one value file can account for
const MAX_FILE_ENTRIES: usize = u16::MAX as usize;

/// Count field and checksum around the index entries
const INDEX_OVERHEAD: usize = 8;

struct OpenValueFile {
    number: u64,
    writer: SmrDirectWritableFile,
    pending: Vec<IndexEntry>,
    index_bytes: usize,
    prev_end: u32,
    entries: usize,
}

impl OpenValueFile {
    fn is_fresh(&self) -> bool {
        self.entries == 0
    }

    /// Bytes the next value plus the closing section would need
    fn required(&self, padded: u64, key_len: usize) -> u64 {
        let index = INDEX_OVERHEAD + self.index_bytes + 16 + key_len;
        padded + section_tail_len(index as u64)
    }

    fn flush_section(&mut self, disk: &Disk) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let index = encode_index(&self.pending);
        let sst_offset = self.writer.size()?;
        let tail = section_tail_len(index.len() as u64) as usize;
        let descriptor = SectionDescriptor {
            sst_offset: to_u32(sst_offset)?,
            sst_size: to_u32(index.len() as u64)?,
            prev_end_offset: self.prev_end,
        };
        let mut block = vec![0u8; tail];
        block[..index.len()].copy_from_slice(&index);
        block[tail - DESCRIPTOR_SIZE..].copy_from_slice(&descriptor.encode());
        self.writer.append(&block)?;

        let count = u16::try_from(self.pending.len())
            .map_err(|_| Error::internal("too many entries in one section"))?;
        disk.add_value_entries(self.number, count)?;
        self.prev_end = to_u32(sst_offset + tail as u64)?;
        debug!(
            "value file {}: section of {} entries at {sst_offset}",
            self.number,
            self.pending.len()
        );
        self.pending.clear();
        self.index_bytes = 0;
        Ok(())
    }
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::internal(format!("value file offset {value} overflows")))
}

/// Builds value files for one flush or compaction job
pub struct ValueBuilder {
    disk: Arc<Disk>,
    next_number: Box<dyn FnMut() -> u64 + Send>,
    current: Option<OpenValueFile>,
    added: Vec<ExternalLocator>,
    finished: Vec<u64>,
}

impl ValueBuilder {
    /// `next_number` hands out fresh file numbers from the engine
    pub fn new(disk: Arc<Disk>, next_number: impl FnMut() -> u64 + Send + 'static) -> Self {
        Self {
            disk,
            next_number: Box::new(next_number),
            current: None,
            added: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Store `value` out of line and return where it went
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<ExternalLocator> {
        let size = u32::try_from(value.len())
            .map_err(|_| Error::invalid_argument(format!("value of {} bytes is too large", value.len())))?;
        let padded = align_up(value.len() as u64, self.disk.page_size());
        loop {
            if self.current.is_none() {
                let file = self.open_file()?;
                self.current = Some(file);
            }
            let file = self
                .current
                .as_mut()
                .ok_or_else(|| Error::internal("no open value file"))?;
            let fits = file.required(padded, key.len()) <= file.writer.space_left()?
                && file.entries < MAX_FILE_ENTRIES;
            if fits {
                break;
            }
            if file.is_fresh() {
                return Err(Error::invalid_argument(format!(
                    "value of {} bytes does not fit in a value file",
                    value.len()
                )));
            }
            self.finish_file()?;
        }

        let disk = Arc::clone(&self.disk);
        let file = self
            .current
            .as_mut()
            .ok_or_else(|| Error::internal("value file vanished"))?;
        let offset = file.writer.append(value)?;
        let entry = IndexEntry {
            key: key.to_vec(),
            offset,
            size,
        };
        file.index_bytes += entry.encoded_len();
        file.entries += 1;
        file.pending.push(entry);
        let locator = ExternalLocator {
            file: file.number,
            offset,
            size,
        };
        if file.index_bytes > SECTION_INDEX_LIMIT {
            file.flush_section(&disk)?;
        }
        self.added.push(locator);
        Ok(locator)
    }

    /// Value files completed so far
    #[must_use]
    pub fn finished_files(&self) -> &[u64] {
        &self.finished
    }

    /// Close the open file and persist the entry counts
    ///
    /// Returns every value file this builder produced.
    pub fn finish(mut self) -> Result<Vec<u64>> {
        self.finish_file()?;
        self.disk.persist_metadata()?;
        info!("built {} value files with {} values", self.finished.len(), self.added.len());
        Ok(std::mem::take(&mut self.finished))
    }

    /// Close the open file and release every value added
    ///
    /// The files become obsolete and are deleted by the next cleanup pass.
    pub fn abandon(mut self) -> Result<Vec<u64>> {
        self.finish_file()?;
        let mut deleter = ValueDeleter::new(Arc::clone(&self.disk));
        for locator in &self.added {
            deleter.delete(locator);
        }
        let obsolete = deleter.finalize();
        info!("abandoned {} values in {} value files", self.added.len(), self.finished.len());
        Ok(obsolete)
    }

    fn open_file(&mut self) -> Result<OpenValueFile> {
        let number = (self.next_number)();
        let key = match self.disk.allocate_file(number, FileType::Value, VALUE_LEVEL) {
            Ok(key) => key,
            Err(e) if e.is_no_space() => {
                return Err(Error::no_space(format!("cannot obtain any more value files: {e}")));
            }
            Err(e) => return Err(e),
        };
        debug!("opened {key}");
        Ok(OpenValueFile {
            number,
            writer: SmrDirectWritableFile::new(Arc::clone(&self.disk), key)?,
            pending: Vec::new(),
            index_bytes: 0,
            prev_end: 0,
            entries: 0,
        })
    }

    fn finish_file(&mut self) -> Result<()> {
        let Some(mut file) = self.current.take() else {
            return Ok(());
        };
        file.flush_section(&self.disk)?;
        file.writer.close()?;
        self.finished.push(file.number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::SmrRandomAccessFile;
    use crate::file_info::FileKey;
    use crate::layout::MIB;
    use crate::value::section::{decode_index, recover_sections};
    use smrdb_common::DiskConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn disk(dir: &std::path::Path) -> Arc<Disk> {
        let cfg = DiskConfig::new(dir.join("disk.img"))
            .with_zone_size(MIB)
            .with_num_zones(96)
            .with_retry_backoff(Duration::ZERO);
        Disk::open(cfg).unwrap()
    }

    fn numbers(start: u64) -> impl FnMut() -> u64 + Send + 'static {
        let next = AtomicU64::new(start);
        move || next.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn test_values_read_back_and_sections_index_them() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let mut builder = ValueBuilder::new(Arc::clone(&disk), numbers(10));
        let mut added = Vec::new();
        for i in 0..12u8 {
            let value = vec![i; 100 * 1024 + usize::from(i)];
            let key = format!("key{i:02}").into_bytes();
            added.push((key.clone(), builder.add(&key, &value).unwrap(), value));
        }
        let files = builder.finish().unwrap();
        // nine values of 25 or 26 pages fill the first 256-page zone
        assert_eq!(files, vec![10, 11]);

        for (key, locator, value) in &added {
            let reader =
                SmrRandomAccessFile::open(Arc::clone(&disk), FileKey::new(locator.file, FileType::Value))
                    .unwrap();
            assert_eq!(reader.read_vec(locator.offset, value.len()).unwrap(), *value);

            let size = reader.size().unwrap();
            let sections = recover_sections(size, |o, b| reader.read(o, b).map(|_| ())).unwrap();
            let indexed = sections.iter().any(|s| {
                let block = reader.read_vec(u64::from(s.sst_offset), s.sst_size as usize).unwrap();
                decode_index(&block)
                    .unwrap()
                    .iter()
                    .any(|e| e.key == *key && e.offset == locator.offset)
            });
            assert!(indexed, "{key:?} missing from the section index");
        }

        let total: u16 = files.iter().map(|n| disk.value_info(*n).unwrap().total).sum();
        assert_eq!(total, 12);
    }

    #[test]
    fn test_large_index_splits_sections() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DiskConfig::new(dir.path().join("disk.img"))
            .with_zone_size(16 * MIB)
            .with_num_zones(80)
            .with_retry_backoff(Duration::ZERO);
        let disk = Disk::open(cfg).unwrap();
        let mut builder = ValueBuilder::new(Arc::clone(&disk), numbers(1));
        let key = vec![b'k'; 2000];
        for _ in 0..300 {
            builder.add(&key, b"v").unwrap();
        }
        let files = builder.finish().unwrap();
        assert_eq!(files, vec![1]);

        let reader = SmrRandomAccessFile::open(Arc::clone(&disk), FileKey::new(1, FileType::Value)).unwrap();
        let size = reader.size().unwrap();
        let sections = recover_sections(size, |o, b| reader.read(o, b).map(|_| ())).unwrap();
        // 2016 bytes per entry: the index passes 512000 at entry 254
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].prev_end_offset as u64, sections[0].end_offset());
    }

    #[test]
    fn test_oversized_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let mut builder = ValueBuilder::new(Arc::clone(&disk), numbers(1));
        let err = builder.add(b"big", &vec![0; MIB as usize]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_abandon_obsoletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let mut builder = ValueBuilder::new(Arc::clone(&disk), numbers(5));
        builder.add(b"a", &[1; 5000]).unwrap();
        builder.add(b"b", &[2; 5000]).unwrap();
        let obsolete = builder.abandon().unwrap();
        assert_eq!(obsolete, vec![5]);
        assert!(disk.is_obsolete_value_file(5));
        assert_eq!(disk.delete_obsolete_value_files(), vec![5]);
        disk.verify_zone_accounting().unwrap();
    }
}
