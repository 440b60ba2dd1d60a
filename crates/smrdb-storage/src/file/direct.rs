//! Unbuffered append-only writer
//!
//! Every append goes straight to the device, padded to a whole number of
//! pages, so logical offsets handed out by [`SmrDirectWritableFile::append`]
//! are always page aligned.

use crate::disk::Disk;
use crate::file_info::FileKey;
use crate::layout::align_up;
use crate::raw_io::{AlignedBuffer, SyncFlags};
use crate::sync_worker::SyncQueue;
use parking_lot::Mutex;
use smrdb_common::{Error, Result};
use std::sync::Arc;
use tracing::warn;

/// Direct writer, used for value files
pub struct SmrDirectWritableFile {
    disk: Arc<Disk>,
    key: FileKey,
    closed: Mutex<bool>,
}

impl SmrDirectWritableFile {
    pub fn new(disk: Arc<Disk>, key: FileKey) -> Result<Self> {
        if !disk.contains_file(key) {
            return Err(Error::NotFound(key.name()));
        }
        Ok(Self {
            disk,
            key,
            closed: Mutex::new(false),
        })
    }

    #[must_use]
    pub const fn key(&self) -> FileKey {
        self.key
    }

    /// Append `data` padded to the page size; returns its logical offset
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let closed = self.closed.lock();
        if *closed {
            return Err(Error::invalid_argument(format!("{} is closed", self.key)));
        }
        let page = self.disk.page_size();
        let padded = align_up(data.len() as u64, page);
        let offset = self.disk.file_size(self.key)?;
        if padded == 0 {
            return Ok(offset);
        }

        let mut tail = self.disk.tail(self.key)?;
        let mut rolls = 0;
        while tail.complete || tail.space_left(page) < padded {
            if self.key.kind.is_value() {
                return Err(Error::no_space("value file is single-segment only"));
            }
            // the first roll may land in a partly used zone, the second cannot
            if rolls == 2 {
                return Err(Error::no_space(format!(
                    "{}: write of {padded} bytes does not fit in a zone",
                    self.key
                )));
            }
            tail = self.disk.roll_segment(self.key)?;
            rolls += 1;
        }

        let at = align_up(tail.end(), page);
        let mut buf = AlignedBuffer::new(padded as usize);
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.disk.write_data(at, buf.as_slice())?;
        self.disk
            .record_append(self.key, tail.segment, at - tail.addr + padded)?;
        self.disk
            .bg_sync(SyncQueue::Regular, at, padded, SyncFlags::START)?;
        Ok(offset)
    }

    /// Bytes the current segment can still take
    pub fn space_left(&self) -> Result<u64> {
        let tail = self.disk.tail(self.key)?;
        if tail.complete {
            return Ok(0);
        }
        Ok(tail.space_left(self.disk.page_size()))
    }

    pub fn size(&self) -> Result<u64> {
        self.disk.file_size(self.key)
    }

    /// Wait for queued range syncs, then fdatasync
    pub fn sync(&self) -> Result<()> {
        self.disk.flush_background(SyncQueue::Regular)?;
        self.disk.sync_data()
    }

    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        self.disk.flush_background(SyncQueue::Regular)?;
        self.disk.sync_data()?;
        self.disk.complete_last_segment(self.key)?;
        *closed = true;
        Ok(())
    }
}

impl Drop for SmrDirectWritableFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing {} on drop failed: {e}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::SmrRandomAccessFile;
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

    #[test]
    fn test_offsets_are_page_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let key = disk.allocate_file(1, FileType::Value, 0).unwrap();
        let file = SmrDirectWritableFile::new(Arc::clone(&disk), key).unwrap();
        assert_eq!(file.append(b"alpha").unwrap(), 0);
        assert_eq!(file.append(&[7; 5000]).unwrap(), 4096);
        assert_eq!(file.append(b"omega").unwrap(), 12288);
        assert_eq!(file.size().unwrap(), 16384);
        file.close().unwrap();

        let reader = SmrRandomAccessFile::open(Arc::clone(&disk), key).unwrap();
        let mut buf = [0u8; 5];
        reader.read(12288, &mut buf).unwrap();
        assert_eq!(&buf, b"omega");
    }

    #[test]
    fn test_value_file_never_spans_segments() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let key = disk.allocate_file(1, FileType::Value, 0).unwrap();
        let file = SmrDirectWritableFile::new(Arc::clone(&disk), key).unwrap();
        file.append(&vec![1; (MIB - 4096) as usize]).unwrap();
        assert_eq!(file.space_left().unwrap(), 4096);
        let err = file.append(&[2; 4097]).unwrap_err();
        assert!(err.is_no_space());
        assert_eq!(disk.segment_count(key).unwrap(), 1);
        file.append(&[3; 4096]).unwrap();
        assert_eq!(file.space_left().unwrap(), 0);
    }

    #[test]
    fn test_table_file_rolls_to_new_zone() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let key = disk.allocate_file(1, FileType::Table, 0).unwrap();
        let file = SmrDirectWritableFile::new(Arc::clone(&disk), key).unwrap();
        file.append(&vec![1; (MIB - 4096) as usize]).unwrap();
        file.append(&[2; 8192]).unwrap();
        assert_eq!(disk.segment_count(key).unwrap(), 2);
        file.sync().unwrap();
        file.close().unwrap();
        assert!(file.append(b"late").is_err());
    }
}
