//! Forward-only reader
//!
//! Reads whole pages in chunks of up to 1 MiB and hands bytes out in order,
//! crossing segment boundaries as needed. The CURRENT pointer lives in the
//! superblock rather than in a zone, so it gets its own source.

use crate::disk::Disk;
use crate::file_info::FileKey;
use crate::layout::{SEQUENTIAL_CHUNK, align_down, align_up};
use crate::raw_io::AlignedBuffer;
use parking_lot::Mutex;
use smrdb_common::{Error, Result};
use std::sync::Arc;

enum Source {
    File(FileKey),
    Current(Vec<u8>),
}

struct Cursor {
    pos: u64,
    buf: AlignedBuffer,
}

/// Sequential reader over a file or the CURRENT pointer
pub struct SmrSequentialFile {
    disk: Arc<Disk>,
    source: Source,
    cursor: Mutex<Cursor>,
}

impl SmrSequentialFile {
    pub fn open(disk: Arc<Disk>, key: FileKey) -> Result<Self> {
        if !disk.contains_file(key) {
            return Err(Error::NotFound(key.name()));
        }
        Ok(Self::with_source(disk, Source::File(key)))
    }

    /// Reader over the CURRENT contents held in the superblock
    pub fn current(disk: Arc<Disk>) -> Result<Self> {
        let contents = disk.get_current();
        if contents.is_empty() {
            return Err(Error::Io("CURRENT is empty".into()));
        }
        Ok(Self::with_source(disk, Source::Current(contents.into_bytes())))
    }

    fn with_source(disk: Arc<Disk>, source: Source) -> Self {
        Self {
            disk,
            source,
            cursor: Mutex::new(Cursor {
                pos: 0,
                buf: AlignedBuffer::new(0),
            }),
        }
    }

    /// Read up to `buf.len()` bytes; 0 means end of file
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock();
        let key = match &self.source {
            Source::Current(bytes) => {
                let start = (cursor.pos as usize).min(bytes.len());
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                cursor.pos += n as u64;
                return Ok(n);
            }
            Source::File(key) => *key,
        };

        let size = self.disk.file_size(key)?;
        let mut done = 0usize;
        while done < buf.len() && cursor.pos < size {
            let (addr, left) = self.disk.locate(key, cursor.pos)?;
            let want = ((buf.len() - done) as u64)
                .min(left)
                .min(size - cursor.pos)
                .min(SEQUENTIAL_CHUNK);
            if want == 0 {
                return Err(Error::internal(format!(
                    "{key}: nothing readable at offset {}",
                    cursor.pos
                )));
            }
            let page = self.disk.page_size();
            let start = align_down(addr, page);
            let end = align_up(addr + want, page);
            let len = (end - start) as usize;
            if cursor.buf.len() < len {
                cursor.buf = AlignedBuffer::new(len);
            }
            self.disk.read_data(start, &mut cursor.buf.as_mut_slice()[..len])?;
            let skip = (addr - start) as usize;
            let want = want as usize;
            buf[done..done + want].copy_from_slice(&cursor.buf.as_slice()[skip..skip + want]);
            done += want;
            cursor.pos += want as u64;
        }
        Ok(done)
    }

    /// Advance the read position by `n` bytes, stopping at end of file
    pub fn skip(&self, n: u64) -> Result<()> {
        let size = match &self.source {
            Source::File(key) => self.disk.file_size(*key)?,
            Source::Current(bytes) => bytes.len() as u64,
        };
        let mut cursor = self.cursor.lock();
        cursor.pos = cursor.pos.saturating_add(n).min(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::SmrWritableFile;
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
    fn test_reads_whole_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let key = disk.allocate_file(3, FileType::Descriptor, 0).unwrap();
        let data: Vec<u8> = (0..3 * MIB as usize + 333).map(|i| (i % 253) as u8).collect();
        let file = SmrWritableFile::new(Arc::clone(&disk), key).unwrap();
        file.append(&data).unwrap();
        file.close().unwrap();

        let seq = SmrSequentialFile::open(Arc::clone(&disk), key).unwrap();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 777_777];
        loop {
            let n = seq.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_skip_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        let key = disk.allocate_file(1, FileType::Table, 0).unwrap();
        let file = SmrWritableFile::new(Arc::clone(&disk), key).unwrap();
        file.append(b"0123456789").unwrap();
        file.close().unwrap();

        let seq = SmrSequentialFile::open(Arc::clone(&disk), key).unwrap();
        seq.skip(4).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(seq.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");
        seq.skip(100).unwrap();
        assert_eq!(seq.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_current_source() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(dir.path());
        assert!(SmrSequentialFile::current(Arc::clone(&disk)).is_err());
        disk.put_current("MANIFEST-000007\n");
        let seq = SmrSequentialFile::current(Arc::clone(&disk)).unwrap();
        let mut buf = [0u8; 64];
        let n = seq.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"MANIFEST-000007\n");
        assert_eq!(seq.read(&mut buf).unwrap(), 0);
    }
}
