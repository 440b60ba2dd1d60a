//! Positional reader
//!
//! Reads go through one cached region of at most 5.25 MiB that never crosses
//! a segment boundary, so a run of nearby small reads costs one device read.

use crate::disk::Disk;
use crate::file_info::FileKey;
use crate::layout::{MAX_READ_REGION, MAX_READ_SIZE, align_down, align_up};
use crate::raw_io::AlignedBuffer;
use parking_lot::Mutex;
use smrdb_common::{Error, Result};
use std::sync::Arc;

struct CachedRegion {
    /// Logical offset of the first cached byte
    offset: u64,
    len: u64,
    /// Bytes of `buf` before the first cached byte
    skip: usize,
    buf: AlignedBuffer,
}

impl CachedRegion {
    const fn covers(&self, pos: u64) -> bool {
        pos >= self.offset && pos < self.offset + self.len
    }
}

/// Random access reader over one file
pub struct SmrRandomAccessFile {
    disk: Arc<Disk>,
    key: FileKey,
    cache: Mutex<Option<CachedRegion>>,
}

impl SmrRandomAccessFile {
    pub fn open(disk: Arc<Disk>, key: FileKey) -> Result<Self> {
        if !disk.contains_file(key) {
            return Err(Error::NotFound(key.name()));
        }
        Ok(Self {
            disk,
            key,
            cache: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn key(&self) -> FileKey {
        self.key
    }

    pub fn size(&self) -> Result<u64> {
        self.disk.file_size(self.key)
    }

    /// Fill `buf` from logical `offset`
    ///
    /// The whole range must lie inside the file and `buf` may not exceed the
    /// single-read limit.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len() as u64;
        let size = self.size()?;
        if offset > size {
            return Err(Error::invalid_argument(format!(
                "{}: offset {offset} past end of file ({size})",
                self.key
            )));
        }
        if n > MAX_READ_SIZE {
            return Err(Error::invalid_argument(format!(
                "{}: read of {n} bytes exceeds the {MAX_READ_SIZE} byte limit",
                self.key
            )));
        }
        if n > size - offset {
            return Err(Error::invalid_argument(format!(
                "{}: read of {n} bytes at {offset} runs past end of file ({size})",
                self.key
            )));
        }

        let mut cache = self.cache.lock();
        let mut done = 0u64;
        while done < n {
            let pos = offset + done;
            let region = match cache.take() {
                Some(region) if region.covers(pos) => region,
                _ => self.map_region(pos, n - done)?,
            };
            let within = (pos - region.offset) as usize;
            let take = (region.len - within as u64).min(n - done) as usize;
            let from = region.skip + within;
            buf[done as usize..done as usize + take]
                .copy_from_slice(&region.buf.as_slice()[from..from + take]);
            done += take as u64;
            *cache = Some(region);
        }
        Ok(buf.len())
    }

    /// Read `len` bytes at `offset` into a new vector
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    fn map_region(&self, pos: u64, wanted: u64) -> Result<CachedRegion> {
        let page = self.disk.page_size();
        let (addr, left) = self.disk.locate(self.key, pos)?;
        let len = wanted.min(left).min(MAX_READ_REGION);
        if len == 0 {
            return Err(Error::internal(format!("{}: no data mapped at {pos}", self.key)));
        }
        let start = align_down(addr, page);
        let end = align_up(addr + len, page);
        let mut buf = AlignedBuffer::new((end - start) as usize);
        self.disk.read_data(start, buf.as_mut_slice())?;
        Ok(CachedRegion {
            offset: pos,
            len,
            skip: (addr - start) as usize,
            buf,
        })
    }
}
