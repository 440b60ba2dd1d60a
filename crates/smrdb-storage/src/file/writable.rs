//! Buffered append-only writer
//!
//! Appends are staged in a page-aligned window of at most 5 MiB that never
//! crosses the end of the current zone. A full window is written at the end
//! of the file's last segment; when that segment has no room left, or ends on
//! a partial page, the writer seals it and continues in a fresh segment.

use crate::disk::Disk;
use crate::file_info::FileKey;
use crate::layout::{MAP_REGION_SIZE, align_down, align_up};
use crate::raw_io::{AlignedBuffer, SyncFlags};
use crate::sync_worker::SyncQueue;
use crate::zone::SegmentId;
use parking_lot::Mutex;
use smrdb_common::{Error, FileType, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Window of the last segment that staged bytes will land in
#[derive(Clone, Copy, Debug)]
struct Region {
    segment: SegmentId,
    /// Device address of the first staged byte
    addr: u64,
    /// Segment size when the window was mapped
    base_size: u64,
    capacity: usize,
}

struct WriterState {
    buffer: AlignedBuffer,
    region: Option<Region>,
    staged: usize,
    /// (segment index, bytes of that segment) already synced
    synced: (usize, u64),
    closed: bool,
}

/// Append-only file for tables, manifests and logs
pub struct SmrWritableFile {
    disk: Arc<Disk>,
    key: FileKey,
    inner: Mutex<WriterState>,
}

impl SmrWritableFile {
    /// Writer for a file already allocated on `disk`
    pub fn new(disk: Arc<Disk>, key: FileKey) -> Result<Self> {
        if !disk.contains_file(key) {
            return Err(Error::NotFound(key.name()));
        }
        Ok(Self {
            disk,
            key,
            inner: Mutex::new(WriterState {
                buffer: AlignedBuffer::new(MAP_REGION_SIZE as usize),
                region: None,
                staged: 0,
                synced: (0, 0),
                closed: false,
            }),
        })
    }

    #[must_use]
    pub const fn key(&self) -> FileKey {
        self.key
    }

    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut st = self.inner.lock();
        if st.closed {
            return Err(Error::invalid_argument(format!("{} is closed", self.key)));
        }
        let mut rest = data;
        while !rest.is_empty() {
            let Some(region) = st.region else {
                self.map_new_region(&mut st)?;
                continue;
            };
            let room = region.capacity - st.staged;
            if room == 0 {
                self.unmap_region(&mut st)?;
                continue;
            }
            let n = room.min(rest.len());
            let staged = st.staged;
            st.buffer.as_mut_slice()[staged..staged + n].copy_from_slice(&rest[..n]);
            st.staged += n;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Logical size including staged bytes
    pub fn size(&self) -> Result<u64> {
        let st = self.inner.lock();
        Ok(self.disk.file_size(self.key)? + st.staged as u64)
    }

    /// Write staged bytes and make everything appended so far durable
    pub fn sync(&self) -> Result<()> {
        let mut st = self.inner.lock();
        self.unmap_region(&mut st)?;
        self.sync_new_ranges(&mut st)?;
        if self.key.kind == FileType::Descriptor {
            self.disk.persist_metadata()?;
        }
        Ok(())
    }

    /// Flush, seal the last segment and sync
    pub fn close(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.closed {
            return Ok(());
        }
        self.unmap_region(&mut st)?;
        self.disk.complete_last_segment(self.key)?;
        self.sync_new_ranges(&mut st)?;
        st.closed = true;
        if self.key.kind == FileType::Descriptor {
            self.disk.persist_metadata()?;
        }
        debug!("closed {}", self.key);
        Ok(())
    }

    fn map_new_region(&self, st: &mut WriterState) -> Result<()> {
        let page = self.disk.page_size();
        let mut tail = self.disk.tail(self.key)?;
        if tail.complete || tail.size % page != 0 || tail.space_left(page) == 0 {
            tail = self.disk.roll_segment(self.key)?;
        }
        let capacity = tail.space_left(page).min(MAP_REGION_SIZE);
        if capacity == 0 {
            return Err(Error::no_space(format!("{}: new segment has no room", self.key)));
        }
        st.region = Some(Region {
            segment: tail.segment,
            addr: tail.end(),
            base_size: tail.size,
            capacity: capacity as usize,
        });
        st.staged = 0;
        Ok(())
    }

    /// Write out the staged window
    ///
    /// On failure the window and its bytes stay staged, so the error reaches
    /// every later `sync`/`close` until a write goes through.
    fn unmap_region(&self, st: &mut WriterState) -> Result<()> {
        let Some(region) = st.region else {
            return Ok(());
        };
        let staged = st.staged;
        if staged > 0 {
            let padded = align_up(staged as u64, self.disk.page_size()) as usize;
            st.buffer.as_mut_slice()[staged..padded].fill(0);
            self.disk.write_data(region.addr, &st.buffer.as_slice()[..padded])?;
            self.disk
                .record_append(self.key, region.segment, region.base_size + staged as u64)?;
        }
        st.region = None;
        st.staged = 0;
        Ok(())
    }

    /// Sync only the byte ranges written since the previous sync
    fn sync_new_ranges(&self, st: &mut WriterState) -> Result<()> {
        let page = self.disk.page_size();
        let (index, done) = st.synced;
        let segments = self.disk.segments_from(self.key, index)?;
        for (i, (addr, size)) in segments.iter().copied().enumerate() {
            let from = if i == 0 { done.min(size) } else { 0 };
            if from == size {
                continue;
            }
            let start = align_down(addr + from, page);
            let end = align_up(addr + size, page);
            self.disk
                .bg_sync(SyncQueue::Regular, start, end - start, SyncFlags::DURABLE)?;
        }
        if let Some((_, size)) = segments.last() {
            st.synced = (index + segments.len() - 1, *size);
        }
        Ok(())
    }
}

impl Drop for SmrWritableFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing {} on drop failed: {e}", self.key);
        }
    }
}
