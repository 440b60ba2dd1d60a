//! Superblock slots
//!
//! Each of the three copies occupies the start of its own zone:
//! ```text
//! +------------------+  slot address
//! |   Header page    |  magic, version, flags, sequence, body pointer, CRCs
//! +------------------+
//! |   Body half 0    |  bincode disk image
//! +------------------+
//! |   Body half 1    |  bincode disk image
//! +------------------+  slot address + capacity
//! ```
//!
//! A persist writes the new body into the half the header does not point at,
//! syncs, then rewrites the header page. A crash before the header lands
//! leaves the previous image intact; a torn header fails its checksum.

use crate::layout::{Geometry, MAGIC_NUMBER, align_down, align_up};
use crate::raw_io::{AlignedBuffer, RawFile, RetryPolicy};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use smrdb_common::{Error, FileType, Result};
use tracing::{debug, warn};
use uuid::Uuid;

/// Current superblock format version
pub const FORMAT_VERSION: u32 = 1;

/// Header flag: the slot holds a complete image
const FLAG_GOOD: u32 = 1;

/// magic(8) + version(4) + flags(4) + sequence(8) + body_slot(4) +
/// body_len(8) + body_crc(4) = 40
const HEADER_CHECKSUM_OFFSET: usize = 40;

/// Persisted extent of one segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub addr: u64,
    pub size: u64,
}

/// Persisted form of one file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub number: u64,
    pub kind: FileType,
    pub level: usize,
    pub segments: Vec<SegmentRecord>,
    pub value_total: u16,
    pub value_deleted: u16,
}

/// Persisted write pointer of one zone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePointer {
    pub zone: u32,
    pub write_pointer: u64,
}

/// Everything a superblock carries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskImage {
    pub disk_uuid: Uuid,
    pub zone_size: u64,
    pub num_zones: u32,
    pub cur_log_zone: u32,
    /// Zone-usage bitmap bytes
    pub bitmap: Vec<u8>,
    /// Contents of the CURRENT pointer file
    pub current: String,
    pub files: Vec<FileRecord>,
    pub value_files: Vec<FileRecord>,
    /// Write pointers of owned zones that have been written into
    pub write_pointers: Vec<ZonePointer>,
}

impl DiskImage {
    /// Encode for a superblock body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a superblock body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Fixed header at the start of a slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperblockHeader {
    pub magic: u64,
    pub version: u32,
    pub flags: u32,
    pub sequence: u64,
    /// Body half holding the image (0 or 1)
    pub body_slot: u32,
    pub body_len: u64,
    pub body_crc: u32,
    /// CRC32C of the preceding fields
    pub checksum: u32,
}

impl SuperblockHeader {
    fn new(sequence: u64, body_slot: u32, body: &[u8]) -> Self {
        let mut header = Self {
            magic: MAGIC_NUMBER,
            version: FORMAT_VERSION,
            flags: FLAG_GOOD,
            sequence,
            body_slot,
            body_len: body.len() as u64,
            body_crc: crc32c::crc32c(body),
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Serialize into one page
    pub fn to_bytes(&self, page_size: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(page_size);
        buf.put_u64_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.sequence);
        buf.put_u32_le(self.body_slot);
        buf.put_u64_le(self.body_len);
        buf.put_u32_le(self.body_crc);
        buf.put_u32_le(self.checksum);
        buf.resize(page_size, 0);
        buf
    }

    /// Parse a header page without validating it
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_CHECKSUM_OFFSET + 4 {
            return Err(Error::corruption("superblock header too small"));
        }
        let mut buf = data;
        Ok(Self {
            magic: buf.get_u64_le(),
            version: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            sequence: buf.get_u64_le(),
            body_slot: buf.get_u32_le(),
            body_len: buf.get_u64_le(),
            body_crc: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        })
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes(HEADER_CHECKSUM_OFFSET + 4);
        crc32c::crc32c(&bytes[..HEADER_CHECKSUM_OFFSET])
    }

    #[must_use]
    pub const fn is_good(&self) -> bool {
        self.flags & FLAG_GOOD != 0
    }
}

/// What a slot held when last loaded or written
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Unloaded,
    /// No superblock magic: never formatted
    Blank,
    /// Magic present but the content does not validate
    Corrupt(String),
    Good,
}

/// One of the three superblock copies
#[derive(Debug)]
pub struct Superblock {
    index: usize,
    addr: u64,
    page_size: u64,
    half_size: u64,
    state: SlotState,
    sequence: u64,
    body_slot: u32,
}

impl Superblock {
    #[must_use]
    pub fn new(index: usize, geometry: &Geometry) -> Self {
        let page_size = geometry.page_size;
        let half_size = align_down((geometry.superblock_capacity() - page_size) / 2, page_size);
        Self {
            index,
            addr: geometry.superblock_addr(index),
            page_size,
            half_size,
            state: SlotState::Unloaded,
            sequence: 0,
            body_slot: 0,
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub const fn state(&self) -> &SlotState {
        &self.state
    }

    #[must_use]
    pub const fn is_good(&self) -> bool {
        matches!(self.state, SlotState::Good)
    }

    #[must_use]
    pub const fn is_blank(&self) -> bool {
        matches!(self.state, SlotState::Blank)
    }

    /// Sequence number of the last image loaded or written
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Largest image a slot can hold
    #[must_use]
    pub const fn max_image_len(&self) -> u64 {
        self.half_size
    }

    fn body_addr(&self, slot: u32) -> u64 {
        self.addr + self.page_size + u64::from(slot) * self.half_size
    }

    fn mark_corrupt(&mut self, reason: String) {
        warn!("superblock {} at {:#x}: {reason}", self.index, self.addr);
        self.state = SlotState::Corrupt(reason);
    }

    /// Read and validate the slot, returning its image when good
    ///
    /// I/O errors propagate; content problems only change the state.
    pub fn load(&mut self, file: &RawFile, policy: RetryPolicy) -> Result<Option<DiskImage>> {
        let mut page = AlignedBuffer::new(self.page_size as usize);
        file.read_exact_retry(self.addr, page.as_mut_slice(), policy)?;
        let header = SuperblockHeader::from_bytes(page.as_slice())?;

        if header.magic != MAGIC_NUMBER {
            debug!("superblock {} is blank", self.index);
            self.state = SlotState::Blank;
            return Ok(None);
        }
        if header.checksum != header.compute_checksum() {
            self.mark_corrupt("header checksum mismatch".into());
            return Ok(None);
        }
        if header.version != FORMAT_VERSION {
            self.mark_corrupt(format!("unsupported format version {}", header.version));
            return Ok(None);
        }
        if !header.is_good() {
            self.mark_corrupt("good flag not set".into());
            return Ok(None);
        }
        if header.body_slot > 1 || header.body_len > self.half_size {
            self.mark_corrupt(format!(
                "body of {} bytes in half {} does not fit",
                header.body_len, header.body_slot
            ));
            return Ok(None);
        }

        let len = usize::try_from(header.body_len)
            .map_err(|_| Error::corruption("superblock body length overflow"))?;
        let mut body = AlignedBuffer::new(len);
        file.read_exact_retry(self.body_addr(header.body_slot), body.as_mut_slice(), policy)?;
        let body = &body.as_slice()[..len];
        if crc32c::crc32c(body) != header.body_crc {
            self.mark_corrupt("body checksum mismatch".into());
            return Ok(None);
        }
        let image = match DiskImage::from_bytes(body) {
            Ok(image) => image,
            Err(e) => {
                self.mark_corrupt(e.to_string());
                return Ok(None);
            }
        };

        self.state = SlotState::Good;
        self.sequence = header.sequence;
        self.body_slot = header.body_slot;
        debug!("superblock {} loaded, sequence {}", self.index, self.sequence);
        Ok(Some(image))
    }

    /// Write `image` (already encoded) with `sequence`
    ///
    /// On failure the slot is marked corrupt; its previous image may still be
    /// intact on disk but is no longer trusted.
    pub fn persist(&mut self, file: &RawFile, image: &[u8], sequence: u64, policy: RetryPolicy) -> Result<()> {
        if image.len() as u64 > self.half_size {
            return Err(Error::no_space(format!(
                "disk image of {} bytes exceeds superblock half of {}",
                image.len(),
                self.half_size
            )));
        }
        let target = if self.is_good() { 1 - self.body_slot } else { 0 };
        match self.write(file, image, sequence, target, policy) {
            Ok(()) => {
                self.state = SlotState::Good;
                self.sequence = sequence;
                self.body_slot = target;
                Ok(())
            }
            Err(e) => {
                self.mark_corrupt(format!("persist failed: {e}"));
                Err(e)
            }
        }
    }

    fn write(&self, file: &RawFile, image: &[u8], sequence: u64, slot: u32, policy: RetryPolicy) -> Result<()> {
        let mut body = AlignedBuffer::new(align_up(image.len() as u64, self.page_size) as usize);
        body.as_mut_slice()[..image.len()].copy_from_slice(image);
        file.write_all_retry(self.body_addr(slot), body.as_slice(), policy)?;
        file.sync_data()?;

        let header = SuperblockHeader::new(sequence, slot, image);
        let mut page = AlignedBuffer::new(self.page_size as usize);
        page.as_mut_slice()
            .copy_from_slice(&header.to_bytes(self.page_size as usize));
        file.write_all_retry(self.addr, page.as_slice(), policy)?;
        file.sync_data()
    }
}
