//! Value file sections
//!
//! A value file is a run of sections. Each section is a batch of value
//! payloads followed by an index block that maps keys to payload locations,
//! closed by a fixed descriptor whose end is page aligned:
//!
//! ```text
//! | payloads ... | index block | zero padding | descriptor (20 bytes) |
//!                ^ sst_offset                                         ^ 4 KiB boundary
//! ```
//!
//! Descriptors chain backwards through `prev_end_offset`, so a reader walks
//! from the end of the file. A torn last section is skipped by stepping back
//! one page at a time until an intact descriptor turns up.

use bytes::{Buf, BufMut, BytesMut};
use smrdb_common::{Error, Result};
use tracing::{debug, warn};

/// Magic number of a section descriptor
pub const SECTION_MAGIC: u64 = 0x421d_413b_4533_423b;
/// Encoded size of a section descriptor
pub const DESCRIPTOR_SIZE: usize = 20;
/// Sections always end on this boundary
pub const SECTION_ALIGNMENT: u64 = 4096;

/// Trailer of one section
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// File offset of the index block
    pub sst_offset: u32,
    /// Encoded size of the index block
    pub sst_size: u32,
    /// End of the previous section (0 for the first one)
    pub prev_end_offset: u32,
}

impl SectionDescriptor {
    #[must_use]
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = BytesMut::with_capacity(DESCRIPTOR_SIZE);
        buf.put_u64_le(SECTION_MAGIC);
        buf.put_u32_le(self.sst_offset);
        buf.put_u32_le(self.sst_size);
        buf.put_u32_le(self.prev_end_offset);
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode a descriptor; `None` when the magic does not match
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < DESCRIPTOR_SIZE {
            return None;
        }
        let mut buf = data;
        if buf.get_u64_le() != SECTION_MAGIC {
            return None;
        }
        Some(Self {
            sst_offset: buf.get_u32_le(),
            sst_size: buf.get_u32_le(),
            prev_end_offset: buf.get_u32_le(),
        })
    }

    /// Offset just past this section's descriptor
    #[must_use]
    pub const fn end_offset(&self) -> u64 {
        self.sst_offset as u64 + section_tail_len(self.sst_size as u64)
    }

    /// Whether this descriptor could have been written ending at `end`
    const fn fits(&self, end: u64) -> bool {
        let sst_end = self.sst_offset as u64 + self.sst_size as u64;
        (self.prev_end_offset as u64) < end
            && sst_end + DESCRIPTOR_SIZE as u64 <= end
            && self.sst_offset >= self.prev_end_offset
    }
}

/// Bytes from the index block start to the end of the descriptor
#[must_use]
pub const fn section_tail_len(sst_size: u64) -> u64 {
    let n = sst_size + DESCRIPTOR_SIZE as u64;
    n.div_ceil(SECTION_ALIGNMENT) * SECTION_ALIGNMENT
}

/// One key in a section index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    /// File offset of the payload
    pub offset: u64,
    pub size: u32,
}

impl IndexEntry {
    /// Encoded size of this entry
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + self.key.len() + 8 + 4
    }
}

/// Encode an index block: count, entries, crc32c of everything before it
#[must_use]
pub fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let len = 4 + entries.iter().map(IndexEntry::encoded_len).sum::<usize>() + 4;
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u32_le(entry.key.len() as u32);
        buf.put_slice(&entry.key);
        buf.put_u64_le(entry.offset);
        buf.put_u32_le(entry.size);
    }
    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);
    buf.to_vec()
}

pub fn decode_index(data: &[u8]) -> Result<Vec<IndexEntry>> {
    if data.len() < 8 {
        return Err(Error::corruption(format!("index block of {} bytes is truncated", data.len())));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let mut trailer = trailer;
    let stored = trailer.get_u32_le();
    let actual = crc32c::crc32c(body);
    if stored != actual {
        return Err(Error::corruption(format!(
            "index block checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
        )));
    }
    let mut buf = body;
    let count = buf.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count.min(buf.remaining() / 16));
    for i in 0..count {
        if buf.remaining() < 4 {
            return Err(Error::corruption(format!("index entry {i} is truncated")));
        }
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len + 12 {
            return Err(Error::corruption(format!("index entry {i} is truncated")));
        }
        let key = buf[..key_len].to_vec();
        buf.advance(key_len);
        entries.push(IndexEntry {
            key,
            offset: buf.get_u64_le(),
            size: buf.get_u32_le(),
        });
    }
    if buf.has_remaining() {
        return Err(Error::corruption(format!(
            "{} trailing bytes after {count} index entries",
            buf.remaining()
        )));
    }
    Ok(entries)
}

/// Recover the section chain of a value file of `file_size` bytes
///
/// `read` fills a buffer from a file offset. Sections come back oldest
/// first. Garbage after the last intact section is skipped; a broken link
/// further back in the chain is corruption.
pub fn recover_sections(
    file_size: u64,
    mut read: impl FnMut(u64, &mut [u8]) -> Result<()>,
) -> Result<Vec<SectionDescriptor>> {
    let mut sections = Vec::new();
    let mut end = file_size - file_size % SECTION_ALIGNMENT;
    let mut buf = [0u8; DESCRIPTOR_SIZE];
    let mut skipped = 0u64;
    while end > 0 {
        read(end - DESCRIPTOR_SIZE as u64, &mut buf)?;
        match SectionDescriptor::decode(&buf).filter(|d| d.fits(end)) {
            Some(descriptor) => {
                sections.push(descriptor);
                end = u64::from(descriptor.prev_end_offset);
            }
            None if sections.is_empty() => {
                skipped += 1;
                end -= SECTION_ALIGNMENT;
            }
            None => {
                return Err(Error::corruption(format!(
                    "section chain broken at offset {end} after {} sections",
                    sections.len()
                )));
            }
        }
    }
    if sections.is_empty() && file_size > 0 {
        return Err(Error::corruption(format!(
            "no intact section in {file_size} bytes"
        )));
    }
    if skipped > 0 {
        warn!("skipped {skipped} pages of torn section data");
    }
    sections.reverse();
    debug!("recovered {} sections", sections.len());
    Ok(sections)
}
