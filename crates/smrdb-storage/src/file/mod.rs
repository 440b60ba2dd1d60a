//! File abstraction handed to the LSM engine
//!
//! Writers, random readers and sequential readers bound to one file on a
//! [`Disk`]. [`SmrFs`] resolves the engine's conventional file names into
//! those objects; the engine never deals with zones or segments.

mod direct;
mod random_access;
mod sequential;
mod writable;

pub use direct::SmrDirectWritableFile;
pub use random_access::SmrRandomAccessFile;
pub use sequential::SmrSequentialFile;
pub use writable::SmrWritableFile;

use crate::disk::Disk;
use crate::file_info::FileKey;
use smrdb_common::{Error, FileType, Result};
use std::sync::Arc;

/// Name of the pointer to the live manifest
pub const CURRENT_FILE: &str = "CURRENT";

/// Writer chosen by file kind
pub enum WritableFile {
    Buffered(SmrWritableFile),
    /// Value files bypass staging
    Direct(SmrDirectWritableFile),
}

impl WritableFile {
    pub fn append(&self, data: &[u8]) -> Result<()> {
        match self {
            Self::Buffered(f) => f.append(data),
            Self::Direct(f) => f.append(data).map(|_| ()),
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self {
            Self::Buffered(f) => f.sync(),
            Self::Direct(f) => f.sync(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Self::Buffered(f) => f.close(),
            Self::Direct(f) => f.close(),
        }
    }

    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Buffered(f) => f.size(),
            Self::Direct(f) => f.size(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> FileKey {
        match self {
            Self::Buffered(f) => f.key(),
            Self::Direct(f) => f.key(),
        }
    }
}

/// Name-based front end over one disk
#[derive(Clone)]
pub struct SmrFs {
    disk: Arc<Disk>,
}

impl SmrFs {
    #[must_use]
    pub const fn new(disk: Arc<Disk>) -> Self {
        Self { disk }
    }

    #[must_use]
    pub const fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    /// Create (or truncate) `name` and open a writer on it
    pub fn new_writable_file(&self, name: &str, level: usize) -> Result<WritableFile> {
        let (number, kind) = parse(name)?;
        let key = self.disk.allocate_file(number, kind, level)?;
        if kind.is_value() {
            Ok(WritableFile::Direct(SmrDirectWritableFile::new(
                Arc::clone(&self.disk),
                key,
            )?))
        } else {
            Ok(WritableFile::Buffered(SmrWritableFile::new(
                Arc::clone(&self.disk),
                key,
            )?))
        }
    }

    pub fn new_random_access_file(&self, name: &str) -> Result<SmrRandomAccessFile> {
        let (number, kind) = parse(name)?;
        SmrRandomAccessFile::open(Arc::clone(&self.disk), FileKey::new(number, kind))
    }

    pub fn new_sequential_file(&self, name: &str) -> Result<SmrSequentialFile> {
        if name == CURRENT_FILE {
            return SmrSequentialFile::current(Arc::clone(&self.disk));
        }
        let (number, kind) = parse(name)?;
        SmrSequentialFile::open(Arc::clone(&self.disk), FileKey::new(number, kind))
    }

    /// Point CURRENT at a manifest and persist it
    pub fn write_current(&self, contents: &str) -> Result<()> {
        self.disk.put_current(contents);
        self.disk.persist_metadata()
    }

    pub fn delete_file(&self, name: &str) -> Result<()> {
        let (number, kind) = parse(name)?;
        self.disk.deallocate_file(number, kind)
    }

    #[must_use]
    pub fn file_exists(&self, name: &str) -> bool {
        if name == CURRENT_FILE {
            return !self.disk.get_current().is_empty();
        }
        FileType::parse_file_name(name)
            .is_some_and(|(number, kind)| self.disk.contains_file(FileKey::new(number, kind)))
    }

    pub fn get_file_size(&self, name: &str) -> Result<u64> {
        if name == CURRENT_FILE {
            return Ok(self.disk.get_current().len() as u64);
        }
        let (number, kind) = parse(name)?;
        self.disk.file_size(FileKey::new(number, kind))
    }

    /// Names of every file on the disk
    #[must_use]
    pub fn children(&self) -> Vec<String> {
        let mut names: Vec<String> = self.disk.file_keys().iter().map(FileKey::name).collect();
        if !self.disk.get_current().is_empty() {
            names.push(CURRENT_FILE.to_string());
        }
        names
    }
}

fn parse(name: &str) -> Result<(u64, FileType)> {
    FileType::parse_file_name(name)
        .ok_or_else(|| Error::invalid_argument(format!("unrecognized file name {name:?}")))
}
