//! The key-value engine as seen from the value subsystem
//!
//! Moving a value out of a fragmented value file must not clobber a newer
//! write to the same key, so the engine offers a conditional put: it shows
//! the key's live value to an [`ExternalComparator`], which only hands back a
//! replacement when the key still points at the location being moved.

use crate::file::SmrRandomAccessFile;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smrdb_common::Result;
use std::collections::BTreeMap;

/// Location of a value stored out of line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalLocator {
    /// Value file number
    pub file: u64,
    pub offset: u64,
    pub size: u32,
}

/// What the engine holds for a key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredValue {
    Internal(Vec<u8>),
    External(ExternalLocator),
}

/// Result of a conditional put
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// The key no longer references the moved location
    NotAttempted,
}

/// Decides whether a moved value may replace the live one
pub struct ExternalComparator<'a> {
    expected: ExternalLocator,
    reader: &'a SmrRandomAccessFile,
}

impl<'a> ExternalComparator<'a> {
    #[must_use]
    pub const fn new(expected: ExternalLocator, reader: &'a SmrRandomAccessFile) -> Self {
        Self { expected, reader }
    }

    #[must_use]
    pub const fn expected(&self) -> ExternalLocator {
        self.expected
    }

    /// Payload to store in place of `current`, or `None` to skip the put
    ///
    /// A read failure is returned to the caller and aborts the move.
    pub fn compare(&mut self, current: Option<&StoredValue>) -> Result<Option<Vec<u8>>> {
        match current {
            Some(StoredValue::External(locator)) if *locator == self.expected => self
                .reader
                .read_vec(self.expected.offset, self.expected.size as usize)
                .map(Some),
            _ => Ok(None),
        }
    }
}

/// Write path of the engine that owns the keys
pub trait ValueStore: Send + Sync {
    /// Look up `key`, let `cmp` decide, and store its payload inline if any
    fn conditional_put(&self, key: &[u8], cmp: &mut ExternalComparator<'_>) -> Result<PutOutcome>;
}

/// In-memory engine for tests and tooling
#[derive(Default)]
pub struct MemValueStore {
    entries: RwLock<BTreeMap<Vec<u8>, StoredValue>>,
}

impl MemValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<Vec<u8>>, value: StoredValue) {
        self.entries.write().insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<StoredValue> {
        self.entries.read().get(key).cloned()
    }

    pub fn delete(&self, key: &[u8]) -> Option<StoredValue> {
        self.entries.write().remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ValueStore for MemValueStore {
    fn conditional_put(&self, key: &[u8], cmp: &mut ExternalComparator<'_>) -> Result<PutOutcome> {
        let mut entries = self.entries.write();
        match cmp.compare(entries.get(key))? {
            Some(payload) => {
                entries.insert(key.to_vec(), StoredValue::Internal(payload));
                Ok(PutOutcome::Written)
            }
            None => Ok(PutOutcome::NotAttempted),
        }
    }
}
