//! smrdb Storage - Zoned storage core
//!
//! This crate maps the files of an LSM key-value engine onto the zones of a
//! host-managed SMR drive:
//! - Zone allocation with a persistent usage bitmap
//! - Files as ordered lists of segments, each inside one zone
//! - Three redundant superblocks holding all disk metadata
//! - Append-only writers and positional/sequential readers
//! - Zone and value file defragmentation
//! - Background range-sync workers

pub mod allocator;
pub mod device;
pub mod disk;
pub mod file;
pub mod file_info;
pub mod file_map;
pub mod layout;
pub mod level;
pub mod raw_io;
pub mod superblock;
pub mod sync_worker;
pub mod value;
pub mod zone;

// Re-exports
pub use allocator::ZoneAllocator;
pub use device::{EmulatedZoneDevice, ZoneDevice};
pub use disk::{Disk, DiskInfo, DiskStats, IoCounters, SegmentTail, render_usage_report};
pub use file::{
    CURRENT_FILE, SmrDirectWritableFile, SmrFs, SmrRandomAccessFile, SmrSequentialFile,
    SmrWritableFile, WritableFile,
};
pub use file_info::{FileInfo, FileKey, FileValueInfo};
pub use file_map::{FileMap, FileSummary};
pub use layout::{Geometry, KIB, MIB, GIB};
pub use level::{Level, ZoneHistogram};
pub use raw_io::{AlignedBuffer, RawFile, SyncFlags};
pub use superblock::{DiskImage, SlotState, Superblock, ZonePointer};
pub use sync_worker::{SyncQueue, SyncWorkers};
pub use value::{
    ExternalComparator, ExternalLocator, MemValueStore, MoveStats, PutOutcome, StoredValue,
    ValueBuilder, ValueDeleter, ValueMover, ValueStore,
};
pub use zone::{Segment, SegmentArena, SegmentId, Zone, ZoneBitmap};
