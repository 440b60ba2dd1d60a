//! Zoned disk
//!
//! A `Disk` owns everything shared by the files living on one device: the
//! zone allocator, the levels, the segment arena, both file maps, the three
//! superblock slots and the background sync workers. All of it sits behind
//! one mutex; file objects only hold an `Arc<Disk>` and a `FileKey`.

use crate::device::{EmulatedZoneDevice, ZoneDevice};
use crate::file_info::{FileInfo, FileKey, FileValueInfo};
use crate::file_map::{FileMap, FileSummary};
use crate::layout::{
    Geometry, LOG_LEVEL, NUM_LEVELS, NUMBER_SUPERBLOCKS, SEQUENTIAL_CHUNK, VALUE_LEVEL, align_up,
    level_for,
};
use crate::level::{Level, PlacementCounts, ZoneHistogram};
use crate::raw_io::{AlignedBuffer, RawFile, RetryPolicy, SyncFlags};
use crate::superblock::{DiskImage, FileRecord, SegmentRecord, SlotState, Superblock, ZonePointer};
use crate::sync_worker::{SyncQueue, SyncRequest, SyncWorkers};
use crate::value::{MoveStats, ValueMover, ValueStore};
use crate::zone::{Segment, SegmentArena, SegmentId, Zone};
use crate::allocator::ZoneAllocator;
use parking_lot::Mutex;
use serde::Serialize;
use smrdb_common::{
    Capacity, DiskConfig, DiskStatus, Error, FileType, Result, ZoneCondition,
    ZoneConditionSnapshot,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Superblock copies kept current by every sync
const GOOD_COPIES: usize = 2;

/// I/O statistics for a disk
#[derive(Debug, Default)]
pub struct DiskStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Point-in-time copy of [`DiskStats`]
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct IoCounters {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

impl DiskStats {
    #[must_use]
    pub fn snapshot(&self) -> IoCounters {
        IoCounters {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Last segment of a file as seen by a writer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentTail {
    pub segment: SegmentId,
    /// Position in the file's segment list
    pub index: usize,
    pub addr: u64,
    pub size: u64,
    /// End of the zone holding the segment
    pub zone_end: u64,
    pub complete: bool,
}

impl SegmentTail {
    /// Device address one past the last written byte
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }

    /// Bytes that can still be appended after rounding the end up to a page
    #[must_use]
    pub const fn space_left(&self, page_size: u64) -> u64 {
        self.zone_end.saturating_sub(align_up(self.end(), page_size))
    }
}

/// Status of one superblock slot for reports
#[derive(Debug, Serialize)]
pub struct SuperblockReport {
    pub index: usize,
    pub addr: u64,
    pub state: String,
    pub sequence: u64,
    pub active: bool,
}

/// Per-level line of a disk report
#[derive(Debug, Serialize)]
pub struct LevelReport {
    pub level: usize,
    pub zones: usize,
    pub fragmented: bool,
    pub placement: PlacementCounts,
}

/// Everything `info` reports about a disk
#[derive(Debug, Serialize)]
pub struct DiskInfo {
    pub path: String,
    pub disk_uuid: Uuid,
    pub zone_size: u64,
    pub num_zones: u32,
    pub used_zones: u32,
    pub free_zones: u32,
    pub capacity: Capacity,
    pub status: DiskStatus,
    pub sequence: u64,
    pub current: String,
    pub superblocks: Vec<SuperblockReport>,
    pub levels: Vec<LevelReport>,
    pub files: Vec<FileSummary>,
    pub value_files: Vec<FileSummary>,
    pub io: IoCounters,
}

struct DiskState {
    alloc: ZoneAllocator,
    levels: Vec<Level>,
    segments: SegmentArena,
    files: FileMap,
    value_files: FileMap,
    current: String,
    superblocks: Vec<Superblock>,
    /// Slots written by the last successful persist, at most two
    active: Vec<usize>,
    disk_uuid: Uuid,
    sequence: u64,
    usable: bool,
    dirty: bool,
}

impl DiskState {
    fn new(geometry: Geometry, device: Arc<dyn ZoneDevice>) -> Self {
        Self {
            alloc: ZoneAllocator::new(geometry, device),
            levels: (0..NUM_LEVELS).map(Level::new).collect(),
            segments: SegmentArena::new(),
            files: FileMap::new(),
            value_files: FileMap::new(),
            current: String::new(),
            superblocks: (0..NUMBER_SUPERBLOCKS)
                .map(|i| Superblock::new(i, &geometry))
                .collect(),
            active: Vec::new(),
            disk_uuid: Uuid::nil(),
            sequence: 0,
            usable: false,
            dirty: false,
        }
    }

    fn geometry(&self) -> Geometry {
        *self.alloc.geometry()
    }

    const fn map(&self, kind: FileType) -> &FileMap {
        if kind.is_value() { &self.value_files } else { &self.files }
    }

    const fn map_mut(&mut self, kind: FileType) -> &mut FileMap {
        if kind.is_value() {
            &mut self.value_files
        } else {
            &mut self.files
        }
    }

    fn file(&self, key: FileKey) -> Result<&FileInfo> {
        self.map(key.kind)
            .get(key.number)
            .ok_or_else(|| Error::NotFound(key.name()))
    }

    fn file_mut(&mut self, key: FileKey) -> Result<&mut FileInfo> {
        self.map_mut(key.kind)
            .get_mut(key.number)
            .ok_or_else(|| Error::NotFound(key.name()))
    }

    /// Forget every file and zone, keeping the superblock slots
    fn reset(&mut self) {
        self.levels.iter_mut().for_each(Level::clear);
        self.segments.clear();
        self.files.clear();
        self.value_files.clear();
        self.alloc.reset();
        self.current.clear();
        self.disk_uuid = Uuid::new_v4();
    }

    fn tail(&self, key: FileKey) -> Result<SegmentTail> {
        let info = self.file(key)?;
        let index = info
            .segments()
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::internal(format!("{key} has no segments")))?;
        let segment = info.segments()[index];
        let seg = self
            .segments
            .get(segment)
            .ok_or_else(|| Error::internal(format!("{key}: dangling segment {segment:?}")))?;
        Ok(SegmentTail {
            segment,
            index,
            addr: seg.addr,
            size: seg.size,
            zone_end: self.alloc.geometry().zone_end(seg.zone),
            complete: seg.complete,
        })
    }

    /// Used bytes count sequential zones owned by any level but the log level
    fn capacity(&self) -> Capacity {
        let geometry = self.alloc.geometry();
        let zones: usize = self
            .levels
            .iter()
            .filter(|l| l.number() != LOG_LEVEL)
            .map(|l| l.zones().filter(|z| !geometry.is_conventional(z.number())).count())
            .sum();
        Capacity {
            total: geometry.usable_capacity(),
            used: zones as u64 * geometry.zone_size,
        }
    }

    fn refresh_status(&mut self) {
        let free = self.capacity().free();
        if free < self.alloc.geometry().no_space_threshold && self.alloc.status() == DiskStatus::Normal {
            warn!("free capacity down to {free} bytes, refusing new data");
            self.alloc.set_status(DiskStatus::NoSpace);
        }
    }

    fn record(&self, info: &FileInfo) -> FileRecord {
        FileRecord {
            number: info.number(),
            kind: info.kind(),
            level: info.level(),
            segments: info
                .segments()
                .iter()
                .filter_map(|id| self.segments.get(*id))
                .map(|s| SegmentRecord {
                    addr: s.addr,
                    size: s.size,
                })
                .collect(),
            value_total: info.value_info().total,
            value_deleted: info.value_info().deleted,
        }
    }

    fn capture(&self) -> DiskImage {
        let geometry = self.alloc.geometry();
        DiskImage {
            disk_uuid: self.disk_uuid,
            zone_size: geometry.zone_size,
            num_zones: geometry.num_zones,
            cur_log_zone: self.alloc.cur_log_zone(),
            bitmap: self.alloc.bitmap().to_bytes(),
            current: self.current.clone(),
            files: self.files.iter().map(|f| self.record(f)).collect(),
            value_files: self.value_files.iter().map(|f| self.record(f)).collect(),
            write_pointers: self
                .levels
                .iter()
                .flat_map(Level::zones)
                .filter(|z| z.write_pointer() > z.start())
                .map(|z| ZonePointer {
                    zone: z.number(),
                    write_pointer: z.write_pointer(),
                })
                .collect(),
        }
    }

    /// Rebuild the in-memory model from a persisted image
    fn restore(&mut self, image: DiskImage) -> Result<()> {
        let geometry = self.geometry();
        if image.zone_size != geometry.zone_size || image.num_zones != geometry.num_zones {
            return Err(Error::Configuration(format!(
                "disk was formatted with {} zones of {} bytes, configured for {} of {}",
                image.num_zones, image.zone_size, geometry.num_zones, geometry.zone_size
            )));
        }
        self.levels.iter_mut().for_each(Level::clear);
        self.segments.clear();
        self.files.clear();
        self.value_files.clear();
        self.alloc.load(&image.bitmap, image.cur_log_zone);
        self.disk_uuid = image.disk_uuid;
        self.current = image.current;

        for record in image.files.into_iter().chain(image.value_files) {
            let info = self.restore_file(record)?;
            self.map_mut(info.kind()).insert(info);
        }

        // dead segments at the end of a zone still hold the device write
        // pointer; the zone stays append-only above it until reset
        for pointer in image.write_pointers {
            if let Some(zone) = self
                .levels
                .iter_mut()
                .find_map(|l| l.zone_mut(pointer.zone))
            {
                zone.advance_write_pointer(pointer.write_pointer);
            }
        }

        let page = geometry.page_size;
        for level in &mut self.levels {
            let value_level = level.number() == VALUE_LEVEL;
            level.rebuild_writable(page, value_level);
        }

        let orphans: Vec<u32> = (0..geometry.num_zones)
            .filter(|z| {
                self.alloc.bitmap().is_used(*z)
                    && !geometry.is_reserved(*z)
                    && !self.levels.iter().any(|l| l.owns_zone(*z))
            })
            .collect();
        for zone in orphans {
            info!("zone {zone} holds no segments, returning it to the free pool");
            self.alloc.free_zone(zone);
        }
        Ok(())
    }

    fn restore_file(&mut self, record: FileRecord) -> Result<FileInfo> {
        let geometry = self.geometry();
        let key = FileKey::new(record.number, record.kind);
        if record.level >= NUM_LEVELS {
            return Err(Error::corruption(format!("{key} recorded at level {}", record.level)));
        }
        let mut info = FileInfo::new(key, record.level);
        info.value_info_mut().incr_total(record.value_total);
        info.value_info_mut().incr_deleted(record.value_deleted);

        let level = &mut self.levels[record.level];
        for seg in record.segments {
            let zone_number = geometry.zone_of(seg.addr);
            if zone_number >= geometry.num_zones || seg.addr + seg.size > geometry.zone_end(zone_number) {
                return Err(Error::corruption(format!(
                    "segment {:#x}+{} of {key} lies outside its zone",
                    seg.addr, seg.size
                )));
            }
            if level.zone(zone_number).is_none() {
                level.restore_zone(Zone::new(zone_number, geometry.zone_size));
            }
            if !self.alloc.bitmap().is_used(zone_number) {
                warn!("zone {zone_number} of {key} was not marked used");
                self.alloc.mark_used(zone_number);
            }
            let id = self.segments.insert(Segment {
                addr: seg.addr,
                size: seg.size,
                zone: zone_number,
                level: record.level,
                owner: key,
                complete: true,
            });
            if let Some(zone) = level.zone_mut(zone_number) {
                zone.attach(seg.addr, id);
                zone.grow(seg.addr, 0, seg.size, geometry.page_size);
            }
            info.push_segment(id);
        }
        Ok(info)
    }
}

/// Storage is settled once the last segment is sealed and its zone takes no
/// more segments
fn is_settled(levels: &[Level], segments: &SegmentArena, info: &FileInfo) -> bool {
    info.is_defragmentable(segments, &levels[info.level()])
}

/// Destination of a segment move
#[derive(Clone, Copy)]
struct MoveTarget {
    id: SegmentId,
    addr: u64,
    size: u64,
    zone_end: u64,
}

impl MoveTarget {
    const fn room(&self) -> u64 {
        self.zone_end.saturating_sub(self.addr + self.size)
    }
}

/// One zoned device and the files stored on it
pub struct Disk {
    config: DiskConfig,
    geometry: Geometry,
    file: Arc<RawFile>,
    device: Arc<dyn ZoneDevice>,
    policy: RetryPolicy,
    state: Mutex<DiskState>,
    defrag_lock: Mutex<()>,
    workers: SyncWorkers,
    stats: DiskStats,
}

impl Disk {
    /// Open the device named by `config`, creating an image file if allowed
    pub fn open(config: DiskConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let file = if config.path.exists() {
            RawFile::open(&config.path, config.direct_io)?
        } else if config.create_if_missing {
            let Some(num_zones) = config.num_zones else {
                return Err(Error::Configuration(format!(
                    "{} does not exist and num_zones is not set",
                    config.path.display()
                )));
            };
            info!("creating image {} with {num_zones} zones", config.path.display());
            RawFile::create(&config.path, u64::from(num_zones) * config.zone_size, config.direct_io)?
        } else {
            return Err(Error::NotFound(config.path.display().to_string()));
        };
        let geometry = Geometry::from_config(&config, file.size())?;
        let device: Arc<dyn ZoneDevice> = Arc::new(EmulatedZoneDevice::new(geometry));
        Self::with_device(config, file, device)
    }

    /// Open with an explicit zone-management device
    pub fn with_device(config: DiskConfig, file: RawFile, device: Arc<dyn ZoneDevice>) -> Result<Arc<Self>> {
        let geometry = Geometry::from_config(&config, file.size())?;
        let policy = RetryPolicy {
            attempts: config.io_retries,
            backoff: config.retry_backoff(),
        };
        let disk = Self {
            state: Mutex::new(DiskState::new(geometry, Arc::clone(&device))),
            config,
            geometry,
            file: Arc::new(file),
            device,
            policy,
            defrag_lock: Mutex::new(()),
            workers: SyncWorkers::start()?,
            stats: DiskStats::default(),
        };
        disk.load()?;
        Ok(Arc::new(disk))
    }

    /// Reconcile the three superblocks and adopt the newest good image
    fn load(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let mut newest: Option<(usize, u64, DiskImage)> = None;
        for sb in &mut st.superblocks {
            match sb.load(&self.file, self.policy) {
                Ok(Some(image)) => {
                    if newest.as_ref().is_none_or(|(_, seq, _)| sb.sequence() > *seq) {
                        newest = Some((sb.index(), sb.sequence(), image));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("superblock {} unreadable: {e}", sb.index()),
            }
        }

        let Some((canonical, sequence, image)) = newest else {
            if st.superblocks.iter().all(Superblock::is_blank) {
                if self.config.create_if_missing {
                    info!("{} is not formatted, formatting", self.file.path());
                    return self.format_locked(st);
                }
                return Err(Error::corruption(format!(
                    "{} is not formatted and create_if_missing is off",
                    self.file.path()
                )));
            }
            error!("{}: no good superblock", self.file.path());
            return Err(Error::corruption("there is no good superblock"));
        };

        let bytes = image.to_bytes()?;
        st.restore(image)?;
        st.sequence = sequence;
        st.active = vec![canonical];
        for idx in (0..NUMBER_SUPERBLOCKS).filter(|i| *i != canonical) {
            match st.superblocks[idx].persist(&self.file, &bytes, sequence, self.policy) {
                Ok(()) => {
                    if st.active.len() < GOOD_COPIES {
                        st.active.push(idx);
                    }
                }
                Err(e) => warn!("superblock {idx} could not be healed: {e}"),
            }
        }
        if st.active.len() < GOOD_COPIES {
            warn!("{}: running with a single good superblock", self.file.path());
        }

        let free = st.capacity().free();
        let status = if free < self.geometry.no_space_threshold {
            DiskStatus::NoSpace
        } else {
            DiskStatus::Normal
        };
        st.alloc.set_status(status);
        st.usable = true;
        info!(
            "loaded {} (sequence {sequence}, canonical superblock {canonical}, {} files, {} value files, {status:?})",
            self.file.path(),
            st.files.len(),
            st.value_files.len()
        );
        Ok(())
    }

    /// Reset the model and write a fresh image to every slot
    fn format_locked(&self, st: &mut DiskState) -> Result<()> {
        st.reset();
        let sequence = st
            .superblocks
            .iter()
            .map(Superblock::sequence)
            .max()
            .unwrap_or(0)
            .max(st.sequence)
            + 1;
        let bytes = st.capture().to_bytes()?;
        let mut written = Vec::with_capacity(NUMBER_SUPERBLOCKS);
        for sb in &mut st.superblocks {
            match sb.persist(&self.file, &bytes, sequence, self.policy) {
                Ok(()) => written.push(sb.index()),
                Err(e) => warn!("format: superblock {} failed: {e}", sb.index()),
            }
        }
        if written.is_empty() {
            st.usable = false;
            return Err(Error::corruption("no superblock could be written"));
        }
        written.truncate(GOOD_COPIES);
        st.active = written;
        st.sequence = sequence;
        st.usable = true;
        st.dirty = false;
        info!("formatted {} as {}", self.file.path(), st.disk_uuid);
        Ok(())
    }

    /// Drop every file and start over as a freshly formatted disk
    pub fn clear(&self) -> Result<()> {
        let _defrag = self.defrag_lock.lock();
        let mut guard = self.state.lock();
        warn!("clearing {}", self.file.path());
        guard.usable = true;
        self.format_locked(&mut guard)
    }

    /// Flush file data and persist a metadata snapshot
    ///
    /// `SuperblockIo` means only one copy could be written; `Corruption`
    /// means none could and the disk is no longer usable.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        let mut guard = self.state.lock();
        self.persist_locked(&mut guard)
    }

    /// Like [`Disk::sync`], tolerating a single good superblock
    pub fn persist_metadata(&self) -> Result<()> {
        match self.sync() {
            Err(Error::SuperblockIo(msg)) => {
                warn!("metadata persisted degraded: {msg}");
                Ok(())
            }
            other => other,
        }
    }

    fn persist_locked(&self, st: &mut DiskState) -> Result<()> {
        if !st.usable {
            return Err(Error::corruption("disk is unusable: no good superblock"));
        }
        let bytes = st.capture().to_bytes()?;
        let sequence = st.sequence + 1;
        let candidates: Vec<usize> = st
            .active
            .iter()
            .copied()
            .chain((0..NUMBER_SUPERBLOCKS).filter(|i| !st.active.contains(i)))
            .collect();

        let mut written = Vec::with_capacity(GOOD_COPIES);
        for idx in candidates {
            if written.len() == GOOD_COPIES {
                break;
            }
            match st.superblocks[idx].persist(&self.file, &bytes, sequence, self.policy) {
                Ok(()) => written.push(idx),
                Err(e) if e.is_no_space() => return Err(e),
                Err(e) => warn!("superblock {idx} persist failed: {e}"),
            }
        }
        if !written.is_empty() {
            st.sequence = sequence;
            st.dirty = false;
        }
        st.active = written;
        match st.active.len() {
            0 => {
                st.usable = false;
                error!("{}: every superblock write failed", self.file.path());
                Err(Error::corruption("there is no good superblock"))
            }
            1 => Err(Error::SuperblockIo(format!(
                "only superblock {} is good",
                st.active[0]
            ))),
            _ => {
                debug!("persisted sequence {sequence} to superblocks {:?}", st.active);
                Ok(())
            }
        }
    }

    /// Create a file with one empty segment, replacing any file with the same
    /// number and kind
    pub fn allocate_file(&self, number: u64, kind: FileType, level: usize) -> Result<FileKey> {
        let level = level_for(kind, level);
        if level >= NUM_LEVELS {
            return Err(Error::invalid_argument(format!("level {level} out of range")));
        }
        let key = FileKey::new(number, kind);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(old) = st.map_mut(kind).remove(number) {
            warn!("{key} already exists, replacing it");
            st.levels[old.level()].deallocate_file(&old, &mut st.alloc, &mut st.segments);
        }
        let info = st.levels[level].allocate_file(key, &mut st.alloc, &mut st.segments)?;
        st.map_mut(kind).insert(info);
        st.dirty = true;
        st.refresh_status();
        debug!("allocated {key} at level {level}");
        Ok(key)
    }

    /// Release a file's segments
    ///
    /// A value file being defragmented is only marked obsolete; the cleanup
    /// pass deletes it once the mover lets go.
    pub fn deallocate_file(&self, number: u64, kind: FileType) -> Result<()> {
        let key = FileKey::new(number, kind);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if kind.is_value() && st.value_files.blocked() == Some(number) {
            st.value_files.mark_obsolete(number);
            debug!("{key} is being defragmented, deferring deletion");
            return Ok(());
        }
        let info = st
            .map_mut(kind)
            .remove(number)
            .ok_or_else(|| Error::NotFound(key.name()))?;
        st.levels[info.level()].deallocate_file(&info, &mut st.alloc, &mut st.segments);
        st.dirty = true;
        debug!("deallocated {key}");
        Ok(())
    }

    #[must_use]
    pub fn contains_file(&self, key: FileKey) -> bool {
        self.state.lock().map(key.kind).contains(key.number)
    }

    /// Files of every kind, table-like files first
    #[must_use]
    pub fn file_keys(&self) -> Vec<FileKey> {
        let st = self.state.lock();
        st.files.iter().chain(st.value_files.iter()).map(FileInfo::key).collect()
    }

    /// Snapshot of a file's metadata
    pub fn file_info(&self, key: FileKey) -> Result<FileInfo> {
        self.state.lock().file(key).cloned()
    }

    pub fn file_size(&self, key: FileKey) -> Result<u64> {
        let st = self.state.lock();
        Ok(st.file(key)?.size(&st.segments))
    }

    pub fn segment_count(&self, key: FileKey) -> Result<usize> {
        Ok(self.state.lock().file(key)?.segments().len())
    }

    pub fn tail(&self, key: FileKey) -> Result<SegmentTail> {
        self.state.lock().tail(key)
    }

    /// Seal the last segment and append a fresh one
    ///
    /// An empty last segment is released instead of sealed.
    pub fn roll_segment(&self, key: FileKey) -> Result<SegmentTail> {
        let page = self.geometry.page_size;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let info = st.file(key)?;
        let (level, last) = (info.level(), info.last_segment());
        if let Some(last) = last {
            if st.segments.get(last).is_some_and(|s| s.size == 0) {
                st.file_mut(key)?.remove_segment(last);
                st.levels[level].deallocate_segment(last, &mut st.alloc, &mut st.segments);
            } else {
                st.levels[level].complete_segment(last, &mut st.segments, page);
            }
        }
        let id = st.levels[level].allocate_segment(key, &mut st.alloc, &mut st.segments)?;
        st.file_mut(key)?.push_segment(id);
        st.dirty = true;
        st.refresh_status();
        let tail = st.tail(key)?;
        debug!("{key}: rolled to segment {} at {:#x}", tail.index, tail.addr);
        Ok(tail)
    }

    /// Account bytes written into `segment`
    pub fn record_append(&self, key: FileKey, segment: SegmentId, new_size: u64) -> Result<()> {
        let page = self.geometry.page_size;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let info = st.file(key)?;
        if info.index_of(segment).is_none() {
            return Err(Error::internal(format!("{key} does not own segment {segment:?}")));
        }
        let level = info.level();
        st.levels[level].record_write(segment, new_size, &mut st.segments, page);
        st.dirty = true;
        Ok(())
    }

    /// Seal the last segment of a closed file
    pub fn complete_last_segment(&self, key: FileKey) -> Result<()> {
        let page = self.geometry.page_size;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let info = st.file(key)?;
        let (level, last) = (info.level(), info.last_segment());
        if let Some(last) = last {
            st.levels[level].complete_segment(last, &mut st.segments, page);
            st.dirty = true;
        }
        Ok(())
    }

    /// (address, size) of every segment from position `index` on
    pub fn segments_from(&self, key: FileKey, index: usize) -> Result<Vec<(u64, u64)>> {
        let st = self.state.lock();
        let info = st.file(key)?;
        Ok(info
            .segments()
            .iter()
            .skip(index)
            .filter_map(|id| st.segments.get(*id))
            .map(|s| (s.addr, s.size))
            .collect())
    }

    /// Device address of logical `offset` and the bytes left in its segment
    pub fn locate(&self, key: FileKey, offset: u64) -> Result<(u64, u64)> {
        let st = self.state.lock();
        let info = st.file(key)?;
        let addr = info
            .address_of(offset, &st.segments)
            .ok_or_else(|| Error::internal(format!("{key} has no segments")))?;
        Ok((addr, info.size_to_segment_end(offset, &st.segments)))
    }

    /// Count entries added to a value file
    pub fn add_value_entries(&self, number: u64, n: u16) -> Result<()> {
        let mut st = self.state.lock();
        let info = st
            .value_files
            .get_mut(number)
            .ok_or_else(|| Error::NotFound(FileType::Value.file_name(number)))?;
        info.value_info_mut().incr_total(n);
        st.dirty = true;
        Ok(())
    }

    /// Count entries of a value file that are no longer referenced
    pub fn mark_values_deleted(&self, number: u64, n: u16) -> Option<FileValueInfo> {
        let mut st = self.state.lock();
        let info = st.value_files.get_mut(number)?;
        info.value_info_mut().incr_deleted(n);
        let value_info = info.value_info();
        st.dirty = true;
        Some(value_info)
    }

    #[must_use]
    pub fn value_info(&self, number: u64) -> Option<FileValueInfo> {
        self.state.lock().value_files.get(number).map(FileInfo::value_info)
    }

    /// Whether a writer still appends to the value file
    #[must_use]
    pub fn value_file_in_writing(&self, number: u64) -> bool {
        let st = self.state.lock();
        st.value_files
            .get(number)
            .and_then(FileInfo::last_segment)
            .and_then(|id| st.segments.get(id))
            .is_some_and(|s| !s.complete)
    }

    /// Flag a value file as holding no live entries
    pub fn obsolete_value_file(&self, number: u64) -> bool {
        let marked = self.state.lock().value_files.mark_obsolete(number);
        if marked {
            debug!("{} is obsolete", FileType::Value.file_name(number));
        }
        marked
    }

    #[must_use]
    pub fn is_obsolete_value_file(&self, number: u64) -> bool {
        self.state.lock().value_files.is_obsolete(number)
    }

    /// Deallocate every obsolete value file that is not being defragmented
    pub fn delete_obsolete_value_files(&self) -> Vec<u64> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let blocked = st.value_files.blocked();
        let doomed: Vec<u64> = st.value_files.obsolete().filter(|n| Some(*n) != blocked).collect();
        for number in &doomed {
            if let Some(info) = st.value_files.remove(*number) {
                st.levels[info.level()].deallocate_file(&info, &mut st.alloc, &mut st.segments);
                st.dirty = true;
            }
        }
        if !doomed.is_empty() {
            info!("deleted {} obsolete value files", doomed.len());
        }
        doomed
    }

    /// Whether some settled value file has deleted entries worth moving
    #[must_use]
    pub fn has_fragmented_value_files(&self) -> bool {
        let st = self.state.lock();
        st.value_files
            .is_fragmented(|info| is_settled(&st.levels, &st.segments, info))
    }

    /// Replace the CURRENT pointer
    pub fn put_current(&self, contents: &str) {
        let mut st = self.state.lock();
        st.current = contents.to_string();
        st.dirty = true;
    }

    #[must_use]
    pub fn get_current(&self) -> String {
        self.state.lock().current.clone()
    }

    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.state.lock().capacity()
    }

    #[must_use]
    pub fn is_high_disk_usage(&self) -> bool {
        self.capacity().free() < self.geometry.high_usage_threshold()
    }

    #[must_use]
    pub fn status(&self) -> DiskStatus {
        self.state.lock().alloc.status()
    }

    pub fn set_status(&self, status: DiskStatus) {
        self.state.lock().alloc.set_status(status);
    }

    /// Number of slots written by the last persist
    #[must_use]
    pub fn good_superblocks(&self) -> usize {
        self.state.lock().active.len()
    }

    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.state.lock().usable
    }

    /// Compact the two most fragmented settled zones of `level`
    ///
    /// Every segment in a chosen zone is copied into fresh segments of the
    /// same level, swapped into its file and released, which frees the zone.
    pub fn defragment(&self, level: usize) -> Result<()> {
        if level >= NUM_LEVELS {
            return Err(Error::invalid_argument(format!("level {level} out of range")));
        }
        let _defrag = self.defrag_lock.lock();
        let zones = {
            let st = self.state.lock();
            match st.active.len() {
                0 => return Err(Error::corruption("there is no good superblock")),
                1 => return Err(Error::corruption("superblock is not writable")),
                _ => {}
            }
            st.levels[level].fragmented_zones()
        };
        if zones.len() < 2 {
            return Err(Error::not_attempted(format!(
                "level {level} has fewer than two fragmented zones"
            )));
        }

        for zone in zones {
            let mut moved = 0;
            while let Some(src) = self.first_segment_in(level, zone) {
                self.move_segment(level, src)?;
                moved += 1;
            }
            info!("level {level}: moved {moved} segments out of zone {zone}");
        }
        self.workers.flush(SyncQueue::Compaction)?;
        self.sync()
    }

    fn first_segment_in(&self, level: usize, zone: u32) -> Option<SegmentId> {
        self.state.lock().levels[level].zone(zone)?.segments().next()
    }

    fn move_segment(&self, level: usize, src: SegmentId) -> Result<()> {
        let page = self.geometry.page_size;
        let source = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(seg) = st.segments.get(src).cloned() else {
                return Ok(());
            };
            let owned = st
                .map(seg.owner.kind)
                .get(seg.owner.number)
                .is_some_and(|f| f.index_of(src).is_some());
            if !owned {
                warn!("segment {:#x} in zone {} has no owner, releasing it", seg.addr, seg.zone);
                st.levels[level].deallocate_segment(src, &mut st.alloc, &mut st.segments);
                return Ok(());
            }
            seg
        };

        let mut targets = Vec::new();
        let result = self.copy_segment(level, &source, &mut targets);

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if result.is_ok()
            && let Ok(info) = st.file_mut(source.owner)
            && info.replace_segment(src, &targets)
        {
            for id in &targets {
                st.levels[level].complete_segment(*id, &mut st.segments, page);
            }
            st.levels[level].deallocate_segment(src, &mut st.alloc, &mut st.segments);
            st.dirty = true;
            return Ok(());
        }
        if result.is_ok() {
            debug!("{} went away while its segment moved", source.owner);
        }
        for id in targets {
            st.levels[level].deallocate_segment(id, &mut st.alloc, &mut st.segments);
        }
        result
    }

    /// Copy `source` in 1 MiB chunks into new segments listed in `targets`
    fn copy_segment(&self, level: usize, source: &Segment, targets: &mut Vec<SegmentId>) -> Result<()> {
        let page = self.geometry.page_size;
        let mut buf = AlignedBuffer::new(SEQUENTIAL_CHUNK as usize);
        let mut target: Option<MoveTarget> = None;
        let mut copied = 0;
        while copied < source.size {
            let chunk = (source.size - copied).min(SEQUENTIAL_CHUNK);
            let padded = align_up(chunk, page);
            self.read_data(source.addr + copied, &mut buf.as_mut_slice()[..padded as usize])?;
            buf.as_mut_slice()[chunk as usize..padded as usize].fill(0);

            let mut written = 0;
            while written < chunk {
                let mut t = match target {
                    Some(t) if t.room() > 0 => t,
                    previous => {
                        let t = self.allocate_move_target(level, source.owner, previous.map(|p| p.id))?;
                        targets.push(t.id);
                        t
                    }
                };
                let n = (chunk - written).min(t.room());
                let n_padded = align_up(n, page);
                let at = t.addr + t.size;
                self.write_data(at, &buf.as_slice()[written as usize..(written + n_padded) as usize])?;
                t.size += n;
                {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    st.levels[level].record_write(t.id, t.size, &mut st.segments, page);
                }
                self.bg_sync(SyncQueue::Compaction, at, n_padded, SyncFlags::START)?;
                target = Some(t);
                written += n;
            }
            copied += chunk;
        }
        Ok(())
    }

    fn allocate_move_target(&self, level: usize, owner: FileKey, previous: Option<SegmentId>) -> Result<MoveTarget> {
        let page = self.geometry.page_size;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(previous) = previous {
            st.levels[level].complete_segment(previous, &mut st.segments, page);
        }
        let id = st.levels[level].allocate_segment(owner, &mut st.alloc, &mut st.segments)?;
        st.refresh_status();
        let seg = st
            .segments
            .get(id)
            .ok_or_else(|| Error::internal("new segment vanished"))?;
        Ok(MoveTarget {
            id,
            addr: seg.addr,
            size: 0,
            zone_end: self.geometry.zone_end(seg.zone),
        })
    }

    /// Move the live values out of the most fragmented value file
    ///
    /// On success the file is obsolete and the cleanup pass deletes it.
    pub fn defragment_external(self: &Arc<Self>, store: &dyn ValueStore) -> Result<MoveStats> {
        let picked = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.value_files
                .pick_for_defrag(|info| is_settled(&st.levels, &st.segments, info))
        };
        let Some(key) = picked else {
            return Err(Error::not_attempted("no suitable value file for defragmentation"));
        };
        info!("moving live values out of {key}");

        let result = ValueMover::new(Arc::clone(self), key.number).run(store);

        let mut st = self.state.lock();
        if result.is_ok() {
            st.value_files.mark_obsolete(key.number);
        }
        st.value_files.unblock(key.number);
        drop(st);
        match &result {
            Ok(stats) => info!("{key}: moved {} values, skipped {}", stats.moved, stats.skipped),
            Err(e) => warn!("{key}: value move failed: {e}"),
        }
        result
    }

    /// Human-readable zone condition snapshot and level-0 zone histogram
    pub fn zone_usage_report(&self) -> Result<String> {
        let histogram = {
            let st = self.state.lock();
            st.levels[0].zone_histogram(&st.segments, |key| {
                st.map(key.kind)
                    .get(key.number)
                    .map_or(0, |f| f.num_zones(&st.segments))
            })
        };
        let snapshot = self.device.condition_snapshot(&ZoneCondition::SNAPSHOT)?;
        Ok(render_usage_report(&snapshot, &histogram))
    }

    /// Full status for tooling
    #[must_use]
    pub fn info(&self) -> DiskInfo {
        let st = self.state.lock();
        DiskInfo {
            path: self.file.path().to_string(),
            disk_uuid: st.disk_uuid,
            zone_size: self.geometry.zone_size,
            num_zones: self.geometry.num_zones,
            used_zones: st.alloc.used_zones(),
            free_zones: st.alloc.free_zones(),
            capacity: st.capacity(),
            status: st.alloc.status(),
            sequence: st.sequence,
            current: st.current.clone(),
            superblocks: st
                .superblocks
                .iter()
                .map(|sb| SuperblockReport {
                    index: sb.index(),
                    addr: sb.addr(),
                    state: match sb.state() {
                        SlotState::Unloaded => "unloaded".into(),
                        SlotState::Blank => "blank".into(),
                        SlotState::Corrupt(reason) => format!("corrupt: {reason}"),
                        SlotState::Good => "good".into(),
                    },
                    sequence: sb.sequence(),
                    active: st.active.contains(&sb.index()),
                })
                .collect(),
            levels: st
                .levels
                .iter()
                .map(|l| LevelReport {
                    level: l.number(),
                    zones: l.zone_count(),
                    fragmented: l.is_fragmented(),
                    placement: l.placement_counts(&self.geometry),
                })
                .collect(),
            files: st.files.summary(),
            value_files: st.value_files.summary(),
            io: self.stats.snapshot(),
        }
    }

    /// Check that the bitmap, the levels and the file maps agree
    pub fn verify_zone_accounting(&self) -> Result<()> {
        let st = self.state.lock();
        let bitmap = st.alloc.bitmap();
        if bitmap.used() + bitmap.free() != self.geometry.num_zones {
            return Err(Error::corruption(format!(
                "{} used + {} free zones != {}",
                bitmap.used(),
                bitmap.free(),
                self.geometry.num_zones
            )));
        }

        let mut owners: BTreeMap<u32, usize> = BTreeMap::new();
        for level in &st.levels {
            for zone in level.zones() {
                if let Some(other) = owners.insert(zone.number(), level.number()) {
                    return Err(Error::corruption(format!(
                        "zone {} claimed by levels {other} and {}",
                        zone.number(),
                        level.number()
                    )));
                }
            }
        }
        for zone in 0..self.geometry.num_zones {
            let expected = self.geometry.is_reserved(zone) || owners.contains_key(&zone);
            if bitmap.is_used(zone) != expected {
                return Err(Error::corruption(format!(
                    "zone {zone}: bitmap says {}, levels say {}",
                    bitmap.is_used(zone),
                    expected
                )));
            }
        }

        let mut referenced = 0;
        for info in st.files.iter().chain(st.value_files.iter()) {
            for id in info.segments() {
                let seg = st
                    .segments
                    .get(*id)
                    .ok_or_else(|| Error::corruption(format!("{} references a freed segment", info.key())))?;
                if seg.owner != info.key() {
                    return Err(Error::corruption(format!(
                        "segment {:#x} listed by {} but owned by {}",
                        seg.addr,
                        info.key(),
                        seg.owner
                    )));
                }
                if !st.levels[seg.level].owns_zone(seg.zone) {
                    return Err(Error::corruption(format!(
                        "segment {:#x} of {} sits in zone {} not owned by level {}",
                        seg.addr,
                        info.key(),
                        seg.zone,
                        seg.level
                    )));
                }
            }
            referenced += info.segments().len();
        }
        if referenced != st.segments.len() {
            return Err(Error::corruption(format!(
                "{} live segments, {referenced} referenced by files",
                st.segments.len()
            )));
        }
        Ok(())
    }

    /// Corruption error carrying the device's zone-condition snapshot
    pub fn diagnose_corruption(&self, message: impl Into<String>) -> Error {
        let message = message.into();
        match self.device.condition_snapshot(&ZoneCondition::SNAPSHOT) {
            Ok(snapshot) => {
                error!("{message}\n{snapshot}");
                Error::DiagnosedCorruption { message, snapshot }
            }
            Err(e) => {
                error!("{message} (zone snapshot unavailable: {e})");
                Error::Corruption(message)
            }
        }
    }

    /// Flush a byte range, in the background unless `flags` waits for it
    pub fn bg_sync(&self, queue: SyncQueue, offset: u64, len: u64, flags: SyncFlags) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if flags.contains(SyncFlags::WAIT_AFTER) {
            return self.file.sync_range(offset, len, flags);
        }
        self.workers.submit(
            queue,
            SyncRequest {
                file: Arc::clone(&self.file),
                offset,
                len,
                flags,
            },
        )
    }

    /// Wait for everything queued on `queue`
    pub fn flush_background(&self, queue: SyncQueue) -> Result<()> {
        self.workers.flush(queue)
    }

    /// Write a page-aligned buffer at a device address
    pub fn write_data(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.device.check_write(addr, buf.len() as u64)?;
        let result = self.file.write_all_retry(addr, buf, self.policy);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(()) => {
                self.stats.bytes_written.fetch_add(buf.len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Fill `buf` from a device address
    pub fn read_data(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let result = self.file.read_exact_retry(addr, buf, self.policy);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(()) => {
                self.stats.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Sync the whole device
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.geometry.page_size
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ZoneDevice> {
        &self.device
    }

    #[must_use]
    pub const fn config(&self) -> &DiskConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &DiskStats {
        &self.stats
    }

    /// Stop the sync workers and persist unsaved metadata
    pub fn shutdown(&self) {
        self.workers.shutdown();
        let mut guard = self.state.lock();
        if !guard.usable || !guard.dirty {
            return;
        }
        let result = self
            .file
            .sync_data()
            .and_then(|()| self.persist_locked(&mut guard));
        if let Err(e) = result {
            warn!("{}: final metadata persist failed: {e}", self.file.path());
        }
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Format the zone usage report
#[must_use]
pub fn render_usage_report(snapshot: &ZoneConditionSnapshot, histogram: &ZoneHistogram) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "\n ---------------------------------\n  ZONE CONDITION SNAPSHOT\n ---------------------------------\n{snapshot}"
    );
    out.push_str(
        "\n ---------------------------------\n ------   ZONE SST HISTO   -------\n  WholeSST  ->    Partial SST\n ---------------------------------\n",
    );
    let (mut total_zones, mut paired, mut total_sst) = (0u64, 0u64, 0u64);
    for (whole, row) in histogram.iter().enumerate() {
        let _ = writeln!(out, "    {whole}   ->   [{},{},{}]", row[0], row[1], row[2]);
        let zones: u64 = row.iter().map(|n| u64::from(*n)).sum();
        total_zones += zones;
        paired += u64::from(row[1]);
        total_sst += whole as u64 * zones + u64::from(row[2]);
    }
    // a zone with one partial file shares that file with another such zone
    total_sst += paired / 2;
    let _ = write!(
        out,
        " ---------------------------------\n -Effective SSTs: {total_sst}\n -Total Zones: {total_zones}\n ---------------------------------\n"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{KIB, MIB};
    use crate::level::{HISTOGRAM_COLS, HISTOGRAM_ROWS};
    use std::path::Path;
    use std::time::Duration;

    fn config(dir: &Path) -> DiskConfig {
        DiskConfig::new(dir.join("disk.img"))
            .with_zone_size(MIB)
            .with_num_zones(96)
            .with_retry_backoff(Duration::ZERO)
    }

    /// Append page-multiple `data` to the last segment of `key`
    fn append(disk: &Disk, key: FileKey, data: &[u8]) {
        let tail = disk.tail(key).unwrap();
        disk.write_data(tail.end(), data).unwrap();
        disk.record_append(key, tail.segment, tail.size + data.len() as u64)
            .unwrap();
    }

    fn read_file(disk: &Disk, key: FileKey) -> Vec<u8> {
        let mut out = Vec::new();
        for (addr, size) in disk.segments_from(key, 0).unwrap() {
            let mut buf = vec![0u8; size as usize];
            disk.read_data(addr, &mut buf).unwrap();
            out.extend_from_slice(&buf);
        }
        out
    }

    fn corrupt_slot(cfg: &DiskConfig, index: usize, offset: u64, bytes: &[u8]) {
        let file = RawFile::open(&cfg.path, false).unwrap();
        let geometry = Geometry::from_config(cfg, file.size()).unwrap();
        file.write_at(geometry.superblock_addr(index) + offset, bytes).unwrap();
    }

    #[test]
    fn test_format_fresh_disk() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        assert!(disk.is_usable());
        assert_eq!(disk.good_superblocks(), 2);
        assert_eq!(disk.capacity().used, 0);
        assert_eq!(disk.capacity().total, 28 * MIB);
        assert!(disk.get_current().is_empty());
        disk.verify_zone_accounting().unwrap();
        let info = disk.info();
        assert!(info.superblocks.iter().all(|s| s.state == "good"));
        assert_eq!(info.used_zones, 11);
    }

    #[test]
    fn test_reopen_restores_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let table = FileKey::new(7, FileType::Table);
        {
            let disk = Disk::open(cfg.clone()).unwrap();
            disk.allocate_file(7, FileType::Table, 2).unwrap();
            append(&disk, table, &[0x5a; 8192]);
            disk.complete_last_segment(table).unwrap();
            disk.allocate_file(9, FileType::Value, 0).unwrap();
            disk.add_value_entries(9, 3).unwrap();
            disk.mark_values_deleted(9, 1).unwrap();
            disk.put_current("MANIFEST-000002\n");
            disk.sync().unwrap();
        }
        let disk = Disk::open(cfg).unwrap();
        assert_eq!(disk.file_size(table).unwrap(), 8192);
        assert_eq!(disk.file_info(table).unwrap().level(), 2);
        assert_eq!(read_file(&disk, table), vec![0x5a; 8192]);
        let value = disk.value_info(9).unwrap();
        assert_eq!((value.total, value.deleted), (3, 1));
        assert_eq!(disk.get_current(), "MANIFEST-000002\n");
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_drop_persists_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let disk = Disk::open(cfg.clone()).unwrap();
            disk.allocate_file(3, FileType::Table, 0).unwrap();
            disk.put_current("MANIFEST-000001\n");
        }
        let disk = Disk::open(cfg).unwrap();
        assert!(disk.contains_file(FileKey::new(3, FileType::Table)));
        assert_eq!(disk.get_current(), "MANIFEST-000001\n");
    }

    #[test]
    fn test_newest_superblock_wins_and_heals_others() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        drop(Disk::open(cfg.clone()).unwrap());

        let file = RawFile::open(&cfg.path, false).unwrap();
        let geometry = Geometry::from_config(&cfg, file.size()).unwrap();
        let policy = RetryPolicy {
            attempts: 1,
            backoff: Duration::ZERO,
        };
        let mut slots: Vec<Superblock> = (0..3).map(|i| Superblock::new(i, &geometry)).collect();
        let base = slots[0].load(&file, policy).unwrap().unwrap();
        for (i, sb) in slots.iter_mut().enumerate() {
            let mut image = base.clone();
            image.current = format!("s{i}");
            let seq = 10 * (i as u64 + 1);
            sb.persist(&file, &image.to_bytes().unwrap(), seq, policy).unwrap();
        }
        drop(file);

        let disk = Disk::open(cfg.clone()).unwrap();
        assert_eq!(disk.get_current(), "s2");
        let info = disk.info();
        assert!(info.superblocks.iter().all(|s| s.sequence == 30 && s.state == "good"));
        drop(disk);

        let file = RawFile::open(&cfg.path, false).unwrap();
        for i in 0..3 {
            let mut sb = Superblock::new(i, &geometry);
            let image = sb.load(&file, policy).unwrap().unwrap();
            assert_eq!(sb.sequence(), 30);
            assert_eq!(image.current, "s2");
        }
    }

    #[test]
    fn test_torn_superblock_recovers_from_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let disk = Disk::open(cfg.clone()).unwrap();
            disk.put_current("before");
            disk.sync().unwrap();
        }
        // keep the magic, scramble the rest of the header
        corrupt_slot(&cfg, 1, 8, &[0xee; 32]);

        let disk = Disk::open(cfg).unwrap();
        assert_eq!(disk.get_current(), "before");
        assert_eq!(disk.good_superblocks(), 2);
        assert!(disk.info().superblocks.iter().all(|s| s.state == "good"));
    }

    #[test]
    fn test_no_good_superblock_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        drop(Disk::open(cfg.clone()).unwrap());
        for i in 0..3 {
            corrupt_slot(&cfg, i, 0, &[0xff; 4096]);
        }
        let err = Disk::open(cfg.with_create_if_missing(false)).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_corrupt_superblocks_are_not_formatted_over() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        drop(Disk::open(cfg.clone()).unwrap());
        for i in 0..3 {
            corrupt_slot(&cfg, i, 8, &[0x11; 16]);
        }
        let err = Disk::open(cfg).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_zone_accounting_through_churn() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        for n in 1..=6 {
            disk.allocate_file(n, FileType::Table, (n % 3) as usize).unwrap();
            disk.allocate_file(100 + n, FileType::Value, 0).unwrap();
        }
        disk.allocate_file(50, FileType::Descriptor, 0).unwrap();
        disk.verify_zone_accounting().unwrap();
        for n in [2, 4, 6] {
            disk.deallocate_file(n, FileType::Table).unwrap();
            disk.deallocate_file(100 + n, FileType::Value).unwrap();
        }
        disk.verify_zone_accounting().unwrap();
        assert!(disk.deallocate_file(2, FileType::Table).unwrap_err().is_not_found());
        let info = disk.info();
        assert_eq!(info.used_zones + info.free_zones, 96);
    }

    #[test]
    fn test_write_pointer_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let dropped_end = {
            let disk = Disk::open(cfg.clone()).unwrap();
            for n in [1u64, 2] {
                let key = disk.allocate_file(n, FileType::Table, 0).unwrap();
                append(&disk, key, &vec![n as u8; 8192]);
                disk.complete_last_segment(key).unwrap();
            }
            let tail = disk.tail(FileKey::new(2, FileType::Table)).unwrap();
            assert_eq!(disk.geometry().zone_of(tail.addr), 68);
            disk.deallocate_file(2, FileType::Table).unwrap();
            disk.sync().unwrap();
            tail.end()
        };

        let disk = Disk::open(cfg).unwrap();
        let key = disk.allocate_file(3, FileType::Table, 0).unwrap();
        let addr = disk.tail(key).unwrap().addr;
        assert_eq!(disk.geometry().zone_of(addr), 68);
        assert!(addr >= dropped_end, "{addr} is below the write pointer {dropped_end}");
        assert_eq!(read_file(&disk, FileKey::new(1, FileType::Table)), vec![1; 8192]);
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_reallocating_a_number_replaces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        let key = disk.allocate_file(1, FileType::Table, 0).unwrap();
        append(&disk, key, &[1; 4096]);
        disk.allocate_file(1, FileType::Table, 0).unwrap();
        assert_eq!(disk.file_size(key).unwrap(), 0);
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_log_files_alternate_zones() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        let zone = |key| disk.geometry().zone_of(disk.tail(key).unwrap().addr);
        let first = disk.allocate_file(1, FileType::Log, 0).unwrap();
        assert_eq!(zone(first), 66);
        let second = disk.allocate_file(2, FileType::Log, 0).unwrap();
        assert_eq!(zone(second), 65);
        disk.deallocate_file(1, FileType::Log).unwrap();
        let third = disk.allocate_file(3, FileType::Log, 0).unwrap();
        assert_eq!(zone(third), 66);
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_capacity_ignores_log_and_manifest_zones() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        disk.allocate_file(1, FileType::Table, 0).unwrap();
        disk.allocate_file(2, FileType::Descriptor, 0).unwrap();
        disk.allocate_file(3, FileType::Log, 0).unwrap();
        assert_eq!(disk.capacity().used, MIB);
        assert!(disk.is_high_disk_usage());
    }

    #[test]
    fn test_no_space_status_follows_free_zones() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path()).with_no_space_threshold(10 * MIB)).unwrap();
        assert_eq!(disk.status(), DiskStatus::Normal);
        for n in 1..=18 {
            disk.allocate_file(n, FileType::Value, 0).unwrap();
        }
        assert_eq!(disk.status(), DiskStatus::Normal);
        disk.allocate_file(19, FileType::Value, 0).unwrap();
        assert_eq!(disk.status(), DiskStatus::NoSpace);

        // back to normal once twice the threshold is free
        for n in 1..=10 {
            disk.deallocate_file(n, FileType::Value).unwrap();
        }
        assert_eq!(disk.status(), DiskStatus::NoSpace);
        disk.deallocate_file(11, FileType::Value).unwrap();
        assert_eq!(disk.status(), DiskStatus::Normal);
    }

    #[test]
    fn test_zone_allocation_failure_surfaces_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let file = RawFile::create(&cfg.path, 96 * MIB, false).unwrap();
        let geometry = Geometry::from_config(&cfg, file.size()).unwrap();
        let device = Arc::new(EmulatedZoneDevice::new(geometry));
        device.fail_allocation(68);
        let disk = Disk::with_device(cfg, file, device.clone()).unwrap();

        match disk.allocate_file(1, FileType::Table, 0).unwrap_err() {
            Error::ZoneAllocation { zone, diagnostics, .. } => {
                assert_eq!(zone, 68);
                assert!(diagnostics.is_some());
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!disk.contains_file(FileKey::new(1, FileType::Table)));
        device.clear_faults();
        disk.allocate_file(1, FileType::Table, 0).unwrap();
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_defragment_needs_two_fragmented_zones() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        assert!(disk.defragment(1).unwrap_err().is_not_attempted());
        assert!(disk.defragment(NUM_LEVELS).is_err());
    }

    #[test]
    fn test_defragment_moves_live_segments() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let half = vec![0u8; (512 * KIB) as usize];
        let live = |n: u64| FileKey::new(n, FileType::Table);
        {
            let disk = Disk::open(cfg.clone()).unwrap();
            // two zones, each holding one dead and one live half-zone file
            for (dead, kept) in [(1, 2), (3, 4)] {
                for n in [dead, kept] {
                    let key = disk.allocate_file(n, FileType::Table, 1).unwrap();
                    let mut data = half.clone();
                    data.fill(n as u8);
                    append(&disk, key, &data);
                    disk.complete_last_segment(key).unwrap();
                }
            }
            assert_eq!(disk.tail(live(2)).unwrap().addr, disk.geometry().zone_start(68) + 512 * KIB);
            disk.deallocate_file(1, FileType::Table).unwrap();
            disk.deallocate_file(3, FileType::Table).unwrap();

            disk.defragment(1).unwrap();

            assert_eq!(disk.tail(live(2)).unwrap().addr, disk.geometry().zone_start(70));
            assert_eq!(disk.tail(live(4)).unwrap().addr, disk.geometry().zone_start(70) + 512 * KIB);
            disk.verify_zone_accounting().unwrap();
            let info = disk.info();
            assert_eq!(info.levels[1].zones, 1);
        }
        let disk = Disk::open(cfg).unwrap();
        for n in [2u64, 4] {
            assert_eq!(read_file(&disk, live(n)), vec![n as u8; (512 * KIB) as usize]);
        }
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_defragment_external_without_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        let store = crate::value::MemValueStore::new();
        assert!(disk.defragment_external(&store).unwrap_err().is_not_attempted());
    }

    #[test]
    fn test_blocked_value_file_deletion_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        let key = disk.allocate_file(5, FileType::Value, 0).unwrap();
        append(&disk, key, &[9; 4096]);
        disk.complete_last_segment(key).unwrap();
        disk.add_value_entries(5, 4).unwrap();
        disk.mark_values_deleted(5, 1).unwrap();
        disk.state.lock().value_files.pick_for_defrag(|_| true);

        disk.deallocate_file(5, FileType::Value).unwrap();
        assert!(disk.contains_file(key));
        assert!(disk.is_obsolete_value_file(5));
        assert!(disk.delete_obsolete_value_files().is_empty());

        disk.state.lock().value_files.unblock(5);
        assert_eq!(disk.delete_obsolete_value_files(), vec![5]);
        assert!(!disk.contains_file(key));
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_clear_resets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let disk = Disk::open(cfg.clone()).unwrap();
            disk.allocate_file(1, FileType::Table, 0).unwrap();
            disk.put_current("MANIFEST-000001\n");
            disk.sync().unwrap();
            disk.clear().unwrap();
            assert!(disk.file_keys().is_empty());
            assert!(disk.get_current().is_empty());
        }
        let disk = Disk::open(cfg).unwrap();
        assert!(disk.file_keys().is_empty());
        disk.verify_zone_accounting().unwrap();
    }

    #[test]
    fn test_usage_report_on_fresh_disk() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        let report = disk.zone_usage_report().unwrap();
        assert!(report.contains("ZONE CONDITION SNAPSHOT"));
        assert!(report.contains(" -Effective SSTs: 0\n"));
        assert!(report.contains(" -Total Zones: 0\n"));
    }

    #[test]
    fn test_usage_report_covers_level_zero_only() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        let key = disk.allocate_file(1, FileType::Table, 1).unwrap();
        append(&disk, key, &vec![7; MIB as usize]);
        disk.complete_last_segment(key).unwrap();

        let report = disk.zone_usage_report().unwrap();
        assert!(report.contains(" -Total Zones: 0\n"));
        assert!(report.contains(" -Effective SSTs: 0\n"));
    }

    #[test]
    fn test_render_usage_report_totals() {
        let snapshot = ZoneConditionSnapshot {
            counts: vec![(ZoneCondition::Full, 5)],
        };
        let mut histogram = [[0; HISTOGRAM_COLS]; HISTOGRAM_ROWS];
        histogram[0][1] = 2;
        histogram[1][0] = 2;
        histogram[2][2] = 1;
        let report = render_usage_report(&snapshot, &histogram);
        assert!(report.contains("    1   ->   [2,0,0]\n"));
        assert!(report.contains("    5   ->   [0,0,0]\n"));
        // 2 whole + 2*1 + 1 + 2/2
        assert!(report.contains(" -Effective SSTs: 6\n"));
        assert!(report.contains(" -Total Zones: 5\n"));
    }

    #[test]
    fn test_diagnosed_corruption_has_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(config(dir.path())).unwrap();
        match disk.diagnose_corruption("bad footer") {
            Error::DiagnosedCorruption { message, snapshot } => {
                assert_eq!(message, "bad footer");
                assert_eq!(snapshot.count(ZoneCondition::NonSequential), 64);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
