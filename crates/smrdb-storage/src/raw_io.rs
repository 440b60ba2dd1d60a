//! Positioned raw I/O against the zoned device
//!
//! Provides the primitives every higher layer goes through:
//! - positioned reads and writes (`pread`/`pwrite`), optionally `O_DIRECT`
//! - bounded retry with a fixed backoff for transient failures
//! - `sync_file_range` over exact byte ranges, falling back to `fdatasync`

use smrdb_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::warn;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const ALIGNMENT: usize = 4096;

/// Flags for a ranged sync, mirroring `sync_file_range(2)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncFlags(u32);

impl SyncFlags {
    /// Wait for writeback already in flight
    pub const WAIT_BEFORE: Self = Self(1);
    /// Start writeback of dirty pages
    pub const WRITE: Self = Self(2);
    /// Wait for the writeback to finish
    pub const WAIT_AFTER: Self = Self(4);

    /// Start writeback after waiting for in-flight pages
    pub const START: Self = Self(1 | 2);
    /// Full durable flush of the range
    pub const DURABLE: Self = Self(1 | 2 | 4);

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Attempts and backoff for physical I/O
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts
    pub attempts: u32,
    /// Sleep between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Raw device or image handle
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct: bool,
}

impl RawFile {
    /// Open an existing device or image for read/write
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        Self::apply_direct(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::Io(format!("failed to open {path_str}: {e}")))?;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| Error::Io(format!("failed to stat {path_str}: {e}")))?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            direct,
        })
    }

    /// Create a sparse image of the given size, or open a block device as-is
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        if Self::is_block_device(&path) {
            return Self::open(path, direct);
        }
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        Self::apply_direct(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::Io(format!("failed to create {path_str}: {e}")))?;
        let current = file.metadata().map(|m| m.len()).unwrap_or(0);
        if current < size {
            file.set_len(size)
                .map_err(|e| Error::Io(format!("failed to size {path_str}: {e}")))?;
        }

        Ok(Self {
            file,
            path: path_str,
            size: current.max(size),
            direct,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct(options: &mut OpenOptions, direct: bool) {
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct(_options: &mut OpenOptions, _direct: bool) {}

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::Io(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| Error::Io(format!("failed to get device size for {path}: {e}")))
    }

    /// Device size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Device path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the handle bypasses the page cache
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Single positioned read
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_alignment(offset, buf.len())?;
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Single positioned write
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check_alignment(offset, buf.len())?;
        Ok(self.file.write_at(buf, offset)?)
    }

    /// Fill `buf` from `offset`, retrying short or failed reads
    pub fn read_exact_retry(&self, offset: u64, buf: &mut [u8], policy: RetryPolicy) -> Result<()> {
        let mut done = 0;
        let mut attempts = policy.attempts;
        let mut last_err = String::from("short read");
        while done < buf.len() {
            match self.read_at(offset + done as u64, &mut buf[done..]) {
                Ok(n) if n > 0 => {
                    done += n;
                    continue;
                }
                Ok(_) => last_err = format!("unexpected end of device at {}", offset + done as u64),
                Err(e) => last_err = e.to_string(),
            }
            attempts = attempts.saturating_sub(1);
            if attempts == 0 {
                break;
            }
            warn!("read of {} bytes at {} on {} failed ({last_err}), retrying", buf.len() - done, offset + done as u64, self.path);
            thread::sleep(policy.backoff);
        }
        if done < buf.len() {
            return Err(Error::Io(format!(
                "pread {} bytes at {offset} on {}: {last_err}",
                buf.len(),
                self.path
            )));
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`, retrying short or failed writes
    pub fn write_all_retry(&self, offset: u64, buf: &[u8], policy: RetryPolicy) -> Result<()> {
        let mut done = 0;
        let mut attempts = policy.attempts;
        let mut last_err = String::from("short write");
        while done < buf.len() {
            match self.write_at(offset + done as u64, &buf[done..]) {
                Ok(n) if n > 0 => {
                    done += n;
                    continue;
                }
                Ok(_) => last_err = "wrote zero bytes".into(),
                Err(e) => last_err = e.to_string(),
            }
            attempts = attempts.saturating_sub(1);
            if attempts == 0 {
                break;
            }
            warn!("write of {} bytes at {} on {} failed ({last_err}), retrying", buf.len() - done, offset + done as u64, self.path);
            thread::sleep(policy.backoff);
        }
        if done < buf.len() {
            return Err(Error::Io(format!(
                "pwrite {} bytes at {offset} on {}: {last_err}",
                buf.len(),
                self.path
            )));
        }
        Ok(())
    }

    /// Flush a byte range
    #[cfg(target_os = "linux")]
    pub fn sync_range(&self, offset: u64, len: u64, flags: SyncFlags) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        if len == 0 {
            return Ok(());
        }
        let (Ok(off), Ok(nbytes)) = (i64::try_from(offset), i64::try_from(len)) else {
            return Err(Error::invalid_argument(format!(
                "sync range {offset}+{len} out of bounds"
            )));
        };
        let ret = unsafe {
            libc::sync_file_range(self.file.as_raw_fd(), off, nbytes, flags.bits())
        };
        if ret == -1 {
            return Err(Error::Io(format!(
                "sync_file_range {offset}+{len} on {}: {}",
                self.path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Flush a byte range
    #[cfg(not(target_os = "linux"))]
    pub fn sync_range(&self, _offset: u64, len: u64, _flags: SyncFlags) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.sync_data()
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Io(format!("fdatasync failed on {}: {e}", self.path)))
    }

    fn check_alignment(&self, offset: u64, size: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if offset % ALIGNMENT as u64 != 0 || size % ALIGNMENT != 0 {
            return Err(Error::invalid_argument(format!(
                "direct I/O of {size} bytes at {offset} is not aligned to {ALIGNMENT}"
            )));
        }
        Ok(())
    }
}

/// Zero-filled buffer whose data starts on an `ALIGNMENT` boundary
///
/// Over-allocates by one alignment unit and exposes the aligned window, which
/// keeps `O_DIRECT` transfers valid without a custom allocator.
#[derive(Debug)]
pub struct AlignedBuffer {
    raw: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Buffer of `size` bytes rounded up to the alignment
    #[must_use]
    pub fn new(size: usize) -> Self {
        let len = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        let raw = vec![0u8; len + ALIGNMENT];
        let start = raw.as_ptr().align_offset(ALIGNMENT);
        Self { raw, start, len }
    }

    /// Buffer length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero length
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Aligned contents
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.raw[self.start..self.start + self.len]
    }

    /// Aligned contents, mutable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.start..self.start + self.len]
    }

    /// Zero the whole buffer
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
