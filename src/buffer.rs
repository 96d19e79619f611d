use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::AtomicU64;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::Config;
use crate::error::Result;
use crate::{errcorrupt, errrange};

/// A file-backed buffer mapping the whole file read-write.
///
/// All access goes through a [`MapGuard`], which holds the reader share of
/// the internal lock; [`MmapBuffer::grow`] takes the exclusive side, so no
/// guard can ever observe a dangling mapping across a remap.
#[derive(Debug)]
pub struct MmapBuffer {
    file: File,
    path: PathBuf,
    page_size: u64,
    map: RwLock<MmapMut>,
}

impl MmapBuffer {
    /// Create-or-open the file at `path` and map it read-write.
    ///
    /// An empty file is grown to `initial_capacity` first. Returns the
    /// buffer and whether the file was freshly initialized, so the caller
    /// knows to seed the metadata region.
    pub fn open(path: &Path, initial_capacity: u64) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let created = len == 0;
        if created {
            if initial_capacity == 0 {
                return errcorrupt!("initial capacity must be non-zero");
            }
            file.set_len(initial_capacity)?;
        }

        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                page_size: os_page_size(),
                map: RwLock::new(map),
            },
            created,
        ))
    }

    /// Acquire the reader share of the grow lock for the duration of an
    /// operation.
    pub fn map(&self) -> MapGuard<'_> {
        MapGuard {
            map: self.map.read(),
            page_size: self.page_size,
        }
    }

    /// Current mapped size in bytes.
    pub fn mapped_len(&self) -> u64 {
        self.map.read().len() as u64
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Grow the mapping so that `mapped_len() >= min_required`, advancing
    /// the capacity along the configured schedule.
    ///
    /// Takes the exclusive side of the lock: every in-flight reader and
    /// writer drains before the old mapping is flushed and replaced. A
    /// failed growth leaves the pre-growth mapping intact and usable.
    pub fn grow(&self, min_required: u64, config: &Config) -> Result<()> {
        let mut map = self.map.write();

        let current = map.len() as u64;
        if current >= min_required {
            // A concurrent growth already satisfied the request.
            return Ok(());
        }

        let mut target = current;
        while target < min_required {
            target = config.next_capacity(target);
        }

        map.flush()?;
        self.file.set_len(target)?;
        let grown = unsafe { MmapOptions::new().map_mut(&self.file)? };
        *map = grown;

        tracing::debug!(bytes = target, "mmap resized");
        Ok(())
    }
}

/// Shared access to the current mapping. Holding the guard excludes
/// remapping, so raw offsets stay valid for the guard's lifetime.
pub struct MapGuard<'a> {
    map: RwLockReadGuard<'a, MmapMut>,
    page_size: u64,
}

impl MapGuard<'_> {
    /// Mapped size in bytes.
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Bounds-checked view of `[start, end)`.
    pub fn slice(&self, start: u64, end: u64) -> Result<&[u8]> {
        if start > end || end > self.len() {
            return errrange!("slice {}..{} exceeds mapped length {}", start, end, self.len());
        }
        Ok(&self.map[start as usize..end as usize])
    }

    /// A 64-bit atomic view of the mapped bytes at `at`.
    ///
    /// Used for the metadata fields at the head of the file, which are
    /// published with single atomic loads and stores. `at` must be 8-byte
    /// aligned and in bounds; the mapping itself is page aligned.
    pub fn atomic_u64(&self, at: u64) -> &AtomicU64 {
        debug_assert!(at % 8 == 0 && at + 8 <= self.len());
        unsafe { &*(self.map.as_ptr().add(at as usize) as *const AtomicU64) }
    }

    /// Copy `bytes` into the mapping at `at`.
    ///
    /// Only the publication path calls this, targeting the unpublished
    /// append region past `Meta.end_offset` (or the metadata seed before
    /// the map is shared). The writer lock makes that region exclusive, so
    /// the store does not race any reader.
    pub fn write(&self, at: u64, bytes: &[u8]) -> Result<()> {
        let end = at + bytes.len() as u64;
        if end > self.len() {
            return errrange!("write {}..{} exceeds mapped length {}", at, end, self.len());
        }
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_ptr().add(at as usize) as *mut u8,
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Durably write back `[start, end_inclusive]`, with `start` rounded
    /// down to the OS page size.
    pub fn flush_region(&self, start: u64, end_inclusive: u64) -> Result<()> {
        if end_inclusive >= self.len() {
            return errrange!(
                "flush region end {} exceeds mapped length {}",
                end_inclusive,
                self.len()
            );
        }
        let page_start = start & !(self.page_size - 1);
        let len = (end_inclusive + 1 - page_start) as usize;
        self.map.flush_range(page_start as usize, len)?;
        Ok(())
    }

    /// Durably write back the whole mapping.
    pub fn flush_all(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn os_page_size() -> u64 {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_buffer(capacity: u64) -> (NamedTempFile, MmapBuffer) {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        let (buffer, created) =
            MmapBuffer::open(tmp.path(), capacity).expect("Failed to open buffer");
        assert!(created);
        (tmp, buffer)
    }

    #[test]
    fn test_open_initializes_empty_file() {
        let (_tmp, buffer) = open_buffer(1024 * 1024);
        assert_eq!(buffer.mapped_len(), 1024 * 1024);
        assert_eq!(buffer.file_size().unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_reopen_existing_is_not_created() {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        {
            let (buffer, created) =
                MmapBuffer::open(tmp.path(), 64 * 1024).expect("Failed to open buffer");
            assert!(created);
            let map = buffer.map();
            map.write(0, b"persist me").unwrap();
            map.flush_all().unwrap();
        }

        let (buffer, created) =
            MmapBuffer::open(tmp.path(), 64 * 1024).expect("Failed to reopen buffer");
        assert!(!created);
        let map = buffer.map();
        assert_eq!(map.slice(0, 10).unwrap(), b"persist me");
    }

    #[test]
    fn test_write_and_slice_roundtrip() {
        let (_tmp, buffer) = open_buffer(64 * 1024);
        let map = buffer.map();

        map.write(128, b"hello buffer").unwrap();
        assert_eq!(map.slice(128, 140).unwrap(), b"hello buffer");
    }

    #[test]
    fn test_out_of_range_access() {
        let (_tmp, buffer) = open_buffer(4096);
        let map = buffer.map();

        assert!(map.slice(4090, 4097).is_err());
        assert!(map.write(4095, b"too long").is_err());
        assert!(map.flush_region(0, 4096).is_err());
    }

    #[test]
    fn test_grow_follows_schedule_and_preserves_data() {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        let config = Config::new(tmp.path())
            .initial_capacity(64 * 1024)
            .max_growth_step(1024 * 1024);

        let (buffer, _) =
            MmapBuffer::open(tmp.path(), config.initial_capacity).expect("Failed to open buffer");
        buffer.map().write(100, b"survives growth").unwrap();

        // Requires two doublings: 64K -> 128K -> 256K.
        buffer.grow(200 * 1024, &config).expect("Failed to grow");
        assert_eq!(buffer.mapped_len(), 256 * 1024);
        assert_eq!(buffer.file_size().unwrap(), 256 * 1024);

        let map = buffer.map();
        assert_eq!(map.slice(100, 115).unwrap(), b"survives growth");
    }

    #[test]
    fn test_grow_is_noop_when_large_enough() {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        let config = Config::new(tmp.path()).initial_capacity(64 * 1024);

        let (buffer, _) =
            MmapBuffer::open(tmp.path(), config.initial_capacity).expect("Failed to open buffer");
        buffer.grow(1024, &config).expect("Failed to grow");
        assert_eq!(buffer.mapped_len(), 64 * 1024);
    }

    #[test]
    fn test_flush_region_aligns_start() {
        let (_tmp, buffer) = open_buffer(64 * 1024);
        let map = buffer.map();

        map.write(5000, b"flush me").unwrap();
        // Unaligned start is rounded down to the page boundary.
        map.flush_region(5000, 5007).expect("Failed to flush region");
    }

    #[test]
    fn test_atomic_field_access() {
        use std::sync::atomic::Ordering;

        let (_tmp, buffer) = open_buffer(4096);
        let map = buffer.map();

        map.atomic_u64(8).store(0xdead_beef, Ordering::Release);
        assert_eq!(map.atomic_u64(8).load(Ordering::Acquire), 0xdead_beef);
        assert_eq!(map.slice(8, 12).unwrap(), &0xdead_beefu32.to_le_bytes());
    }
}
