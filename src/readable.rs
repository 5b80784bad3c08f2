//! Byte-random-access file abstraction.
//!
//! [`Readable`] is the smallest surface the reader needs from a file:
//! positional reads, a size, and read-handle creation. Two implementations
//! are provided:
//!
//! - [`FileReadable`] — positional reads on an open [`File`]. Safe for
//!   concurrent readers; no shared cursor.
//! - [`MmapReadable`] — the whole file memory-mapped read-only via
//!   [`memmap2`]. Reads are plain slice copies.
//!
//! Dropping a `Readable` closes the underlying file. Every read accepts a
//! [`ReadContext`] carrying an optional cancellation flag; a raised flag
//! fails the read with [`SstError::Cancelled`] before any bytes are
//! copied, so no partial state is ever observed.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Result, SstError};

// ------------------------------------------------------------------------------------------------
// Cancellation
// ------------------------------------------------------------------------------------------------

/// Shared cancellation flag threaded through every read operation.
///
/// Iterators never own one of these — they propagate the caller's.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    raised: Arc<AtomicBool>,
}

impl CancelFlag {
    /// A fresh, unraised flag.
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    /// Raises the flag. In-flight reads observing it fail with
    /// [`SstError::Cancelled`].
    pub fn cancel(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Per-operation read context. Cheap to clone; carries cancellation only.
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    cancel: Option<CancelFlag>,
}

impl ReadContext {
    /// A context that can never be cancelled.
    pub fn new() -> ReadContext {
        ReadContext::default()
    }

    /// A context observing the given flag.
    pub fn with_cancel(flag: CancelFlag) -> ReadContext {
        ReadContext { cancel: Some(flag) }
    }

    /// Fails with [`SstError::Cancelled`] if the flag is raised.
    pub fn check(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.is_cancelled() => Err(SstError::Cancelled),
            _ => Ok(()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Readable
// ------------------------------------------------------------------------------------------------

/// Hint supplied when creating a read handle: how much of the file tail the
/// handle may prefetch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadBeforeSize {
    /// No prefetch hint.
    None,
    /// The handle will read the footer and metaindex region of a file that
    /// is being opened; prefetching the tail is worthwhile.
    NewReader,
}

/// Random-access byte source backing a table.
pub trait Readable: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, rctx: &ReadContext, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Total size of the file in bytes.
    fn size(&self) -> u64;
}

/// A read cursor over a [`Readable`] carrying access-pattern hints.
///
/// The hints are advisory: `FileReadable` and `MmapReadable` satisfy reads
/// directly, but object-storage implementations may use them to size
/// read-ahead windows.
pub struct ReadHandle {
    readable: Arc<dyn Readable>,
    sequential: AtomicBool,
}

impl ReadHandle {
    /// Creates a handle over `readable` with the given prefetch hint.
    pub fn new(readable: Arc<dyn Readable>, _read_before: ReadBeforeSize) -> ReadHandle {
        ReadHandle {
            readable,
            sequential: AtomicBool::new(false),
        }
    }

    /// Marks the handle as sequential: the caller intends to scan the file
    /// front to back (compaction).
    pub fn setup_for_compaction(&self) {
        self.sequential.store(true, Ordering::Relaxed);
    }

    /// Whether the sequential hint has been set.
    pub fn is_sequential(&self) -> bool {
        self.sequential.load(Ordering::Relaxed)
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, rctx: &ReadContext, buf: &mut [u8], offset: u64) -> Result<()> {
        self.readable.read_at(rctx, buf, offset)
    }
}

// ------------------------------------------------------------------------------------------------
// File-backed implementation
// ------------------------------------------------------------------------------------------------

/// [`Readable`] over an open file using positional reads.
pub struct FileReadable {
    file: File,
    size: u64,
}

impl FileReadable {
    /// Wraps an open file. The size is captured once; tables are immutable.
    pub fn new(file: File) -> Result<FileReadable> {
        let size = file.metadata()?.len();
        Ok(FileReadable { file, size })
    }

    /// Opens the file at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<FileReadable> {
        FileReadable::new(File::open(path)?)
    }
}

impl Readable for FileReadable {
    fn read_at(&self, rctx: &ReadContext, buf: &mut [u8], offset: u64) -> Result<()> {
        rctx.check()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut f = self.file.try_clone()?;
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(buf)?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

// ------------------------------------------------------------------------------------------------
// Mmap-backed implementation
// ------------------------------------------------------------------------------------------------

/// [`Readable`] over a read-only memory map of the whole file.
pub struct MmapReadable {
    mmap: Mmap,
}

impl MmapReadable {
    /// Maps an open file.
    ///
    /// # Safety rationale
    ///
    /// `Mmap::map` is `unsafe` because the mapping is undefined if the file
    /// is concurrently truncated. Tables are immutable once written, so the
    /// mapping stays valid for the life of the reader.
    pub fn new(file: &File) -> Result<MmapReadable> {
        let mmap = unsafe { Mmap::map(file)? };
        Ok(MmapReadable { mmap })
    }

    /// Opens and maps the file at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<MmapReadable> {
        MmapReadable::new(&File::open(path)?)
    }
}

impl Readable for MmapReadable {
    fn read_at(&self, rctx: &ReadContext, buf: &mut [u8], offset: u64) -> Result<()> {
        rctx.check()?;
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SstError::Corruption("read offset overflow".into()))?;
        if end > self.mmap.len() {
            return Err(SstError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of mapped file",
            )));
        }
        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        f.sync_all().unwrap();
        path
    }

    #[test]
    fn file_readable_positional_reads() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "r.bin", b"hello world");

        let r = FileReadable::open(&path).unwrap();
        assert_eq!(r.size(), 11);

        let mut buf = [0u8; 5];
        r.read_at(&ReadContext::new(), &mut buf, 6).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn mmap_readable_bounds_checked() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "m.bin", b"abcdef");

        let r = MmapReadable::open(&path).unwrap();
        let mut buf = [0u8; 3];
        r.read_at(&ReadContext::new(), &mut buf, 1).unwrap();
        assert_eq!(&buf, b"bcd");

        let mut long = [0u8; 8];
        assert!(r.read_at(&ReadContext::new(), &mut long, 0).is_err());
    }

    #[test]
    fn read_handle_carries_hints() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "h.bin", b"0123456789");
        let readable: Arc<dyn Readable> = Arc::new(FileReadable::open(&path).unwrap());

        let rh = ReadHandle::new(readable, ReadBeforeSize::NewReader);
        assert!(!rh.is_sequential());
        rh.setup_for_compaction();
        assert!(rh.is_sequential());

        let mut buf = [0u8; 4];
        rh.read_at(&ReadContext::new(), &mut buf, 2).unwrap();
        assert_eq!(&buf, b"2345");
    }

    #[test]
    fn cancelled_context_fails_before_reading() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "c.bin", b"abcdef");
        let r = FileReadable::open(&path).unwrap();

        let flag = CancelFlag::new();
        let rctx = ReadContext::with_cancel(flag.clone());
        flag.cancel();

        let mut buf = [0u8; 2];
        assert!(matches!(
            r.read_at(&rctx, &mut buf, 0),
            Err(SstError::Cancelled)
        ));
    }
}
