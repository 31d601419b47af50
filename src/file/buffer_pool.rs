use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::error::{FileError, FileResult};
use super::file_manager::{FileHandle, PagedFileManager};
use super::PageNo;

/// Forces the write-ahead log up to a sequence number.
///
/// The pool calls this before writing a dirty page back, with the highest
/// LSN that modified the page.
pub trait LogFlusher: Send + Sync {
    fn flush_to(&self, lsn: u64) -> io::Result<()>;
}

/// A key identifying a page in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file: FileHandle,
    pub page: PageNo,
}

/// One cached page
struct Frame {
    /// Page latch, held only for the duration of a read or modify closure
    data: RwLock<Vec<u8>>,
    pins: AtomicU32,
    dirty: AtomicBool,
    /// Highest LSN whose change is contained in `data`
    page_lsn: AtomicU64,
}

impl Frame {
    fn new(data: Vec<u8>, dirty: bool) -> Self {
        Self {
            data: RwLock::new(data),
            pins: AtomicU32::new(1),
            dirty: AtomicBool::new(dirty),
            page_lsn: AtomicU64::new(0),
        }
    }

    fn unpin(&self, dirty: bool) {
        if dirty {
            self.dirty.store(true, Ordering::Release);
        }
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "unpin of a page with zero pin count");
    }
}

/// A pinned page. The frame cannot be evicted until this guard is dropped.
pub struct PinnedPage {
    key: PageKey,
    frame: Arc<Frame>,
}

impl PinnedPage {
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Highest LSN that modified this page
    pub fn lsn(&self) -> u64 {
        self.frame.page_lsn.load(Ordering::Acquire)
    }

    /// Run `f` over the page bytes under a shared page latch
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.frame.data.read();
        f(&data)
    }

    /// Run `f` over the page bytes under an exclusive page latch.
    ///
    /// The page becomes dirty and its LSN is raised to `lsn`.
    pub fn modify<R>(&self, lsn: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.frame.data.write();
        let result = f(&mut data);
        self.frame.page_lsn.fetch_max(lsn, Ordering::AcqRel);
        self.frame.dirty.store(true, Ordering::Release);
        result
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.frame.unpin(false);
    }
}

struct PoolInner {
    /// Recency order of every cached frame; capacity is enforced by `make_room`
    frames: LruCache<PageKey, Arc<Frame>>,
    files: PagedFileManager,
}

/// Fixed-capacity page cache with LRU replacement over unpinned frames.
///
/// This is the only component that moves page bytes between memory and
/// disk. Dirty pages are written back on eviction and on `flush`/`flush_all`,
/// each time after the log has been forced up to the page's LSN.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
    page_size: usize,
    log: Option<Arc<dyn LogFlusher>>,
}

impl BufferPool {
    /// Create a buffer pool with `capacity` frames
    pub fn new(files: PagedFileManager, capacity: usize, log: Option<Arc<dyn LogFlusher>>) -> Self {
        let page_size = files.page_size();
        Self {
            inner: Mutex::new(PoolInner {
                frames: LruCache::unbounded(),
                files,
            }),
            capacity,
            page_size,
            log,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Register the page directory of a file handle
    pub fn register_file<P: AsRef<Path>>(&self, file: FileHandle, dir: P) -> FileResult<()> {
        self.inner.lock().files.open_dir(file, dir)
    }

    /// Pin a page, loading it from disk on a miss
    pub fn fetch(&self, file: FileHandle, page: PageNo) -> FileResult<PinnedPage> {
        let key = PageKey { file, page };
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get(&key) {
            frame.pins.fetch_add(1, Ordering::AcqRel);
            return Ok(PinnedPage {
                key,
                frame: Arc::clone(frame),
            });
        }

        self.make_room(&mut inner)?;

        let mut data = vec![0u8; self.page_size];
        inner.files.read_page(file, page, &mut data)?;
        let frame = Arc::new(Frame::new(data, false));
        inner.frames.put(key, Arc::clone(&frame));

        Ok(PinnedPage { key, frame })
    }

    /// Pin a freshly allocated page without reading disk. The page starts
    /// zeroed and dirty.
    pub fn new_page(&self, file: FileHandle, page: PageNo) -> FileResult<PinnedPage> {
        let key = PageKey { file, page };
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get(&key) {
            frame.pins.fetch_add(1, Ordering::AcqRel);
            let pinned = PinnedPage {
                key,
                frame: Arc::clone(frame),
            };
            pinned.modify(0, |bytes| bytes.fill(0));
            return Ok(pinned);
        }

        self.make_room(&mut inner)?;

        let frame = Arc::new(Frame::new(vec![0u8; self.page_size], true));
        inner.frames.put(key, Arc::clone(&frame));
        Ok(PinnedPage { key, frame })
    }

    /// Release one pin on a cached page.
    ///
    /// # Panics
    /// If the page is not cached or not pinned.
    pub fn unpin(&self, file: FileHandle, page: PageNo, dirty: bool) {
        let key = PageKey { file, page };
        let frame = self
            .inner
            .lock()
            .frames
            .peek(&key)
            .cloned()
            .unwrap_or_else(|| panic!("unpin of uncached page {page}"));
        frame.unpin(dirty);
    }

    /// Evict least recently used unpinned frames until one slot is free
    fn make_room(&self, inner: &mut PoolInner) -> FileResult<()> {
        while inner.frames.len() >= self.capacity {
            // iter() runs from most to least recently used
            let victim = inner
                .frames
                .iter()
                .rev()
                .find(|(_, frame)| frame.pins.load(Ordering::Acquire) == 0)
                .map(|(key, frame)| (*key, Arc::clone(frame)));

            let Some((key, frame)) = victim else {
                return Err(FileError::BufferPoolExhausted {
                    capacity: self.capacity,
                });
            };

            self.write_back(&mut inner.files, key, &frame)?;
            inner.frames.pop(&key);
            tracing::trace!(file = key.file.as_u32(), page = key.page, "evicted page");
        }
        Ok(())
    }

    /// Write a dirty frame to disk, forcing the log first. The page latch is
    /// held only while the bytes are copied out.
    fn write_back(&self, files: &mut PagedFileManager, key: PageKey, frame: &Frame) -> FileResult<()> {
        // a modify after the copy marks the frame dirty again
        let (data, lsn) = {
            let data = frame.data.read();
            if !frame.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            (data.clone(), frame.page_lsn.load(Ordering::Acquire))
        };

        let written = match &self.log {
            Some(log) => log.flush_to(lsn).map_err(FileError::LogFlush),
            None => Ok(()),
        }
        .and_then(|()| files.write_page(key.file, key.page, &data));
        if written.is_err() {
            frame.dirty.store(true, Ordering::Release);
        }
        written
    }

    /// Write a page back if it is dirty
    pub fn flush(&self, file: FileHandle, page: PageNo) -> FileResult<()> {
        let key = PageKey { file, page };
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.peek(&key).cloned() {
            self.write_back(&mut inner.files, key, &frame)?;
        }
        Ok(())
    }

    /// Write every dirty page back and sync them to disk
    pub fn flush_all(&self) -> FileResult<()> {
        let mut inner = self.inner.lock();

        // iter() does not touch the recency order
        let dirty: Vec<(PageKey, Arc<Frame>)> = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty.load(Ordering::Acquire))
            .map(|(key, frame)| (*key, Arc::clone(frame)))
            .collect();

        for (key, frame) in dirty {
            self.write_back(&mut inner.files, key, &frame)?;
        }

        inner.files.sync_all()?;
        Ok(())
    }

    /// Drop a page without writing it back and delete its file
    pub fn discard(&self, file: FileHandle, page: PageNo) -> FileResult<()> {
        let mut inner = self.inner.lock();
        inner.frames.pop(&PageKey { file, page });
        inner.files.remove_page(file, page)
    }

    /// Drop every page of a file and delete the file's page directory
    pub fn drop_file(&self, file: FileHandle) -> FileResult<()> {
        let mut inner = self.inner.lock();
        let keys: Vec<PageKey> = inner
            .frames
            .iter()
            .filter(|(key, _)| key.file == file)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            inner.frames.pop(&key);
        }
        inner.files.remove_file(file)
    }

    /// Forget every cached page without writing anything back
    pub fn discard_all(&self) {
        self.inner.lock().frames.clear();
    }

    /// Page numbers of `file` that exist on disk
    pub fn stored_pages(&self, file: FileHandle) -> FileResult<Vec<PageNo>> {
        self.inner.lock().files.page_numbers(file)
    }

    /// Get the number of pages currently in the buffer pool
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a page is in the buffer pool, without touching its recency
    pub fn is_cached(&self, file: FileHandle, page: PageNo) -> bool {
        self.inner.lock().frames.contains(&PageKey { file, page })
    }

    pub fn pin_count(&self, file: FileHandle, page: PageNo) -> Option<u32> {
        self.inner
            .lock()
            .frames
            .peek(&PageKey { file, page })
            .map(|frame| frame.pins.load(Ordering::Acquire))
    }

    /// Get the number of dirty pages in the buffer pool
    pub fn dirty_count(&self) -> usize {
        self.inner
            .lock()
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty.load(Ordering::Acquire))
            .count()
    }
}
