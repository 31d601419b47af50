use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::error::{FileError, FileResult};
use super::{PAGE_TRAILER, PageNo};

/// Handle to a registered page file set (one per table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(u32);

impl FileHandle {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Reads and writes fixed-size pages, one file per page.
///
/// Pages of a handle live under `<dir>/pages/<n>.page`. Every file holds the
/// page bytes followed by a CRC-32 of those bytes. Pages are replaced through
/// a temporary file and a rename, so a page file is either the old or the new
/// image, never a mix.
pub struct PagedFileManager {
    /// Map from handles to their page directories
    dirs: HashMap<FileHandle, PathBuf>,
    /// Page files written since the last `sync_all`
    unsynced: HashSet<(FileHandle, PageNo)>,
    page_size: usize,
}

impl PagedFileManager {
    /// Create a file manager for pages of `page_size` bytes
    pub fn new(page_size: usize) -> Self {
        Self {
            dirs: HashMap::new(),
            unsynced: HashSet::new(),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Register `dir` as the home of `handle`, creating `dir/pages` if needed
    pub fn open_dir<P: AsRef<Path>>(&mut self, handle: FileHandle, dir: P) -> FileResult<()> {
        if self.dirs.contains_key(&handle) {
            return Err(FileError::FileAlreadyExists(
                dir.as_ref().display().to_string(),
            ));
        }

        let pages = dir.as_ref().join("pages");
        fs::create_dir_all(&pages)?;
        self.dirs.insert(handle, pages);
        Ok(())
    }

    /// Forget a handle without touching its files
    pub fn close_file(&mut self, handle: FileHandle) -> FileResult<()> {
        self.dirs
            .remove(&handle)
            .ok_or(FileError::UnknownFile(handle.0))?;
        self.unsynced.retain(|(h, _)| *h != handle);
        Ok(())
    }

    /// Forget a handle and delete all of its pages
    pub fn remove_file(&mut self, handle: FileHandle) -> FileResult<()> {
        let dir = self
            .dirs
            .remove(&handle)
            .ok_or(FileError::UnknownFile(handle.0))?;
        self.unsynced.retain(|(h, _)| *h != handle);

        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn page_path(&self, handle: FileHandle, page: PageNo) -> FileResult<PathBuf> {
        let dir = self
            .dirs
            .get(&handle)
            .ok_or(FileError::UnknownFile(handle.0))?;
        Ok(dir.join(format!("{page}.page")))
    }

    fn check_len(&self, len: usize) -> FileResult<()> {
        if len != self.page_size {
            return Err(FileError::InvalidPageSize {
                expected: self.page_size,
                actual: len,
            });
        }
        Ok(())
    }

    /// Read a page into `buffer`.
    ///
    /// A page that was never written reads as zeros.
    pub fn read_page(
        &mut self,
        handle: FileHandle,
        page: PageNo,
        buffer: &mut [u8],
    ) -> FileResult<()> {
        self.check_len(buffer.len())?;
        let path = self.page_path(handle, page)?;

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                buffer.fill(0);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mismatch = || FileError::PageChecksumMismatch {
            page,
            path: path.display().to_string(),
        };
        if bytes.len() != self.page_size + PAGE_TRAILER {
            return Err(mismatch());
        }

        let (data, trailer) = bytes.split_at(self.page_size);
        let mut stored = [0u8; PAGE_TRAILER];
        stored.copy_from_slice(trailer);
        if crc32fast::hash(data) != u32::from_le_bytes(stored) {
            return Err(mismatch());
        }

        buffer.copy_from_slice(data);
        Ok(())
    }

    /// Write a page image
    pub fn write_page(&mut self, handle: FileHandle, page: PageNo, buffer: &[u8]) -> FileResult<()> {
        self.check_len(buffer.len())?;
        let path = self.page_path(handle, page)?;
        let tmp = path.with_extension("page.tmp");

        {
            let mut file = File::create(&tmp)?;
            file.write_all(buffer)?;
            file.write_all(&crc32fast::hash(buffer).to_le_bytes())?;
        }
        fs::rename(&tmp, &path)?;
        // Note: no fsync here; sync_all() makes written pages durable in one pass
        self.unsynced.insert((handle, page));

        Ok(())
    }

    /// Delete a page file; a missing file is not an error
    pub fn remove_page(&mut self, handle: FileHandle, page: PageNo) -> FileResult<()> {
        let path = self.page_path(handle, page)?;
        self.unsynced.remove(&(handle, page));
        match fs::remove_file(&path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Page numbers that currently have a file on disk, ascending
    pub fn page_numbers(&self, handle: FileHandle) -> FileResult<Vec<PageNo>> {
        let dir = self
            .dirs
            .get(&handle)
            .ok_or(FileError::UnknownFile(handle.0))?;

        let mut pages = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".page")) else {
                continue;
            };
            if let Ok(page) = stem.parse::<PageNo>() {
                pages.push(page);
            }
        }
        pages.sort_unstable();
        Ok(pages)
    }

    /// fsync every page written since the last call, then the page directories
    pub fn sync_all(&mut self) -> FileResult<()> {
        let mut touched = HashSet::new();
        for (handle, page) in self.unsynced.drain().collect::<Vec<_>>() {
            let path = self.page_path(handle, page)?;
            match File::open(&path) {
                Ok(file) => file.sync_all()?,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            touched.insert(handle);
        }

        for handle in touched {
            if let Some(dir) = self.dirs.get(&handle) {
                File::open(dir)?.sync_all()?;
            }
        }
        Ok(())
    }

    /// Check if a handle is registered
    pub fn is_file_open(&self, handle: FileHandle) -> bool {
        self.dirs.contains_key(&handle)
    }

    pub fn open_file_count(&self) -> usize {
        self.dirs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 256;

    fn setup_test_dir() -> (TempDir, PagedFileManager, FileHandle) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut manager = PagedFileManager::new(PAGE_SIZE);
        let handle = FileHandle::new(1);
        manager.open_dir(handle, temp_dir.path().join("t1")).unwrap();
        (temp_dir, manager, handle)
    }

    #[test]
    fn test_open_dir_twice() {
        let (temp_dir, mut manager, handle) = setup_test_dir();
        let result = manager.open_dir(handle, temp_dir.path().join("t1"));
        assert!(matches!(result, Err(FileError::FileAlreadyExists(_))));
        assert_eq!(manager.open_file_count(), 1);
    }

    #[test]
    fn test_read_write_page() {
        let (_temp_dir, mut manager, handle) = setup_test_dir();

        let mut write_buffer = vec![0u8; PAGE_SIZE];
        write_buffer[0] = 42;
        write_buffer[100] = 99;
        write_buffer[PAGE_SIZE - 1] = 255;
        manager.write_page(handle, 3, &write_buffer).unwrap();

        let mut read_buffer = vec![0u8; PAGE_SIZE];
        manager.read_page(handle, 3, &mut read_buffer).unwrap();
        assert_eq!(read_buffer, write_buffer);
    }

    #[test]
    fn test_read_nonexistent_page() {
        let (_temp_dir, mut manager, handle) = setup_test_dir();

        // Reading a page that doesn't exist should return zeros
        let mut buffer = vec![7u8; PAGE_SIZE];
        manager.read_page(handle, 100, &mut buffer).unwrap();
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_checksum_mismatch() {
        let (temp_dir, mut manager, handle) = setup_test_dir();
        manager.write_page(handle, 0, &vec![1u8; PAGE_SIZE]).unwrap();

        let path = temp_dir.path().join("t1").join("pages").join("0.page");
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let mut buffer = vec![0u8; PAGE_SIZE];
        let result = manager.read_page(handle, 0, &mut buffer);
        assert!(matches!(result, Err(FileError::PageChecksumMismatch { page: 0, .. })));
    }

    #[test]
    fn test_page_numbers_and_remove() {
        let (_temp_dir, mut manager, handle) = setup_test_dir();
        let buffer = vec![0u8; PAGE_SIZE];
        for page in [4, 0, 2] {
            manager.write_page(handle, page, &buffer).unwrap();
        }
        assert_eq!(manager.page_numbers(handle).unwrap(), vec![0, 2, 4]);

        manager.remove_page(handle, 2).unwrap();
        manager.remove_page(handle, 2).unwrap();
        assert_eq!(manager.page_numbers(handle).unwrap(), vec![0, 4]);
        manager.sync_all().unwrap();
    }

    #[test]
    fn test_remove_file() {
        let (temp_dir, mut manager, handle) = setup_test_dir();
        manager.write_page(handle, 0, &vec![0u8; PAGE_SIZE]).unwrap();

        manager.remove_file(handle).unwrap();
        assert!(!manager.is_file_open(handle));
        assert!(!temp_dir.path().join("t1").join("pages").exists());
    }

    #[test]
    fn test_invalid_buffer_size() {
        let (_temp_dir, mut manager, handle) = setup_test_dir();

        let mut small_buffer = vec![0u8; PAGE_SIZE - 1];
        let result = manager.read_page(handle, 0, &mut small_buffer);
        assert!(matches!(result, Err(FileError::InvalidPageSize { .. })));

        let large_buffer = vec![0u8; PAGE_SIZE + 1];
        let result = manager.write_page(handle, 0, &large_buffer);
        assert!(matches!(result, Err(FileError::InvalidPageSize { .. })));
    }

    #[test]
    fn test_unknown_handle() {
        let (_temp_dir, mut manager, _handle) = setup_test_dir();
        let mut buffer = vec![0u8; PAGE_SIZE];
        let result = manager.read_page(FileHandle::new(9), 0, &mut buffer);
        assert!(matches!(result, Err(FileError::UnknownFile(9))));
    }
}
