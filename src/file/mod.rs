mod buffer_pool;
mod error;
mod file_manager;

pub use buffer_pool::{BufferPool, LogFlusher, PageKey, PinnedPage};
pub use error::{FileError, FileResult};
pub use file_manager::{FileHandle, PagedFileManager};

/// Page number within one table's page space
pub type PageNo = u32;

/// Size of the CRC-32 trailer stored after each page on disk
pub const PAGE_TRAILER: usize = 4;
