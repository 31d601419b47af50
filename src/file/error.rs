use std::io;
use thiserror::Error;

use super::PageNo;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File already registered: {0}")]
    FileAlreadyExists(String),

    #[error("Unknown file handle: {0}")]
    UnknownFile(u32),

    #[error("Every frame of the buffer pool is pinned (capacity {capacity})")]
    BufferPoolExhausted { capacity: usize },

    #[error("Page checksum mismatch: page {page} in {path}")]
    PageChecksumMismatch { page: PageNo, path: String },

    #[error("Invalid page size: expected {expected}, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Log flush failed before page write-back: {0}")]
    LogFlush(io::Error),
}

pub type FileResult<T> = Result<T, FileError>;
