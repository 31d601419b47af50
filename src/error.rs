use std::io;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::file::FileError;
use crate::lock::LockConflict;
use crate::record::{Rid, TxnId};
use crate::wal::LogError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Lock conflict: {0}")]
    LockConflict(#[from] LockConflict),

    #[error("Record not found: rid={0}")]
    RecordNotFound(Rid),

    #[error("No record with key {0}")]
    KeyNotFound(i64),

    #[error("Duplicate key: {0}")]
    DuplicateKey(i64),

    #[error("Column {column} of key {key} would overflow")]
    ValueOverflow { key: i64, column: usize },

    #[error("Transaction {0} already terminated")]
    TransactionAlreadyTerminated(TxnId),

    #[error("Commit of transaction {txn} is not durable: {source}")]
    Durability {
        txn: TxnId,
        #[source]
        source: LogError,
    },

    #[error("Schema mismatch: expected {expected} columns, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("Column {column} out of range for a table with {num_columns} columns")]
    InvalidColumn { column: usize, num_columns: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Directory file is malformed: {0}")]
    Directory(#[from] serde_json::Error),

    #[error("Database is closed")]
    Closed,
}

impl DbError {
    /// Whether running the same transaction again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::LockConflict(_) | DbError::File(FileError::BufferPoolExhausted { .. })
        )
    }
}

pub type DbResult<T> = Result<T, DbError>;
