//! Write-ahead log, checkpoints and crash recovery.

mod log_manager;
mod record;
mod recovery;

use std::io;
use thiserror::Error;

use crate::record::Lsn;

pub use log_manager::{LOG_HEADER_LEN, LogManager};
pub use record::{LogBody, LogRecord, UpdateOp};
pub use recovery::{CheckpointFile, Recovery, RecoveryPhase, RecoveryReport, RecoveryTarget};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot encode log record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Recovery log is corrupt at lsn {lsn}: {reason}")]
    RecoveryLogCorruption { lsn: Lsn, reason: String },
}

pub type LogResult<T> = Result<T, LogError>;
