use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::record::LogRecord;
use super::{LogError, LogResult};
use crate::config::SyncMode;
use crate::failpoint;
use crate::file::LogFlusher;
use crate::record::Lsn;

const LOG_MAGIC: &[u8; 4] = b"LSTW";
const LOG_VERSION: u32 = 1;
/// Magic plus format version; the first record starts here
pub const LOG_HEADER_LEN: u64 = 8;
/// `[len: u32][crc32: u32]` before every payload
const FRAME_HEADER_LEN: usize = 8;

struct LogWriter {
    file: File,
    /// Bytes handed to the OS
    written: u64,
    /// Bytes known to be on stable storage
    durable: u64,
    /// Framed records not written yet
    pending: Vec<u8>,
}

impl LogWriter {
    fn end(&self) -> u64 {
        self.written + self.pending.len() as u64
    }

    /// Write pending frames and fsync them
    fn force(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.file.seek(SeekFrom::Start(self.written))?;
            if let Err(e) = self.file.write_all(&self.pending) {
                // drop any partial frame; pending stays queued for the next force
                let _ = self.file.set_len(self.written);
                return Err(e);
            }
            self.written += self.pending.len() as u64;
            self.pending.clear();
        }

        if self.durable < self.written {
            self.file.sync_data()?;
            self.durable = self.written;
        }
        Ok(())
    }
}

/// Append-only log shared by every table of a database.
///
/// The LSN of a record is the byte offset of its frame. Frames are
/// `[len][crc32][json payload]`; a frame cut short by a crash is dropped when
/// the log is opened, any other damage is reported as corruption.
pub struct LogManager {
    path: PathBuf,
    sync_mode: SyncMode,
    writer: Mutex<LogWriter>,
}

impl LogManager {
    /// Open or create the log at `path`, returning every intact record
    pub fn open<P: AsRef<Path>>(
        path: P,
        sync_mode: SyncMode,
    ) -> LogResult<(Self, Vec<(Lsn, LogRecord)>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (records, valid_end) = if (bytes.len() as u64) < LOG_HEADER_LEN {
            if !header().starts_with(&bytes) {
                return Err(corruption(0, "log header is damaged"));
            }
            // empty, or the header itself was torn while creating the log
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header())?;
            file.sync_all()?;
            (Vec::new(), LOG_HEADER_LEN)
        } else {
            check_header(&bytes)?;
            let (records, valid_end) = parse_frames(&bytes)?;
            if valid_end < bytes.len() as u64 {
                tracing::warn!(
                    path = %path.display(),
                    lsn = valid_end,
                    dropped = bytes.len() as u64 - valid_end,
                    "truncating torn log tail"
                );
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            (records, valid_end)
        };

        let manager = Self {
            path,
            sync_mode,
            writer: Mutex::new(LogWriter {
                file,
                written: valid_end,
                durable: valid_end,
                pending: Vec::new(),
            }),
        };
        Ok((manager, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and return its LSN.
    ///
    /// In [`SyncMode::Every`], and for commit, abort and checkpoint records,
    /// the record is on stable storage when this returns.
    pub fn append(&self, record: &LogRecord) -> LogResult<Lsn> {
        failpoint::maybe_fail(failpoint::WAL_APPEND)?;
        let payload = serde_json::to_vec(record)?;

        let mut writer = self.writer.lock();
        let lsn = writer.end();
        writer
            .pending
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        writer
            .pending
            .extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        writer.pending.extend_from_slice(&payload);

        if self.sync_mode == SyncMode::Every || record.body.is_terminal() {
            if let Err(e) = writer.force() {
                // the record was never durable; take it back out of the queue
                if let Some(keep) = lsn.checked_sub(writer.written) {
                    writer.pending.truncate(keep as usize);
                }
                return Err(e.into());
            }
        }
        Ok(lsn)
    }

    /// Make every record up to and including the one at `lsn` durable
    pub fn flush_to(&self, lsn: Lsn) -> LogResult<()> {
        let mut writer = self.writer.lock();
        if lsn < writer.durable {
            return Ok(());
        }
        writer.force()?;
        Ok(())
    }

    /// Make every appended record durable
    pub fn flush(&self) -> LogResult<()> {
        self.writer.lock().force()?;
        Ok(())
    }

    /// LSN the next record will get
    pub fn end_lsn(&self) -> Lsn {
        self.writer.lock().end()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.writer.lock().durable
    }
}

impl LogFlusher for LogManager {
    fn flush_to(&self, lsn: u64) -> io::Result<()> {
        LogManager::flush_to(self, lsn).map_err(|e| match e {
            LogError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        })
    }
}

fn header() -> [u8; LOG_HEADER_LEN as usize] {
    let mut header = [0u8; LOG_HEADER_LEN as usize];
    header[..4].copy_from_slice(LOG_MAGIC);
    header[4..].copy_from_slice(&LOG_VERSION.to_le_bytes());
    header
}

fn corruption(lsn: Lsn, reason: impl Into<String>) -> LogError {
    LogError::RecoveryLogCorruption {
        lsn,
        reason: reason.into(),
    }
}

fn check_header(bytes: &[u8]) -> LogResult<()> {
    if &bytes[..4] != LOG_MAGIC {
        return Err(corruption(0, "bad magic"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != LOG_VERSION {
        return Err(corruption(0, format!("unsupported log version {version}")));
    }
    Ok(())
}

/// Decode frames after the header. Returns the records and the end of the
/// last intact frame; only the final frame may be torn.
fn parse_frames(bytes: &[u8]) -> LogResult<(Vec<(Lsn, LogRecord)>, u64)> {
    let mut records = Vec::new();
    let mut offset = LOG_HEADER_LEN as usize;

    while offset < bytes.len() {
        let rest = bytes.len() - offset;
        if rest < FRAME_HEADER_LEN {
            break;
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(word) as usize;
        word.copy_from_slice(&bytes[offset + 4..offset + 8]);
        let crc = u32::from_le_bytes(word);

        if rest - FRAME_HEADER_LEN < len {
            break;
        }

        let end = offset + FRAME_HEADER_LEN + len;
        let payload = &bytes[offset + FRAME_HEADER_LEN..end];
        if crc32fast::hash(payload) != crc {
            if end == bytes.len() {
                break;
            }
            return Err(corruption(offset as Lsn, "checksum mismatch"));
        }

        let record: LogRecord = serde_json::from_slice(payload)
            .map_err(|e| corruption(offset as Lsn, format!("undecodable record: {e}")))?;
        records.push((offset as Lsn, record));
        offset = end;
    }

    Ok((records, offset as u64))
}
