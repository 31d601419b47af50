use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::DbResult;
use crate::record::{BaseLoc, PageNo, Rid, Timestamp};

const DIRECTORY_FILE: &str = "directory.json";

/// Page list of one range as of the last checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct RangeFile {
    pub base: Vec<PageNo>,
    pub tails: Vec<PageNo>,
    pub merged_ts: Timestamp,
    /// Tail page receiving new records and its next free slot
    pub open_tail: Option<(PageNo, u16)>,
}

/// Everything needed to reopen a table without replaying the log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct DirectoryFile {
    pub next_rid: Rid,
    pub next_page: PageNo,
    /// Next free base slot
    pub insert_cursor: Option<BaseLoc>,
    pub ranges: Vec<RangeFile>,
    pub entries: Vec<(Rid, BaseLoc)>,
}

impl DirectoryFile {
    pub fn load(dir: &Path) -> DbResult<Option<Self>> {
        match fs::read_to_string(dir.join(DIRECTORY_FILE)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the directory file atomically
    pub fn store(&self, dir: &Path) -> DbResult<()> {
        let tmp_path = dir.join(format!("{DIRECTORY_FILE}.tmp"));
        let mut file = File::create(&tmp_path)?;
        file.write_all(&serde_json::to_vec(self)?)?;
        file.sync_all()?;
        fs::rename(&tmp_path, dir.join(DIRECTORY_FILE))?;
        Ok(())
    }
}
