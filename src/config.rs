use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{DbError, DbResult};
use crate::record::META_COLUMNS;

/// Largest page the engine accepts; slot numbers must fit in 16 bits.
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// When the log forces appended records to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every append
    #[default]
    Every,
    /// fsync on commit, abort and checkpoint records, or when a page flush needs it
    Commit,
}

/// Engine tuning knobs.
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```json
/// { "buffer_pool_pages": 64, "merge_threshold": 500 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size in bytes
    pub page_size: usize,
    /// Bytes per user column value (1..=8)
    pub column_width: usize,
    /// Number of frames in the buffer pool
    pub buffer_pool_pages: usize,
    /// Committed updates in a page range before a merge is scheduled
    pub merge_threshold: u64,
    /// Base pages per page range
    pub pages_per_range: usize,
    /// Log durability policy
    pub sync_mode: SyncMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            column_width: 8,
            buffer_pool_pages: 1000,
            merge_threshold: 2000,
            pages_per_range: 16,
            sync_mode: SyncMode::Every,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| DbError::InvalidConfig(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        let min_page = 8 * META_COLUMNS;
        if self.page_size < min_page || self.page_size > MAX_PAGE_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "page_size must be within {min_page}..={MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if !(1..=8).contains(&self.column_width) {
            return Err(DbError::InvalidConfig(format!(
                "column_width must be within 1..=8, got {}",
                self.column_width
            )));
        }
        // a base pair and a tail pair are pinned together during an update
        if self.buffer_pool_pages < 8 {
            return Err(DbError::InvalidConfig(format!(
                "buffer_pool_pages must be at least 8, got {}",
                self.buffer_pool_pages
            )));
        }
        if self.pages_per_range == 0 {
            return Err(DbError::InvalidConfig(
                "pages_per_range must be positive".to_string(),
            ));
        }
        if self.merge_threshold == 0 {
            return Err(DbError::InvalidConfig(
                "merge_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
