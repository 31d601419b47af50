//! Record identifiers, addresses and the physical page layout.

mod layout;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::file::PageNo;
pub use layout::PageLayout;

/// Logical record identifier, stable for the life of the record
pub type Rid = u64;
pub type TxnId = u64;
/// Logical commit clock value
pub type Timestamp = u64;
/// Log sequence number: byte offset of a record in the log file
pub type Lsn = u64;
pub type TableId = u32;

/// Metadata columns stored in every meta page
pub const META_COLUMNS: usize = 5;
pub const INDIRECTION_COLUMN: usize = 0;
pub const RID_COLUMN: usize = 1;
pub const TIMESTAMP_COLUMN: usize = 2;
pub const SCHEMA_ENCODING_COLUMN: usize = 3;
pub const TXN_COLUMN: usize = 4;

/// Timestamp of an entry whose writer has not committed yet
pub const UNCOMMITTED: Timestamp = u64::MAX;
/// Timestamp of an entry rolled back by its writer
pub const ABORTED: Timestamp = u64::MAX - 1;

/// Schema bit: on a tail, the tail is a delete; on a base, a delete is pending or committed
pub const TOMBSTONE: u64 = 1 << 63;
/// Schema bit on a base whose delete was folded by a merge
pub const FOLDED_DELETE: u64 = 1 << 62;
/// Bits available for user columns in the schema encoding
pub const MAX_COLUMNS: usize = 62;
pub const COLUMN_BITS: u64 = (1 << MAX_COLUMNS) - 1;

const TAIL_FLAG: u64 = 1 << 63;

/// Physical address of a base or tail record: data page number plus slot.
///
/// Used for indirection pointers and tail back-pointers. Any base-tagged
/// address ends a version chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordAddr(u64);

impl RecordAddr {
    pub fn base(page: PageNo, slot: u16) -> Self {
        Self(((page as u64) << 16) | slot as u64)
    }

    pub fn tail(page: PageNo, slot: u16) -> Self {
        Self(TAIL_FLAG | ((page as u64) << 16) | slot as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_tail(&self) -> bool {
        self.0 & TAIL_FLAG != 0
    }

    pub fn page(&self) -> PageNo {
        ((self.0 & !TAIL_FLAG) >> 16) as PageNo
    }

    pub fn slot(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Debug for RecordAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_tail() { "tail" } else { "base" };
        write!(f, "{kind}({}:{})", self.page(), self.slot())
    }
}

impl fmt::Display for RecordAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Logical location of a base record: range, base page index within the
/// range, and slot. A merge swaps the range's page list, so locations stay
/// valid across merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseLoc {
    pub range: u32,
    pub page_index: u32,
    pub slot: u16,
}

/// The five metadata columns of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub indirection: RecordAddr,
    pub rid: Rid,
    pub timestamp: Timestamp,
    pub schema: u64,
    pub txn: TxnId,
}

impl RecordMeta {
    pub fn is_committed(&self) -> bool {
        self.timestamp != 0 && self.timestamp < ABORTED
    }
}

/// What a read is allowed to see.
///
/// Committed entries with a timestamp at or below `ts` are visible, and so
/// are uncommitted entries written by `txn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub ts: Timestamp,
    pub txn: Option<TxnId>,
}

impl Snapshot {
    /// Everything committed so far
    pub fn latest() -> Self {
        Self {
            ts: ABORTED - 1,
            txn: None,
        }
    }

    /// Committed state as of `ts`
    pub fn as_of(ts: Timestamp) -> Self {
        Self { ts, txn: None }
    }

    /// Everything committed plus the uncommitted writes of `txn`
    pub fn latest_for(txn: TxnId) -> Self {
        Self {
            ts: ABORTED - 1,
            txn: Some(txn),
        }
    }

    pub fn sees(&self, meta: &RecordMeta) -> bool {
        match meta.timestamp {
            0 | ABORTED => false,
            UNCOMMITTED => self.txn == Some(meta.txn),
            ts => ts <= self.ts,
        }
    }
}
