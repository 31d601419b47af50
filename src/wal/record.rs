use serde::{Deserialize, Serialize};

use crate::record::{BaseLoc, Lsn, PageNo, RecordAddr, Rid, TableId, Timestamp, TxnId};

/// A change to one record, with enough detail to redo or undo it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    /// A new base record at `loc`; `page` is the data page the location
    /// resolved to when the record was written
    Insert {
        table: TableId,
        rid: Rid,
        loc: BaseLoc,
        page: PageNo,
        values: Vec<i64>,
    },
    /// A tail record overriding the columns set in `schema`
    Modify {
        table: TableId,
        rid: Rid,
        range: u32,
        tail: RecordAddr,
        prev: RecordAddr,
        schema: u64,
        values: Vec<Option<i64>>,
    },
    /// A tombstone tail
    Delete {
        table: TableId,
        rid: Rid,
        range: u32,
        tail: RecordAddr,
        prev: RecordAddr,
    },
}

impl UpdateOp {
    pub fn table(&self) -> TableId {
        match self {
            UpdateOp::Insert { table, .. }
            | UpdateOp::Modify { table, .. }
            | UpdateOp::Delete { table, .. } => *table,
        }
    }

    pub fn rid(&self) -> Rid {
        match self {
            UpdateOp::Insert { rid, .. }
            | UpdateOp::Modify { rid, .. }
            | UpdateOp::Delete { rid, .. } => *rid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogBody {
    Begin,
    Update(UpdateOp),
    Commit {
        commit_ts: Timestamp,
    },
    Abort,
    /// Written after every dirty page has been flushed
    Checkpoint {
        clock: Timestamp,
        next_txn: TxnId,
        /// Transactions running at the checkpoint, with their first LSN
        active: Vec<(TxnId, Lsn)>,
    },
}

impl LogBody {
    /// Records that must be on disk before `append` returns, whatever the sync mode
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LogBody::Commit { .. } | LogBody::Abort | LogBody::Checkpoint { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub txn: TxnId,
    pub body: LogBody,
}

impl LogRecord {
    pub fn new(txn: TxnId, body: LogBody) -> Self {
        Self { txn, body }
    }
}
