use ahash::AHashMap;
use std::sync::Arc;

use super::Engine;
use super::merger::MergeTask;
use crate::error::{DbError, DbResult};
use crate::lock::{LockKey, LockMode};
use crate::record::{BaseLoc, Lsn, Rid, Snapshot, TableId, Timestamp, TxnId};
use crate::table::{Table, TailWrite};
use crate::txn::TxnState;
use crate::wal::{LogBody, LogRecord, UpdateOp};

/// One change made by a transaction, kept until commit or abort
pub(crate) enum WriteEntry {
    Insert {
        table: Arc<Table>,
        rid: Rid,
        loc: BaseLoc,
        key: i64,
        lsn: Lsn,
    },
    Update {
        table: Arc<Table>,
        rid: Rid,
        write: TailWrite,
        /// Old and new key when the update changed the key column
        moved: Option<(i64, i64)>,
    },
    Delete {
        table: Arc<Table>,
        rid: Rid,
        write: TailWrite,
        key: i64,
    },
}

/// A running transaction.
///
/// Reads take shared record locks and writes exclusive ones, all held until
/// [`Engine::commit`] or [`Engine::abort`]. A lock conflict fails the
/// operation and leaves the transaction active; the caller is expected to
/// abort it. Dropping an active transaction aborts it.
pub struct Transaction {
    id: TxnId,
    start_ts: Timestamp,
    commit_ts: Option<Timestamp>,
    state: TxnState,
    /// Whether a Begin record was logged
    begun: bool,
    writes: Vec<WriteEntry>,
    engine: Arc<Engine>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, start_ts: Timestamp, engine: Arc<Engine>) -> Self {
        Self {
            id,
            start_ts,
            commit_ts: None,
            state: TxnState::Active,
            begun: false,
            writes: Vec::new(),
            engine,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Commit timestamp of the newest transaction this one's snapshot includes
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Timestamp the transaction committed at, if it wrote anything and committed
    pub fn commit_ts(&self) -> Option<Timestamp> {
        self.commit_ts
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Number of changes made so far
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxnState::Active || self.engine.is_closed() {
            return;
        }
        tracing::warn!(txn = self.id, "transaction dropped while active, aborting");
        let engine = Arc::clone(&self.engine);
        if let Err(e) = engine.abort(self) {
            tracing::warn!(txn = self.id, error = %e, "abort of dropped transaction failed");
        }
    }
}

impl Engine {
    fn ensure_active(&self, txn: &Transaction) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        if txn.state.is_terminal() {
            return Err(DbError::TransactionAlreadyTerminated(txn.id));
        }
        Ok(())
    }

    fn lock(&self, txn: &Transaction, table: &Table, rid: Rid, mode: LockMode) -> DbResult<()> {
        let key = LockKey {
            table: table.id(),
            rid,
        };
        self.locks.acquire(txn.id, key, mode).map_err(|conflict| {
            tracing::debug!(txn = txn.id, table = %table.name(), rid, %mode, "lock conflict");
            DbError::LockConflict(conflict)
        })
    }

    /// Append an update record, logging Begin first for a transaction's first write
    fn log_update(&self, txn: TxnId, begun: &mut bool, op: &UpdateOp) -> DbResult<Lsn> {
        if !*begun {
            let lsn = self.log.append(&LogRecord::new(txn, LogBody::Begin))?;
            self.txns.note_first_lsn(txn, lsn);
            *begun = true;
        }
        Ok(self
            .log
            .append(&LogRecord::new(txn, LogBody::Update(op.clone())))?)
    }

    /// Insert a record, returning its RID
    pub fn insert(&self, txn: &mut Transaction, table: &Arc<Table>, values: &[i64]) -> DbResult<Rid> {
        let _quiesce = self.quiesce.read();
        self.ensure_active(txn)?;
        table.check_width(values.len())?;

        let rid = table.next_rid();
        let key = values[table.key_column()];
        table.index().notify_insert(key, rid)?;
        if let Err(e) = self.lock(txn, table, rid, LockMode::Exclusive) {
            table.index().notify_delete(key, rid);
            return Err(e);
        }

        let txn_id = txn.id;
        let begun = &mut txn.begun;
        match table.insert(txn_id, rid, values, |op| self.log_update(txn_id, begun, op)) {
            Ok((loc, lsn)) => {
                txn.writes.push(WriteEntry::Insert {
                    table: Arc::clone(table),
                    rid,
                    loc,
                    key,
                    lsn,
                });
                Ok(rid)
            }
            Err(e) => {
                table.index().notify_delete(key, rid);
                Err(e)
            }
        }
    }

    /// Read the latest committed version of `columns`, plus this transaction's own writes
    pub fn read(
        &self,
        txn: &mut Transaction,
        table: &Table,
        rid: Rid,
        columns: &[usize],
    ) -> DbResult<Vec<i64>> {
        self.read_version(txn, table, rid, columns, 0)
    }

    /// Read an older version: `0` is the latest, `-1` the one before it, and
    /// so on, stopping at the oldest retained version
    pub fn read_version(
        &self,
        txn: &mut Transaction,
        table: &Table,
        rid: Rid,
        columns: &[usize],
        relative_version: i64,
    ) -> DbResult<Vec<i64>> {
        let _quiesce = self.quiesce.read();
        self.ensure_active(txn)?;
        self.lock(txn, table, rid, LockMode::Shared)?;
        let skip = if relative_version < 0 {
            relative_version.unsigned_abs() as usize
        } else {
            0
        };
        table.read_version(rid, columns, Snapshot::latest_for(txn.id), skip)
    }

    /// Read as of the transaction's start without taking locks
    pub fn snapshot_read(
        &self,
        txn: &Transaction,
        table: &Table,
        rid: Rid,
        columns: &[usize],
    ) -> DbResult<Vec<i64>> {
        let _quiesce = self.quiesce.read();
        self.ensure_active(txn)?;
        let snap = Snapshot {
            ts: txn.start_ts,
            txn: Some(txn.id),
        };
        table.read(rid, columns, snap)
    }

    /// Read the committed state as of commit timestamp `ts`, outside any transaction
    pub fn read_as_of(
        &self,
        table: &Table,
        rid: Rid,
        columns: &[usize],
        ts: Timestamp,
    ) -> DbResult<Vec<i64>> {
        let _quiesce = self.quiesce.read();
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        table.read(rid, columns, Snapshot::as_of(ts))
    }

    /// Overwrite the `Some` columns of a record
    pub fn update(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        rid: Rid,
        values: &[Option<i64>],
    ) -> DbResult<()> {
        let _quiesce = self.quiesce.read();
        self.ensure_active(txn)?;
        table.check_width(values.len())?;
        self.lock(txn, table, rid, LockMode::Exclusive)?;

        let own = Snapshot::latest_for(txn.id);
        let key_column = table.key_column();
        let current_key = table.read(rid, &[key_column], own)?[0];
        if values.iter().all(Option::is_none) {
            return Ok(());
        }

        let moved = match values[key_column] {
            Some(new_key) if new_key != current_key => {
                table.index().notify_insert(new_key, rid)?;
                Some((current_key, new_key))
            }
            _ => None,
        };

        let txn_id = txn.id;
        let begun = &mut txn.begun;
        match table.update(txn_id, rid, values, |op| self.log_update(txn_id, begun, op)) {
            Ok(write) => {
                txn.writes.push(WriteEntry::Update {
                    table: Arc::clone(table),
                    rid,
                    write,
                    moved,
                });
                Ok(())
            }
            Err(e) => {
                if let Some((_, new_key)) = moved {
                    table.index().notify_delete(new_key, rid);
                }
                Err(e)
            }
        }
    }

    /// Delete a record. Its key is released when the transaction commits.
    pub fn delete(&self, txn: &mut Transaction, table: &Arc<Table>, rid: Rid) -> DbResult<()> {
        let _quiesce = self.quiesce.read();
        self.ensure_active(txn)?;
        self.lock(txn, table, rid, LockMode::Exclusive)?;

        let key = table.read(rid, &[table.key_column()], Snapshot::latest_for(txn.id))?[0];
        let txn_id = txn.id;
        let begun = &mut txn.begun;
        let write = table.delete(txn_id, rid, |op| self.log_update(txn_id, begun, op))?;
        txn.writes.push(WriteEntry::Delete {
            table: Arc::clone(table),
            rid,
            write,
            key,
        });
        Ok(())
    }

    /// Make the transaction's writes durable and visible.
    ///
    /// If the commit record cannot be logged the transaction is rolled back
    /// and [`DbError::Durability`] is returned.
    pub fn commit(&self, txn: &mut Transaction) -> DbResult<()> {
        let quiesce = self.quiesce.read();
        self.ensure_active(txn)?;

        if txn.writes.is_empty() {
            self.finish(txn, TxnState::Committed);
            tracing::debug!(txn = txn.id, "committed read-only transaction");
            return Ok(());
        }

        let commit_ts = self.txns.next_commit_ts(txn.id);
        let commit = LogRecord::new(txn.id, LogBody::Commit { commit_ts });
        let lsn = match self.log.append(&commit) {
            Ok(lsn) => lsn,
            Err(source) => {
                tracing::warn!(txn = txn.id, error = %source, "commit record not durable, rolling back");
                self.rollback(txn);
                return Err(DbError::Durability {
                    txn: txn.id,
                    source,
                });
            }
        };

        for entry in &txn.writes {
            let stamped = match entry {
                WriteEntry::Insert {
                    table, rid, loc, ..
                } => table.stamp_base(*rid, *loc, commit_ts, lsn),
                WriteEntry::Update { table, write, .. } | WriteEntry::Delete { table, write, .. } => {
                    table.stamp_tail(write.tail, commit_ts, lsn)
                }
            };
            // the commit is durable; recovery restores whatever is missed here
            if let Err(e) = stamped {
                tracing::error!(txn = txn.id, error = %e, "failed to stamp committed record");
            }
        }

        let mut updated: AHashMap<(TableId, u32), (Arc<Table>, u64)> = AHashMap::new();
        for entry in &txn.writes {
            match entry {
                WriteEntry::Insert { .. } => {}
                WriteEntry::Update {
                    table, rid, write, moved,
                } => {
                    if let Some((old_key, _)) = moved {
                        table.index().notify_delete(*old_key, *rid);
                    }
                    updated
                        .entry((table.id(), write.range))
                        .or_insert_with(|| (Arc::clone(table), 0))
                        .1 += 1;
                }
                WriteEntry::Delete {
                    table, rid, write, key,
                } => {
                    table.index().notify_delete(*key, *rid);
                    updated
                        .entry((table.id(), write.range))
                        .or_insert_with(|| (Arc::clone(table), 0))
                        .1 += 1;
                }
            }
        }

        txn.commit_ts = Some(commit_ts);
        self.finish(txn, TxnState::Committed);
        drop(quiesce);
        self.txns.wait_visible(commit_ts);
        tracing::debug!(txn = txn.id, commit_ts, lsn, "committed");

        for ((table_id, range_id), (table, count)) in updated {
            let Some(range) = table.range(range_id) else {
                continue;
            };
            if range.note_updates(count) > self.config.merge_threshold && range.try_begin_merge() {
                let task = MergeTask {
                    table: table_id,
                    range: range_id,
                };
                if !self.submit_merge(task) {
                    range.end_merge(false);
                }
            }
        }
        Ok(())
    }

    /// Undo the transaction's writes and release its locks
    pub fn abort(&self, txn: &mut Transaction) -> DbResult<()> {
        let _quiesce = self.quiesce.read();
        if txn.state.is_terminal() {
            return Err(DbError::TransactionAlreadyTerminated(txn.id));
        }
        self.rollback(txn);
        Ok(())
    }

    fn rollback(&self, txn: &mut Transaction) {
        for entry in txn.writes.drain(..).rev() {
            let undone = match &entry {
                WriteEntry::Insert {
                    table,
                    rid,
                    loc,
                    key,
                    lsn,
                } => {
                    table.index().notify_delete(*key, *rid);
                    table.undo_insert(*rid, *loc, *lsn)
                }
                WriteEntry::Update {
                    table,
                    rid,
                    write,
                    moved,
                } => {
                    if let Some((_, new_key)) = moved {
                        table.index().notify_delete(*new_key, *rid);
                    }
                    table.undo_tail(*rid, write.tail, write.prev, false, write.lsn)
                }
                WriteEntry::Delete {
                    table, rid, write, ..
                } => table.undo_tail(*rid, write.tail, write.prev, true, write.lsn),
            };
            // left for recovery, which undoes the same change again
            if let Err(e) = undone {
                tracing::error!(txn = txn.id, error = %e, "failed to undo change");
            }
        }

        if txn.begun {
            if let Err(e) = self.log.append(&LogRecord::new(txn.id, LogBody::Abort)) {
                tracing::warn!(txn = txn.id, error = %e, "abort record not logged");
            }
        }
        self.finish(txn, TxnState::Aborted);
        tracing::debug!(txn = txn.id, "aborted");
    }

    fn finish(&self, txn: &mut Transaction, state: TxnState) {
        self.txns.finish(txn.id);
        self.locks.release_all(txn.id);
        txn.writes.clear();
        txn.state = state;
    }
}
