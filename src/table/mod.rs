//! Tables of base and tail records.
//!
//! A record is written once into a base page; every later change appends a
//! tail record to its page range and links it into the record's version
//! chain through the base's indirection column. Readers resolve the columns
//! they need by walking the chain from newest to oldest.

mod directory;
mod merge;
mod range;

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::catalog::TableMetadata;
use crate::config::EngineConfig;
use crate::error::{DbError, DbResult};
use crate::file::{BufferPool, FileHandle};
use crate::index::PrimaryIndex;
use crate::record::{
    ABORTED, BaseLoc, FOLDED_DELETE, Lsn, PageLayout, PageNo, RecordAddr, RecordMeta, Rid,
    Snapshot, TOMBSTONE, TableId, Timestamp, TxnId, UNCOMMITTED,
};
use crate::wal::UpdateOp;

use directory::{DirectoryFile, RangeFile};
pub use merge::MergeOutcome;
pub use range::{PageRange, RangePages};

/// Stand-in for a base page whose number was never logged. Replaced by
/// [`Table::finish_recovery`].
const UNALLOCATED: PageNo = PageNo::MAX - 1;

/// Where an update or delete put its tail record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailWrite {
    pub range: u32,
    pub tail: RecordAddr,
    /// Chain head the tail points back to
    pub prev: RecordAddr,
    pub lsn: Lsn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub records: usize,
    pub keys: usize,
    pub ranges: usize,
    pub base_pages: usize,
    pub tail_pages: usize,
}

pub struct Table {
    meta: TableMetadata,
    file: FileHandle,
    layout: PageLayout,
    pool: Arc<BufferPool>,
    pages_per_range: usize,
    dir: PathBuf,
    ranges: RwLock<Vec<Arc<PageRange>>>,
    directory: RwLock<AHashMap<Rid, BaseLoc>>,
    insert_cursor: Mutex<Option<BaseLoc>>,
    next_rid: AtomicU64,
    next_page: AtomicU32,
    index: PrimaryIndex,
}

impl Table {
    /// Open the table stored under `dir`, restoring its directory if one was
    /// checkpointed
    pub fn open(
        meta: TableMetadata,
        dir: &Path,
        pool: Arc<BufferPool>,
        config: &EngineConfig,
    ) -> DbResult<Self> {
        let layout = PageLayout::new(config.page_size, config.column_width, meta.num_columns)?;
        if meta.key_column >= meta.num_columns {
            return Err(DbError::InvalidColumn {
                column: meta.key_column,
                num_columns: meta.num_columns,
            });
        }

        let file = FileHandle::new(meta.id);
        pool.register_file(file, dir)?;

        let table = Self {
            meta,
            file,
            layout,
            pool,
            pages_per_range: config.pages_per_range,
            dir: dir.to_path_buf(),
            ranges: RwLock::new(Vec::new()),
            directory: RwLock::new(AHashMap::new()),
            insert_cursor: Mutex::new(None),
            next_rid: AtomicU64::new(1),
            next_page: AtomicU32::new(0),
            index: PrimaryIndex::new(),
        };
        if let Some(state) = DirectoryFile::load(dir)? {
            table.restore(state);
        }
        Ok(table)
    }

    fn restore(&self, state: DirectoryFile) {
        let ranges = state
            .ranges
            .into_iter()
            .enumerate()
            .map(|(id, range)| {
                let cursor = range::TailCursor {
                    page: range.open_tail.map(|(page, _)| page),
                    next_slot: range.open_tail.map_or(0, |(_, slot)| slot),
                };
                let pages = RangePages {
                    base: range.base,
                    merged_ts: range.merged_ts,
                };
                Arc::new(PageRange::from_parts(id as u32, pages, range.tails, cursor))
            })
            .collect();

        *self.ranges.write() = ranges;
        *self.directory.write() = state.entries.into_iter().collect();
        *self.insert_cursor.lock() = state.insert_cursor;
        self.next_rid.store(state.next_rid.max(1), Ordering::Release);
        self.next_page.store(state.next_page, Ordering::Release);
    }

    /// Write the directory so the table can be reopened from its pages alone.
    ///
    /// Only consistent while no record operation is running.
    pub fn persist(&self) -> DbResult<()> {
        let ranges = self.ranges.read().clone();
        let mut entries: Vec<(Rid, BaseLoc)> = self
            .directory
            .read()
            .iter()
            .map(|(rid, loc)| (*rid, *loc))
            .collect();
        entries.sort_unstable_by_key(|(rid, _)| *rid);

        let state = DirectoryFile {
            next_rid: self.next_rid.load(Ordering::Acquire),
            next_page: self.next_page.load(Ordering::Acquire),
            insert_cursor: *self.insert_cursor.lock(),
            ranges: ranges
                .iter()
                .map(|range| {
                    let pages = range.read();
                    let cursor = range.tail_cursor();
                    RangeFile {
                        base: pages.base.clone(),
                        tails: range.tail_pages(),
                        merged_ts: pages.merged_ts,
                        open_tail: cursor.page.map(|page| (page, cursor.next_slot)),
                    }
                })
                .collect(),
            entries,
        };
        state.store(&self.dir)
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn id(&self) -> TableId {
        self.meta.id
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.meta
    }

    pub fn num_columns(&self) -> usize {
        self.meta.num_columns
    }

    pub fn key_column(&self) -> usize {
        self.meta.key_column
    }

    pub fn file(&self) -> FileHandle {
        self.file
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    pub fn index(&self) -> &PrimaryIndex {
        &self.index
    }

    pub fn range(&self, id: u32) -> Option<Arc<PageRange>> {
        self.ranges.read().get(id as usize).cloned()
    }

    pub fn ranges(&self) -> Vec<Arc<PageRange>> {
        self.ranges.read().clone()
    }

    /// Reserve a RID for a new record
    pub fn next_rid(&self) -> Rid {
        self.next_rid.fetch_add(1, Ordering::AcqRel)
    }

    /// RIDs of every record ever inserted and not rolled back, ascending
    pub fn rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.directory.read().keys().copied().collect();
        rids.sort_unstable();
        rids
    }

    pub fn locate(&self, rid: Rid) -> DbResult<BaseLoc> {
        self.directory
            .read()
            .get(&rid)
            .copied()
            .ok_or(DbError::RecordNotFound(rid))
    }

    pub fn stats(&self) -> TableStats {
        let ranges = self.ranges();
        TableStats {
            records: self.directory.read().len(),
            keys: self.index.len(),
            ranges: ranges.len(),
            base_pages: ranges.iter().map(|range| range.read().base.len()).sum(),
            tail_pages: ranges.iter().map(|range| range.tail_pages().len()).sum(),
        }
    }

    pub fn check_width(&self, actual: usize) -> DbResult<()> {
        if actual != self.meta.num_columns {
            return Err(DbError::SchemaMismatch {
                expected: self.meta.num_columns,
                actual,
            });
        }
        Ok(())
    }

    pub fn check_column(&self, column: usize) -> DbResult<()> {
        if column >= self.meta.num_columns {
            return Err(DbError::InvalidColumn {
                column,
                num_columns: self.meta.num_columns,
            });
        }
        Ok(())
    }

    /// Run `f` with the current data page of a base location, holding the
    /// range latch shared so a merge cannot swap the page meanwhile
    fn with_base<R>(
        &self,
        rid: Rid,
        loc: BaseLoc,
        f: impl FnOnce(&PageRange, &RangePages, PageNo) -> DbResult<R>,
    ) -> DbResult<R> {
        let range = self.range(loc.range).ok_or(DbError::RecordNotFound(rid))?;
        let pages = range.read();
        let page = *pages
            .base
            .get(loc.page_index as usize)
            .ok_or(DbError::RecordNotFound(rid))?;
        f(&range, &pages, page)
    }

    fn allocate_page_pair(&self) -> DbResult<PageNo> {
        let page = self.next_page.fetch_add(2, Ordering::AcqRel);
        self.pool.new_page(self.file, page)?;
        self.pool.new_page(self.file, page + 1)?;
        Ok(page)
    }

    fn allocate_base(&self) -> DbResult<BaseLoc> {
        let mut cursor = self.insert_cursor.lock();
        let loc = match *cursor {
            Some(next) if (next.slot as usize) < self.layout.capacity() => next,
            _ => self.open_base_page()?,
        };
        *cursor = Some(BaseLoc {
            slot: loc.slot + 1,
            ..loc
        });
        Ok(loc)
    }

    /// Append a base page to the last range, starting a new range when it is full
    fn open_base_page(&self) -> DbResult<BaseLoc> {
        let page = self.allocate_page_pair()?;
        let range = {
            let mut ranges = self.ranges.write();
            let last = ranges
                .last()
                .filter(|range| range.read().base.len() < self.pages_per_range)
                .cloned();
            match last {
                Some(range) => range,
                None => {
                    let range = Arc::new(PageRange::new(ranges.len() as u32));
                    ranges.push(Arc::clone(&range));
                    range
                }
            }
        };

        let mut pages = range.write();
        pages.base.push(page);
        tracing::debug!(table = %self.meta.name, range = range.id, page, "opened base page");
        Ok(BaseLoc {
            range: range.id,
            page_index: (pages.base.len() - 1) as u32,
            slot: 0,
        })
    }

    pub(crate) fn read_meta(&self, page: PageNo, slot: u16) -> DbResult<RecordMeta> {
        let pinned = self.pool.fetch(self.file, page + 1)?;
        Ok(pinned.read(|bytes| self.layout.read_meta(bytes, slot)))
    }

    fn modify_meta(
        &self,
        page: PageNo,
        slot: u16,
        lsn: Lsn,
        f: impl FnOnce(&mut RecordMeta),
    ) -> DbResult<RecordMeta> {
        let pinned = self.pool.fetch(self.file, page + 1)?;
        Ok(pinned.modify(lsn, |bytes| {
            let mut meta = self.layout.read_meta(bytes, slot);
            f(&mut meta);
            self.layout.write_meta(bytes, slot, &meta);
            meta
        }))
    }

    fn write_entry(
        &self,
        page: PageNo,
        slot: u16,
        lsn: Lsn,
        values: &[i64],
        meta: &RecordMeta,
    ) -> DbResult<()> {
        let data = self.pool.fetch(self.file, page)?;
        let meta_page = self.pool.fetch(self.file, page + 1)?;
        data.modify(lsn, |bytes| self.layout.write_row(bytes, slot, values));
        meta_page.modify(lsn, |bytes| self.layout.write_meta(bytes, slot, meta));
        Ok(())
    }

    /// Copy the columns set in `mask` from one entry into `out`
    fn read_columns(
        &self,
        page: PageNo,
        slot: u16,
        mask: u64,
        out: &mut [Option<i64>],
    ) -> DbResult<()> {
        let pinned = self.pool.fetch(self.file, page)?;
        pinned.read(|bytes| {
            for (column, value) in out.iter_mut().enumerate() {
                if mask & (1 << column) != 0 {
                    *value = Some(self.layout.read_value(bytes, column, slot));
                }
            }
        });
        Ok(())
    }

    /// Read `columns` of a record as `snap` sees it
    pub fn read(&self, rid: Rid, columns: &[usize], snap: Snapshot) -> DbResult<Vec<i64>> {
        self.read_version(rid, columns, snap, 0)
    }

    /// Read `columns` of a record, ignoring the `skip` newest versions visible
    /// to `snap`. Skipping past the oldest retained version yields it.
    pub fn read_version(
        &self,
        rid: Rid,
        columns: &[usize],
        snap: Snapshot,
        skip: usize,
    ) -> DbResult<Vec<i64>> {
        let mut wanted = 0u64;
        for &column in columns {
            self.check_column(column)?;
            wanted |= 1 << column;
        }

        let loc = self.locate(rid)?;
        self.with_base(rid, loc, |range, pages, page| {
            let base = self.read_meta(page, loc.slot)?;
            if !snap.sees(&base) || base.schema & FOLDED_DELETE != 0 {
                return Err(DbError::RecordNotFound(rid));
            }

            let mut values = vec![None; self.meta.num_columns];
            let mut remaining = wanted;
            if base.schema & (wanted | TOMBSTONE) != 0 || skip > 0 {
                let mut cursor = base.indirection;
                let mut newest = true;
                let mut skipped = 0;
                while cursor.is_tail() && range.is_live_tail(cursor.page()) {
                    let tail = self.read_meta(cursor.page(), cursor.slot())?;
                    if tail.is_committed() && tail.timestamp <= pages.merged_ts {
                        break;
                    }
                    if snap.sees(&tail) {
                        if newest && tail.schema & TOMBSTONE != 0 {
                            return Err(DbError::RecordNotFound(rid));
                        }
                        newest = false;
                        if skipped < skip {
                            skipped += 1;
                        } else {
                            let hit = tail.schema & remaining;
                            if hit != 0 {
                                self.read_columns(cursor.page(), cursor.slot(), hit, &mut values)?;
                                remaining &= !hit;
                            }
                            if remaining == 0 {
                                break;
                            }
                        }
                    }
                    cursor = tail.indirection;
                }
            }

            if remaining != 0 {
                self.read_columns(page, loc.slot, remaining, &mut values)?;
            }
            Ok(columns
                .iter()
                .map(|&column| values[column].unwrap_or_default())
                .collect())
        })
    }

    /// Base metadata of a record that exists for `txn`, which must hold its
    /// exclusive lock
    fn live_base(&self, rid: Rid, page: PageNo, slot: u16, txn: TxnId) -> DbResult<RecordMeta> {
        let base = self.read_meta(page, slot)?;
        if !Snapshot::latest_for(txn).sees(&base)
            || base.schema & (TOMBSTONE | FOLDED_DELETE) != 0
        {
            return Err(DbError::RecordNotFound(rid));
        }
        Ok(base)
    }

    /// Write a new base record for `txn`.
    ///
    /// `log` receives the insert before any page is touched and returns its
    /// LSN. If it fails, the claimed slot is marked aborted and never reused.
    pub fn insert(
        &self,
        txn: TxnId,
        rid: Rid,
        values: &[i64],
        log: impl FnOnce(&UpdateOp) -> DbResult<Lsn>,
    ) -> DbResult<(BaseLoc, Lsn)> {
        self.check_width(values.len())?;
        let loc = self.allocate_base()?;
        let page = self.with_base(rid, loc, |_, _, page| Ok(page))?;

        let op = UpdateOp::Insert {
            table: self.meta.id,
            rid,
            loc,
            page,
            values: values.to_vec(),
        };
        let lsn = match log(&op) {
            Ok(lsn) => lsn,
            Err(e) => {
                self.abandon_base(rid, loc);
                return Err(e);
            }
        };

        self.with_base(rid, loc, |_, _, page| {
            let meta = RecordMeta {
                indirection: RecordAddr::base(page, loc.slot),
                rid,
                timestamp: UNCOMMITTED,
                schema: 0,
                txn,
            };
            self.write_entry(page, loc.slot, lsn, values, &meta)
        })?;
        self.directory.write().insert(rid, loc);
        Ok((loc, lsn))
    }

    fn abandon_base(&self, rid: Rid, loc: BaseLoc) {
        let result = self.with_base(rid, loc, |_, _, page| {
            self.modify_meta(page, loc.slot, 0, |meta| meta.timestamp = ABORTED)
        });
        if let Err(e) = result {
            tracing::warn!(table = %self.meta.name, rid, error = %e, "failed to release base slot");
        }
    }

    fn abandon_tail(&self, tail: RecordAddr) {
        if let Err(e) = self.modify_meta(tail.page(), tail.slot(), 0, |meta| meta.timestamp = ABORTED) {
            tracing::warn!(table = %self.meta.name, %tail, error = %e, "failed to release tail slot");
        }
    }

    /// Append a tail record overriding the `Some` columns of `values`
    pub fn update(
        &self,
        txn: TxnId,
        rid: Rid,
        values: &[Option<i64>],
        log: impl FnOnce(&UpdateOp) -> DbResult<Lsn>,
    ) -> DbResult<TailWrite> {
        self.check_width(values.len())?;
        let schema = values
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_some())
            .fold(0u64, |bits, (column, _)| bits | 1 << column);
        let row: Vec<i64> = values.iter().map(|value| value.unwrap_or_default()).collect();

        let loc = self.locate(rid)?;
        self.with_base(rid, loc, |range, _, page| {
            let base = self.live_base(rid, page, loc.slot, txn)?;
            let tail = range.allocate_tail(self.layout.capacity(), || self.allocate_page_pair())?;
            let op = UpdateOp::Modify {
                table: self.meta.id,
                rid,
                range: range.id,
                tail,
                prev: base.indirection,
                schema,
                values: values.to_vec(),
            };
            let lsn = log(&op).inspect_err(|_| self.abandon_tail(tail))?;

            self.link_tail(page, loc.slot, lsn, tail, base.indirection, schema, &row, rid, txn)?;
            Ok(TailWrite {
                range: range.id,
                tail,
                prev: base.indirection,
                lsn,
            })
        })
    }

    /// Append a tombstone tail, hiding the record from later snapshots
    pub fn delete(
        &self,
        txn: TxnId,
        rid: Rid,
        log: impl FnOnce(&UpdateOp) -> DbResult<Lsn>,
    ) -> DbResult<TailWrite> {
        let loc = self.locate(rid)?;
        self.with_base(rid, loc, |range, _, page| {
            let base = self.live_base(rid, page, loc.slot, txn)?;
            let tail = range.allocate_tail(self.layout.capacity(), || self.allocate_page_pair())?;
            let op = UpdateOp::Delete {
                table: self.meta.id,
                rid,
                range: range.id,
                tail,
                prev: base.indirection,
            };
            let lsn = log(&op).inspect_err(|_| self.abandon_tail(tail))?;

            let row = vec![0; self.meta.num_columns];
            self.link_tail(page, loc.slot, lsn, tail, base.indirection, TOMBSTONE, &row, rid, txn)?;
            Ok(TailWrite {
                range: range.id,
                tail,
                prev: base.indirection,
                lsn,
            })
        })
    }

    /// Write an uncommitted tail entry and make it the chain head
    #[allow(clippy::too_many_arguments)]
    fn link_tail(
        &self,
        base_page: PageNo,
        slot: u16,
        lsn: Lsn,
        tail: RecordAddr,
        prev: RecordAddr,
        schema: u64,
        row: &[i64],
        rid: Rid,
        txn: TxnId,
    ) -> DbResult<()> {
        let meta = RecordMeta {
            indirection: prev,
            rid,
            timestamp: UNCOMMITTED,
            schema,
            txn,
        };
        self.write_entry(tail.page(), tail.slot(), lsn, row, &meta)?;
        self.modify_meta(base_page, slot, lsn, |base| {
            base.indirection = tail;
            base.schema |= schema;
        })?;
        Ok(())
    }

    /// Make an inserted record visible at `ts`
    pub fn stamp_base(&self, rid: Rid, loc: BaseLoc, ts: Timestamp, lsn: Lsn) -> DbResult<()> {
        self.with_base(rid, loc, |_, _, page| {
            self.modify_meta(page, loc.slot, lsn, |meta| meta.timestamp = ts)
        })?;
        Ok(())
    }

    /// Make a tail entry visible at `ts`
    pub fn stamp_tail(&self, tail: RecordAddr, ts: Timestamp, lsn: Lsn) -> DbResult<()> {
        self.modify_meta(tail.page(), tail.slot(), lsn, |meta| meta.timestamp = ts)?;
        Ok(())
    }

    /// Roll back an insert: the slot is marked aborted and the RID forgotten
    pub fn undo_insert(&self, rid: Rid, loc: BaseLoc, lsn: Lsn) -> DbResult<()> {
        self.with_base(rid, loc, |_, _, page| {
            self.modify_meta(page, loc.slot, lsn, |meta| meta.timestamp = ABORTED)
        })?;
        self.directory.write().remove(&rid);
        Ok(())
    }

    /// Roll back an update or delete by unlinking its tail from the chain
    pub fn undo_tail(
        &self,
        rid: Rid,
        tail: RecordAddr,
        prev: RecordAddr,
        tombstone: bool,
        lsn: Lsn,
    ) -> DbResult<()> {
        let loc = self.directory.read().get(&rid).copied();
        if let Some(loc) = loc {
            self.with_base(rid, loc, |range, _, page| {
                let base = self.read_meta(page, loc.slot)?;
                if base.indirection == tail {
                    // a tombstone is always the chain head while it is pending
                    self.modify_meta(page, loc.slot, lsn, |meta| {
                        meta.indirection = prev;
                        if tombstone {
                            meta.schema &= !TOMBSTONE;
                        }
                    })?;
                } else {
                    let mut cursor = base.indirection;
                    while cursor.is_tail() && range.is_live_tail(cursor.page()) {
                        let entry = self.read_meta(cursor.page(), cursor.slot())?;
                        if entry.indirection == tail {
                            self.modify_meta(cursor.page(), cursor.slot(), lsn, |meta| {
                                meta.indirection = prev
                            })?;
                            break;
                        }
                        cursor = entry.indirection;
                    }
                }
                Ok(())
            })?;
        }

        self.modify_meta(tail.page(), tail.slot(), lsn, |meta| meta.timestamp = ABORTED)?;
        Ok(())
    }

    fn ensure_range(&self, id: u32) -> Arc<PageRange> {
        let mut ranges = self.ranges.write();
        while ranges.len() <= id as usize {
            let next = ranges.len() as u32;
            ranges.push(Arc::new(PageRange::new(next)));
        }
        Arc::clone(&ranges[id as usize])
    }

    /// Make the pages of a logged change known to the table, as recovery
    /// replays the log over the last checkpointed directory
    pub fn register(&self, op: &UpdateOp) -> DbResult<()> {
        match op {
            UpdateOp::Insert {
                rid, loc, page, ..
            } => {
                let range = self.ensure_range(loc.range);
                self.next_page.fetch_max(page + 2, Ordering::AcqRel);
                {
                    let mut pages = range.write();
                    let index = loc.page_index as usize;
                    while pages.base.len() < index {
                        pages.base.push(UNALLOCATED);
                    }
                    if pages.base.len() == index {
                        pages.base.push(*page);
                    } else if pages.base[index] == UNALLOCATED {
                        pages.base[index] = *page;
                    }
                }

                self.directory.write().insert(*rid, *loc);
                self.next_rid.fetch_max(rid + 1, Ordering::AcqRel);
                let next = BaseLoc {
                    slot: loc.slot + 1,
                    ..*loc
                };
                let mut cursor = self.insert_cursor.lock();
                let key = |loc: &BaseLoc| (loc.range, loc.page_index, loc.slot);
                if (*cursor).is_none_or(|current| key(&current) < key(&next)) {
                    *cursor = Some(next);
                }
            }
            UpdateOp::Modify { range, tail, .. } | UpdateOp::Delete { range, tail, .. } => {
                let range = self.ensure_range(*range);
                self.next_page.fetch_max(tail.page() + 2, Ordering::AcqRel);
                range.add_tail(tail.page());
                range.advance_tail_cursor(*tail);
            }
        }
        Ok(())
    }

    /// Reapply a committed change. Applying it twice has the same effect as once.
    pub fn redo(&self, op: &UpdateOp, commit_ts: Timestamp, lsn: Lsn) -> DbResult<()> {
        match op {
            UpdateOp::Insert {
                rid, loc, values, ..
            } => self.with_base(*rid, *loc, |_, _, page| {
                let meta = RecordMeta {
                    indirection: RecordAddr::base(page, loc.slot),
                    rid: *rid,
                    timestamp: commit_ts,
                    schema: 0,
                    txn: 0,
                };
                self.write_entry(page, loc.slot, lsn, values, &meta)
            }),
            UpdateOp::Modify {
                rid,
                tail,
                prev,
                schema,
                values,
                ..
            } => {
                let row: Vec<i64> = values.iter().map(|value| value.unwrap_or_default()).collect();
                self.redo_tail(*rid, *tail, *prev, *schema, &row, commit_ts, lsn)
            }
            UpdateOp::Delete { rid, tail, prev, .. } => {
                let row = vec![0; self.meta.num_columns];
                self.redo_tail(*rid, *tail, *prev, TOMBSTONE, &row, commit_ts, lsn)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn redo_tail(
        &self,
        rid: Rid,
        tail: RecordAddr,
        prev: RecordAddr,
        schema: u64,
        row: &[i64],
        commit_ts: Timestamp,
        lsn: Lsn,
    ) -> DbResult<()> {
        let loc = self.locate(rid)?;
        self.with_base(rid, loc, |_, _, page| {
            let meta = RecordMeta {
                indirection: prev,
                rid,
                timestamp: commit_ts,
                schema,
                txn: 0,
            };
            self.write_entry(tail.page(), tail.slot(), lsn, row, &meta)?;
            self.modify_meta(page, loc.slot, lsn, |base| {
                base.indirection = tail;
                base.schema |= schema;
            })?;
            Ok(())
        })
    }

    /// Roll back a change of a transaction that never committed
    pub fn undo(&self, op: &UpdateOp, lsn: Lsn) -> DbResult<()> {
        match op {
            UpdateOp::Insert { rid, loc, .. } => self.undo_insert(*rid, *loc, lsn),
            UpdateOp::Modify {
                rid, tail, prev, ..
            } => self.undo_tail(*rid, *tail, *prev, false, lsn),
            UpdateOp::Delete {
                rid, tail, prev, ..
            } => self.undo_tail(*rid, *tail, *prev, true, lsn),
        }
    }

    /// Settle state after log replay: give real pages to base slots that were
    /// never logged and rebuild the primary index
    pub fn finish_recovery(&self) -> DbResult<()> {
        for range in self.ranges() {
            let mut pages = range.write();
            for index in 0..pages.base.len() {
                if pages.base[index] == UNALLOCATED {
                    pages.base[index] = self.allocate_page_pair()?;
                }
            }
        }
        self.rebuild_index()
    }

    /// Rebuild the primary index from the latest committed version of every record
    pub fn rebuild_index(&self) -> DbResult<()> {
        self.index.clear();
        let key_column = [self.meta.key_column];
        for rid in self.rids() {
            match self.read(rid, &key_column, Snapshot::latest()) {
                Ok(values) => {
                    if let Err(e) = self.index.notify_insert(values[0], rid) {
                        tracing::warn!(table = %self.meta.name, rid, error = %e, "skipping index entry");
                    }
                }
                Err(DbError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete page files that no range refers to
    pub fn sweep_orphans(&self) -> DbResult<usize> {
        let mut live = AHashSet::new();
        for range in self.ranges() {
            let pages = range.read();
            for page in pages.base.iter().chain(range.tail_pages().iter()) {
                live.insert(*page);
                live.insert(page + 1);
            }
        }

        let mut removed = 0;
        for page in self.pool.stored_pages(self.file)? {
            if !live.contains(&page) {
                self.pool.discard(self.file, page)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(table = %self.meta.name, removed, "removed orphaned pages");
        }
        Ok(removed)
    }

    /// Drop retired page pairs from the pool and disk
    pub fn discard_pages(&self, pages: &[PageNo]) -> DbResult<()> {
        for page in pages {
            self.pool.discard(self.file, *page)?;
            self.pool.discard(self.file, page + 1)?;
        }
        Ok(())
    }
}
