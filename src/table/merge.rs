//! Background consolidation of tail records into base pages.
//!
//! A merge works on one range. It folds every committed tail at or below the
//! watermark into fresh copies of the range's base pages without blocking
//! record operations. Under the range latch it then patches the slots written
//! while the copies were built and swaps the copies in. The old base pages and
//! fully consumed tail pages are returned for the caller to discard once the
//! swap is durable. A failed merge leaves the range as it was.

use super::{PageRange, Table};
use crate::error::DbResult;
use crate::failpoint;
use crate::record::{
    ABORTED, COLUMN_BITS, FOLDED_DELETE, Lsn, PageNo, RecordAddr, RecordMeta, TIMESTAMP_COLUMN,
    TOMBSTONE, Timestamp, UNCOMMITTED,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub range: u32,
    /// Records whose chain contributed folded values
    pub folded: usize,
    pub merged_ts: Timestamp,
    /// Data pages no longer referenced; each meta page is the next number
    pub retired: Vec<PageNo>,
}

/// Committed tail values of one record at or below the merge horizon
#[derive(Debug, Clone)]
struct Fold {
    values: Vec<Option<i64>>,
    deleted: bool,
}

/// Merged copy of one base page pair
struct PageCopy {
    old: PageNo,
    new: PageNo,
    folds: Vec<Option<Fold>>,
    /// Old page contents the copy was built from
    source_data: Vec<u8>,
    source_meta: Vec<u8>,
    data: Vec<u8>,
    metas: Vec<RecordMeta>,
    lsn: Lsn,
}

impl Table {
    /// Merge one range, folding committed tails with timestamps at or below
    /// `watermark`.
    ///
    /// The caller must keep checkpoints out until the returned pages have been
    /// made durable, and only then discard `retired`.
    pub fn merge_range(&self, range_id: u32, watermark: Timestamp) -> DbResult<MergeOutcome> {
        let Some(range) = self.range(range_id) else {
            return Ok(MergeOutcome {
                range: range_id,
                ..MergeOutcome::default()
            });
        };

        let (snapshot, previous) = {
            let pages = range.read();
            (pages.base.clone(), pages.merged_ts)
        };
        let horizon = watermark.max(previous);
        let capacity = self.layout.capacity();

        let mut folds = Vec::with_capacity(snapshot.len());
        for &page in &snapshot {
            let mut page_folds = vec![None; capacity];
            for slot in 0..capacity as u16 {
                let meta = self.read_meta(page, slot)?;
                if meta.is_committed() && meta.indirection.is_tail() {
                    page_folds[slot as usize] =
                        self.fold_chain(&range, meta.indirection, previous, horizon)?;
                }
            }
            folds.push(page_folds);
        }

        let mut allocated = Vec::with_capacity(snapshot.len());
        let merged = self
            .build_copies(&range, &snapshot, folds, horizon, &mut allocated)
            .and_then(|copies| self.swap_copies(&range, &snapshot, copies, horizon));
        match merged {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => {
                self.release_copies(&allocated);
                Ok(MergeOutcome {
                    range: range_id,
                    merged_ts: previous,
                    ..MergeOutcome::default()
                })
            }
            Err(e) => {
                self.release_copies(&allocated);
                Err(e)
            }
        }
    }

    /// Write a merged copy of every snapshotted base page into fresh pages
    fn build_copies(
        &self,
        range: &PageRange,
        snapshot: &[PageNo],
        folds: Vec<Vec<Option<Fold>>>,
        horizon: Timestamp,
        allocated: &mut Vec<PageNo>,
    ) -> DbResult<Vec<PageCopy>> {
        let mut copies = Vec::with_capacity(snapshot.len());
        for (&old, folds) in snapshot.iter().zip(folds) {
            let new = self.allocate_page_pair()?;
            allocated.push(new);
            let copy = self.copy_page(range, old, new, folds, horizon)?;
            self.write_copy(&copy)?;
            copies.push(copy);
        }
        Ok(copies)
    }

    /// Bring the copies up to date with writes made while they were built and
    /// swap them in. Returns `None` if another merge swapped the range first.
    fn swap_copies(
        &self,
        range: &PageRange,
        snapshot: &[PageNo],
        mut copies: Vec<PageCopy>,
        horizon: Timestamp,
    ) -> DbResult<Option<MergeOutcome>> {
        let open = range.open_tail();
        let mut candidates = Vec::new();
        for tail in range.tail_pages() {
            if Some(tail) != open && self.tail_consumed(tail, horizon)? {
                candidates.push(tail);
            }
        }

        failpoint::maybe_fail(failpoint::MERGE_SWAP)?;

        let mut pages = range.write();
        if pages.base.get(..snapshot.len()) != Some(snapshot) {
            return Ok(None);
        }
        let mut patched = 0;
        for copy in &mut copies {
            patched += self.patch_copy(range, copy, horizon)?;
        }
        // a slot reserved before the latch may have been written since
        let open = range.open_tail();
        let mut consumed = Vec::with_capacity(candidates.len());
        for tail in candidates {
            if Some(tail) != open && self.tail_consumed(tail, horizon)? {
                consumed.push(tail);
            }
        }

        for (index, copy) in copies.iter().enumerate() {
            pages.base[index] = copy.new;
        }
        pages.merged_ts = horizon;
        range.remove_tails(&consumed);
        drop(pages);

        let folded = copies
            .iter()
            .map(|copy| {
                copy.metas
                    .iter()
                    .zip(&copy.folds)
                    .filter(|(meta, fold)| meta.timestamp != 0 && fold.is_some())
                    .count()
            })
            .sum();
        tracing::debug!(
            table = %self.name(),
            range = range.id,
            horizon,
            folded,
            patched,
            base_pages = copies.len(),
            tail_pages = consumed.len(),
            "merged range"
        );

        let mut retired: Vec<PageNo> = copies.iter().map(|copy| copy.old).collect();
        retired.extend(consumed);
        Ok(Some(MergeOutcome {
            range: range.id,
            folded,
            merged_ts: horizon,
            retired,
        }))
    }

    fn release_copies(&self, allocated: &[PageNo]) {
        if let Err(e) = self.discard_pages(allocated) {
            tracing::warn!(table = %self.name(), error = %e, "failed to release merge pages");
        }
    }

    /// Collect the committed tail values of a chain between `previous` and
    /// `horizon`, newest first
    fn fold_chain(
        &self,
        range: &PageRange,
        head: RecordAddr,
        previous: Timestamp,
        horizon: Timestamp,
    ) -> DbResult<Option<Fold>> {
        let mut fold = Fold {
            values: vec![None; self.num_columns()],
            deleted: false,
        };
        let mut remaining = COLUMN_BITS & ((1 << self.num_columns()) - 1);
        let mut found = false;

        let mut cursor = head;
        while cursor.is_tail() && range.is_live_tail(cursor.page()) {
            let tail = self.read_meta(cursor.page(), cursor.slot())?;
            if tail.is_committed() {
                if tail.timestamp <= previous {
                    break;
                }
                if tail.timestamp <= horizon {
                    if !found && tail.schema & TOMBSTONE != 0 {
                        fold.deleted = true;
                    }
                    found = true;
                    let hit = tail.schema & remaining;
                    if hit != 0 {
                        self.read_columns(cursor.page(), cursor.slot(), hit, &mut fold.values)?;
                        remaining &= !hit;
                    }
                }
            }
            cursor = tail.indirection;
        }
        Ok(found.then_some(fold))
    }

    /// Whether a chain head is already reflected in the merged base
    fn head_folded(&self, range: &PageRange, head: RecordAddr, horizon: Timestamp) -> DbResult<bool> {
        if !head.is_tail() || !range.is_live_tail(head.page()) {
            return Ok(true);
        }
        let tail = self.read_meta(head.page(), head.slot())?;
        Ok(tail.is_committed() && tail.timestamp <= horizon)
    }

    /// Apply a fold to one slot of a page copy
    fn merge_slot(
        &self,
        range: &PageRange,
        copy: &mut PageCopy,
        slot: u16,
        horizon: Timestamp,
    ) -> DbResult<()> {
        let layout = self.layout;
        let meta = &mut copy.metas[slot as usize];
        if meta.timestamp == 0 {
            return Ok(());
        }
        if let Some(fold) = &copy.folds[slot as usize] {
            for (column, value) in fold.values.iter().enumerate() {
                if let Some(value) = value {
                    layout.write_value(&mut copy.data, column, slot, *value);
                }
            }
            if fold.deleted {
                meta.schema |= TOMBSTONE | FOLDED_DELETE;
            }
        }
        if self.head_folded(range, meta.indirection, horizon)? {
            meta.indirection = RecordAddr::base(copy.new, slot);
            meta.schema &= TOMBSTONE | FOLDED_DELETE;
        }
        Ok(())
    }

    /// Build the merged copy of base page `old`, to be written to `new`
    fn copy_page(
        &self,
        range: &PageRange,
        old: PageNo,
        new: PageNo,
        folds: Vec<Option<Fold>>,
        horizon: Timestamp,
    ) -> DbResult<PageCopy> {
        let layout = self.layout;
        let old_data = self.pool.fetch(self.file, old)?;
        let old_meta = self.pool.fetch(self.file, old + 1)?;
        let source_data = old_data.read(|bytes| bytes.to_vec());
        let source_meta = old_meta.read(|bytes| bytes.to_vec());
        // anything copied from the old page must not reach disk before its log records
        let lsn = old_data.lsn().max(old_meta.lsn());
        drop((old_data, old_meta));

        let metas = (0..layout.capacity() as u16)
            .map(|slot| layout.read_meta(&source_meta, slot))
            .collect();
        let mut copy = PageCopy {
            old,
            new,
            folds,
            data: source_data.clone(),
            source_data,
            source_meta,
            metas,
            lsn,
        };
        for slot in 0..layout.capacity() as u16 {
            self.merge_slot(range, &mut copy, slot, horizon)?;
        }
        Ok(copy)
    }

    /// Redo the slots of `copy` whose old page changed since it was built.
    /// Returns the number of slots redone.
    fn patch_copy(&self, range: &PageRange, copy: &mut PageCopy, horizon: Timestamp) -> DbResult<usize> {
        let layout = self.layout;
        let old_data = self.pool.fetch(self.file, copy.old)?;
        let old_meta = self.pool.fetch(self.file, copy.old + 1)?;
        let data_now = old_data.read(|bytes| bytes.to_vec());
        let meta_now = old_meta.read(|bytes| bytes.to_vec());
        let lsn = old_data.lsn().max(old_meta.lsn());
        drop((old_data, old_meta));
        if data_now == copy.source_data && meta_now == copy.source_meta {
            return Ok(0);
        }

        let mut changed = 0;
        for slot in 0..layout.capacity() as u16 {
            let row = layout.read_row(&data_now, slot);
            let meta = layout.read_meta(&meta_now, slot);
            if row == layout.read_row(&copy.source_data, slot)
                && meta == layout.read_meta(&copy.source_meta, slot)
            {
                continue;
            }
            layout.write_row(&mut copy.data, slot, &row);
            copy.metas[slot as usize] = meta;
            self.merge_slot(range, copy, slot, horizon)?;
            changed += 1;
        }
        copy.source_data = data_now;
        copy.source_meta = meta_now;
        copy.lsn = copy.lsn.max(lsn);
        self.write_copy(copy)?;
        Ok(changed)
    }

    fn write_copy(&self, copy: &PageCopy) -> DbResult<()> {
        let layout = self.layout;
        let new_data = self.pool.fetch(self.file, copy.new)?;
        let new_meta = self.pool.fetch(self.file, copy.new + 1)?;
        new_data.modify(copy.lsn, |bytes| bytes.copy_from_slice(&copy.data));
        new_meta.modify(copy.lsn, |bytes| {
            for (slot, meta) in copy.metas.iter().enumerate() {
                layout.write_meta(bytes, slot as u16, meta);
            }
        });
        Ok(())
    }

    /// A tail page is consumed once no entry on it can be needed by a reader
    /// or a rollback
    fn tail_consumed(&self, page: PageNo, horizon: Timestamp) -> DbResult<bool> {
        let layout = self.layout;
        let meta = self.pool.fetch(self.file, page + 1)?;
        Ok(meta.read(|bytes| {
            (0..layout.capacity() as u16).all(|slot| {
                match layout.meta_field(bytes, TIMESTAMP_COLUMN, slot) {
                    0 | ABORTED => true,
                    UNCOMMITTED => false,
                    ts => ts <= horizon,
                }
            })
        }))
    }
}
