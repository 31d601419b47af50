use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::DbResult;
use crate::record::{PageNo, RecordAddr, Timestamp};

/// Base pages of a range and the merge horizon, swapped together by a merge
#[derive(Debug, Clone, Default)]
pub struct RangePages {
    /// Data page of each base page pair; the meta page is the next number
    pub base: Vec<PageNo>,
    /// Committed tails at or below this timestamp are folded into the base pages
    pub merged_ts: Timestamp,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TailCursor {
    pub page: Option<PageNo>,
    pub next_slot: u16,
}

/// A set of base pages and the tail pages holding their updates.
///
/// Record operations hold `pages` shared for their duration; a merge takes it
/// exclusively to swap in consolidated base pages.
pub struct PageRange {
    pub id: u32,
    pages: RwLock<RangePages>,
    /// Live tail page pairs, ascending
    tails: RwLock<Vec<PageNo>>,
    cursor: Mutex<TailCursor>,
    updates_since_merge: AtomicU64,
    merge_pending: AtomicBool,
}

impl PageRange {
    pub fn new(id: u32) -> Self {
        Self::from_parts(id, RangePages::default(), Vec::new(), TailCursor::default())
    }

    pub(crate) fn from_parts(
        id: u32,
        pages: RangePages,
        mut tails: Vec<PageNo>,
        cursor: TailCursor,
    ) -> Self {
        tails.sort_unstable();
        tails.dedup();
        Self {
            id,
            pages: RwLock::new(pages),
            tails: RwLock::new(tails),
            cursor: Mutex::new(cursor),
            updates_since_merge: AtomicU64::new(0),
            merge_pending: AtomicBool::new(false),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RangePages> {
        self.pages.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RangePages> {
        self.pages.write()
    }

    pub fn is_live_tail(&self, page: PageNo) -> bool {
        self.tails.read().binary_search(&page).is_ok()
    }

    pub fn tail_pages(&self) -> Vec<PageNo> {
        self.tails.read().clone()
    }

    pub fn add_tail(&self, page: PageNo) {
        let mut tails = self.tails.write();
        if let Err(pos) = tails.binary_search(&page) {
            tails.insert(pos, page);
        }
    }

    pub fn remove_tails(&self, retired: &[PageNo]) {
        self.tails.write().retain(|page| !retired.contains(page));
    }

    /// Tail page currently receiving new tail records
    pub fn open_tail(&self) -> Option<PageNo> {
        self.cursor.lock().page
    }

    pub(crate) fn tail_cursor(&self) -> TailCursor {
        *self.cursor.lock()
    }

    /// Claim the next tail slot, opening a page from `allocate` when the
    /// current one is full
    pub fn allocate_tail(
        &self,
        capacity: usize,
        allocate: impl FnOnce() -> DbResult<PageNo>,
    ) -> DbResult<RecordAddr> {
        let mut cursor = self.cursor.lock();
        if let Some(page) = cursor.page
            && (cursor.next_slot as usize) < capacity
        {
            let slot = cursor.next_slot;
            cursor.next_slot += 1;
            return Ok(RecordAddr::tail(page, slot));
        }

        let page = allocate()?;
        self.add_tail(page);
        cursor.page = Some(page);
        cursor.next_slot = 1;
        Ok(RecordAddr::tail(page, 0))
    }

    /// Move the tail cursor past a slot known to be used
    pub fn advance_tail_cursor(&self, tail: RecordAddr) {
        let mut cursor = self.cursor.lock();
        let newer = match cursor.page {
            None => true,
            Some(page) => {
                tail.page() > page || (tail.page() == page && tail.slot() >= cursor.next_slot)
            }
        };
        if newer {
            cursor.page = Some(tail.page());
            cursor.next_slot = tail.slot() + 1;
        }
    }

    /// Count committed updates, returning the total since the last merge
    pub fn note_updates(&self, count: u64) -> u64 {
        self.updates_since_merge.fetch_add(count, Ordering::AcqRel) + count
    }

    pub fn updates_since_merge(&self) -> u64 {
        self.updates_since_merge.load(Ordering::Acquire)
    }

    /// Claim the right to merge this range. Returns false if a merge is
    /// already queued or running.
    pub fn try_begin_merge(&self) -> bool {
        !self.merge_pending.swap(true, Ordering::AcqRel)
    }

    pub fn end_merge(&self, merged: bool) {
        if merged {
            self.updates_since_merge.store(0, Ordering::Release);
        }
        self.merge_pending.store(false, Ordering::Release);
    }
}
