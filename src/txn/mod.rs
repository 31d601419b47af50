//! Transaction ids, the logical commit clock and the active set.

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::{Lsn, Timestamp, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Active => write!(f, "active"),
            TxnState::Committed => write!(f, "committed"),
            TxnState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTxn {
    start_ts: Timestamp,
    /// LSN of the Begin record, once the transaction has written something
    first_lsn: Option<Lsn>,
    /// Set while the commit timestamp is being stamped into records
    commit_ts: Option<Timestamp>,
}

/// Hands out transaction ids and commit timestamps and tracks running
/// transactions.
///
/// The clock holds the last commit timestamp issued. A transaction stays in
/// the active set until its commit timestamp has been stamped into every
/// record it wrote, so the low watermark never passes a half-visible commit.
/// New snapshots start below the oldest commit still being stamped; a commit
/// returns only once [`TransactionManager::wait_visible`] says every earlier
/// commit is stamped, so a transaction that begins after it sees it.
pub struct TransactionManager {
    clock: AtomicU64,
    next_txn: AtomicU64,
    active: Mutex<AHashMap<TxnId, ActiveTxn>>,
    stamped: Condvar,
}

impl TransactionManager {
    pub fn new(clock: Timestamp, next_txn: TxnId) -> Self {
        Self {
            clock: AtomicU64::new(clock),
            next_txn: AtomicU64::new(next_txn.max(1)),
            active: Mutex::new(AHashMap::new()),
            stamped: Condvar::new(),
        }
    }

    /// Register a new transaction, returning its id and start timestamp
    pub fn begin(&self) -> (TxnId, Timestamp) {
        let mut active = self.active.lock();
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        let start_ts = self.visible(&active);
        active.insert(
            id,
            ActiveTxn {
                start_ts,
                first_lsn: None,
                commit_ts: None,
            },
        );
        (id, start_ts)
    }

    /// Remember where a transaction's log records start
    pub fn note_first_lsn(&self, txn: TxnId, lsn: Lsn) {
        if let Some(entry) = self.active.lock().get_mut(&txn) {
            entry.first_lsn.get_or_insert(lsn);
        }
    }

    /// Take the next commit timestamp for `txn`
    pub fn next_commit_ts(&self, txn: TxnId) -> Timestamp {
        let mut active = self.active.lock();
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(entry) = active.get_mut(&txn) {
            entry.commit_ts = Some(ts);
        }
        ts
    }

    /// Remove a transaction from the active set
    pub fn finish(&self, txn: TxnId) {
        let removed = self.active.lock().remove(&txn);
        if removed.is_some_and(|entry| entry.commit_ts.is_some()) {
            self.stamped.notify_all();
        }
    }

    /// Block until every commit timestamp below `ts` has been stamped.
    ///
    /// Must not be called while holding latches a stamping commit needs.
    pub fn wait_visible(&self, ts: Timestamp) {
        let mut active = self.active.lock();
        while self.visible(&active) < ts {
            self.stamped.wait(&mut active);
        }
    }

    /// Newest commit timestamp whose commit, and every earlier one, is fully stamped
    pub fn visible_ts(&self) -> Timestamp {
        self.visible(&self.active.lock())
    }

    fn visible(&self, active: &AHashMap<TxnId, ActiveTxn>) -> Timestamp {
        active
            .values()
            .filter_map(|txn| txn.commit_ts)
            .map(|ts| ts - 1)
            .fold(self.clock.load(Ordering::SeqCst), Timestamp::min)
    }

    pub fn clock(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn next_txn(&self) -> TxnId {
        self.next_txn.load(Ordering::SeqCst)
    }

    /// Oldest start timestamp among running transactions, or the clock when
    /// none is running. Every snapshot still in use sees all commits at or
    /// below this value.
    pub fn low_watermark(&self) -> Timestamp {
        let active = self.active.lock();
        let clock = self.clock.load(Ordering::SeqCst);
        active
            .values()
            .map(|txn| txn.start_ts)
            .min()
            .unwrap_or(clock)
    }

    /// Running transactions that have logged something, with their first LSN
    pub fn active_for_checkpoint(&self) -> Vec<(TxnId, Lsn)> {
        let mut list: Vec<(TxnId, Lsn)> = self
            .active
            .lock()
            .iter()
            .filter_map(|(id, txn)| txn.first_lsn.map(|lsn| (*id, lsn)))
            .collect();
        list.sort_unstable();
        list
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_begin_and_commit_ts() {
        let tm = TransactionManager::new(0, 1);
        let (t1, s1) = tm.begin();
        let (t2, s2) = tm.begin();
        assert_eq!((t1, t2), (1, 2));
        assert_eq!((s1, s2), (0, 0));

        assert_eq!(tm.next_commit_ts(t1), 1);
        tm.finish(t1);
        assert_eq!(tm.next_commit_ts(t2), 2);

        // t2 is still stamping, so its commit is not in the new snapshot
        let (_, s3) = tm.begin();
        assert_eq!(s3, 1);
        tm.finish(t2);
        let (_, s4) = tm.begin();
        assert_eq!(s4, 2);
    }

    #[test]
    fn test_later_commit_waits_for_earlier_stamping() {
        let tm = Arc::new(TransactionManager::new(0, 1));
        let (t1, _) = tm.begin();
        let (t2, _) = tm.begin();
        assert_eq!(tm.next_commit_ts(t1), 1);
        assert_eq!(tm.next_commit_ts(t2), 2);
        tm.finish(t2);

        // t1 is still stamping, so neither commit is visible yet
        assert_eq!(tm.visible_ts(), 0);
        let (t3, s3) = tm.begin();
        assert_eq!(s3, 0);
        tm.finish(t3);

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = {
            let tm = Arc::clone(&tm);
            thread::spawn(move || {
                tm.wait_visible(2);
                done_tx.send(()).unwrap();
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

        tm.finish(t1);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();

        let (_, s4) = tm.begin();
        assert_eq!(s4, 2);
    }

    #[test]
    fn test_wait_visible_ignores_later_commits() {
        let tm = TransactionManager::new(0, 1);
        let (t1, _) = tm.begin();
        let (t2, _) = tm.begin();
        let ts1 = tm.next_commit_ts(t1);
        tm.next_commit_ts(t2);
        tm.finish(t1);
        // t2 holds a later timestamp and does not block t1
        tm.wait_visible(ts1);
        assert_eq!(tm.visible_ts(), 1);
        tm.finish(t2);
        assert_eq!(tm.visible_ts(), 2);
    }

    #[test]
    fn test_low_watermark() {
        let tm = TransactionManager::new(10, 1);
        assert_eq!(tm.low_watermark(), 10);

        let (t1, _) = tm.begin();
        let (t0, _) = tm.begin();
        tm.next_commit_ts(t0);
        tm.finish(t0);
        let (t3, _) = tm.begin();
        tm.next_commit_ts(t3);
        tm.finish(t3);
        let (t2, _) = tm.begin();
        assert_eq!(tm.low_watermark(), 10);

        tm.finish(t1);
        assert_eq!(tm.low_watermark(), 12);
        tm.finish(t2);
        assert_eq!(tm.low_watermark(), 12);
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    fn test_active_for_checkpoint() {
        let tm = TransactionManager::new(0, 5);
        let (reader, _) = tm.begin();
        let (writer, _) = tm.begin();
        tm.note_first_lsn(writer, 80);
        tm.note_first_lsn(writer, 120);

        assert_eq!(tm.active_for_checkpoint(), vec![(writer, 80)]);
        tm.finish(reader);
        tm.finish(writer);
        assert!(tm.active_for_checkpoint().is_empty());
    }
}
