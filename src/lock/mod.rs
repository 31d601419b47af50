//! Record lock table with two-phase locking and NO-WAIT conflict handling.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::fmt;
use thiserror::Error;

use crate::record::{Rid, TableId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// A lockable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub table: TableId,
    pub rid: Rid,
}

/// The requester must abort: the lock is held in an incompatible mode
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction {txn} cannot take {requested} on table {table} rid {rid}")]
pub struct LockConflict {
    pub txn: TxnId,
    pub table: TableId,
    pub rid: Rid,
    pub requested: LockMode,
}

#[derive(Debug)]
struct LockState {
    mode: LockMode,
    holders: AHashSet<TxnId>,
}

/// Outcome of checking a request against the current lock state
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    /// Already held in a mode that covers the request
    Held,
    Grant,
    Upgrade,
    Conflict,
}

fn compatible(state: &LockState, txn: TxnId, requested: LockMode) -> Decision {
    let holds = state.holders.contains(&txn);
    match (state.mode, requested) {
        (LockMode::Shared, LockMode::Shared) if holds => Decision::Held,
        (LockMode::Shared, LockMode::Shared) => Decision::Grant,
        (LockMode::Exclusive, _) if holds => Decision::Held,
        (LockMode::Shared, LockMode::Exclusive) if holds && state.holders.len() == 1 => {
            Decision::Upgrade
        }
        _ => Decision::Conflict,
    }
}

#[derive(Default)]
struct LockTable {
    locks: AHashMap<LockKey, LockState>,
    /// Keys held by each transaction, for release at commit or abort
    owned: AHashMap<TxnId, Vec<LockKey>>,
}

/// Per-record shared/exclusive locks.
///
/// A request that conflicts is refused immediately instead of queued, so no
/// thread ever waits on a record lock and deadlock cannot occur. Locks are
/// released only all at once, through [`LockManager::release_all`].
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, txn: TxnId, key: LockKey, mode: LockMode) -> Result<(), LockConflict> {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        let decision = match table.locks.get(&key) {
            None => Decision::Grant,
            Some(state) => compatible(state, txn, mode),
        };

        match decision {
            Decision::Held => Ok(()),
            Decision::Upgrade => {
                if let Some(state) = table.locks.get_mut(&key) {
                    state.mode = LockMode::Exclusive;
                }
                Ok(())
            }
            Decision::Grant => {
                let state = table.locks.entry(key).or_insert_with(|| LockState {
                    mode,
                    holders: AHashSet::new(),
                });
                state.holders.insert(txn);
                table.owned.entry(txn).or_default().push(key);
                Ok(())
            }
            Decision::Conflict => Err(LockConflict {
                txn,
                table: key.table,
                rid: key.rid,
                requested: mode,
            }),
        }
    }

    /// Release every lock held by `txn`, returning how many were held
    pub fn release_all(&self, txn: TxnId) -> usize {
        let mut table = self.table.lock();
        let Some(keys) = table.owned.remove(&txn) else {
            return 0;
        };

        for key in &keys {
            let empty = match table.locks.get_mut(key) {
                Some(state) => {
                    state.holders.remove(&txn);
                    state.holders.is_empty()
                }
                None => panic!("lock table lost {key:?} held by transaction {txn}"),
            };
            if empty {
                table.locks.remove(key);
            }
        }
        keys.len()
    }

    /// Current mode and holders of a key
    pub fn holders(&self, key: LockKey) -> Option<(LockMode, Vec<TxnId>)> {
        let table = self.table.lock();
        table.locks.get(&key).map(|state| {
            let mut holders: Vec<TxnId> = state.holders.iter().copied().collect();
            holders.sort_unstable();
            (state.mode, holders)
        })
    }

    /// Number of locks held by `txn`
    pub fn held_by(&self, txn: TxnId) -> usize {
        self.table.lock().owned.get(&txn).map_or(0, Vec::len)
    }

    /// Number of locked keys
    pub fn len(&self) -> usize {
        self.table.lock().locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn key(rid: Rid) -> LockKey {
        LockKey { table: 1, rid }
    }

    #[test]
    fn test_shared_locks_are_compatible() {
        let locks = LockManager::new();
        locks.acquire(1, key(10), LockMode::Shared).unwrap();
        locks.acquire(2, key(10), LockMode::Shared).unwrap();

        let (mode, holders) = locks.holders(key(10)).unwrap();
        assert_eq!(mode, LockMode::Shared);
        assert_eq!(holders, vec![1, 2]);
    }

    #[test]
    fn test_exclusive_conflicts() {
        let locks = LockManager::new();
        locks.acquire(1, key(10), LockMode::Exclusive).unwrap();

        let err = locks.acquire(2, key(10), LockMode::Shared).unwrap_err();
        assert_eq!(err.txn, 2);
        assert_eq!(err.requested, LockMode::Shared);
        assert!(locks.acquire(2, key(10), LockMode::Exclusive).is_err());

        // re-requesting a held lock is a no-op
        locks.acquire(1, key(10), LockMode::Shared).unwrap();
        locks.acquire(1, key(10), LockMode::Exclusive).unwrap();
        assert_eq!(locks.held_by(1), 1);
    }

    #[test]
    fn test_upgrade_only_for_sole_holder() {
        let locks = LockManager::new();
        locks.acquire(1, key(5), LockMode::Shared).unwrap();
        locks.acquire(1, key(5), LockMode::Exclusive).unwrap();
        assert_eq!(locks.holders(key(5)).unwrap().0, LockMode::Exclusive);

        locks.acquire(2, key(6), LockMode::Shared).unwrap();
        locks.acquire(3, key(6), LockMode::Shared).unwrap();
        assert!(locks.acquire(2, key(6), LockMode::Exclusive).is_err());
    }

    #[test]
    fn test_release_all() {
        let locks = LockManager::new();
        locks.acquire(1, key(1), LockMode::Exclusive).unwrap();
        locks.acquire(1, key(2), LockMode::Shared).unwrap();
        locks.acquire(2, key(2), LockMode::Shared).unwrap();

        assert_eq!(locks.release_all(1), 2);
        assert_eq!(locks.release_all(1), 0);
        assert!(locks.holders(key(1)).is_none());
        assert_eq!(locks.holders(key(2)).unwrap().1, vec![2]);

        locks.acquire(3, key(1), LockMode::Exclusive).unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_concurrent_exclusive_exactly_one_wins() {
        for _ in 0..50 {
            let locks = Arc::new(LockManager::new());
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (1..=2)
                .map(|txn| {
                    let locks = Arc::clone(&locks);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        locks.acquire(txn, key(99), LockMode::Exclusive).is_ok()
                    })
                })
                .collect();

            let granted: usize = handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum();
            assert_eq!(granted, 1);
        }
    }
}
