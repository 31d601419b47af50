//! Ordered primary-key index.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::RangeBounds;

use crate::error::{DbError, DbResult};
use crate::record::Rid;

/// Maps primary key values to RIDs.
///
/// A key is claimed when its insert is performed, not when it commits, so two
/// transactions can never insert the same key. Keys of deleted records are
/// released when the delete commits.
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    map: RwLock<BTreeMap<i64, Rid>>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` now belongs to `rid`
    pub fn notify_insert(&self, key: i64, rid: Rid) -> DbResult<()> {
        let mut map = self.map.write();
        match map.get(&key) {
            Some(existing) if *existing != rid => Err(DbError::DuplicateKey(key)),
            _ => {
                map.insert(key, rid);
                Ok(())
            }
        }
    }

    /// Drop `key` if it still belongs to `rid`
    pub fn notify_delete(&self, key: i64, rid: Rid) {
        let mut map = self.map.write();
        if map.get(&key) == Some(&rid) {
            map.remove(&key);
        }
    }

    pub fn lookup(&self, key: i64) -> Option<Rid> {
        self.map.read().get(&key).copied()
    }

    /// RIDs of all keys in `range`, in key order
    pub fn range_lookup<R: RangeBounds<i64>>(&self, range: R) -> Vec<(i64, Rid)> {
        self.map
            .read()
            .range(range)
            .map(|(key, rid)| (*key, *rid))
            .collect()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
