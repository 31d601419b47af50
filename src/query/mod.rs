//! Key-based queries over one table.
//!
//! Every operation comes in two forms: `op` runs in its own transaction and
//! commits, `op_in` runs inside a caller's [`Transaction`].

mod worker;

use std::sync::Arc;

use crate::database::{Database, Engine, Transaction, run_in_transaction};
use crate::error::{DbError, DbResult};
use crate::record::Rid;
use crate::table::Table;

pub use worker::{QueryOp, QueryTransaction, TransactionWorker, WorkerStats};

/// A record returned by a select. Columns left out of the projection are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

#[derive(Clone)]
pub struct Query {
    engine: Arc<Engine>,
    table: Arc<Table>,
}

impl Query {
    pub fn new(db: &Database, table: Arc<Table>) -> Self {
        Self::with_engine(Arc::clone(db.engine()), table)
    }

    pub fn with_engine(engine: Arc<Engine>, table: Arc<Table>) -> Self {
        Self { engine, table }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn insert(&self, values: &[i64]) -> DbResult<Rid> {
        run_in_transaction(&self.engine, |txn| self.insert_in(txn, values))
    }

    pub fn insert_in(&self, txn: &mut Transaction, values: &[i64]) -> DbResult<Rid> {
        self.engine.insert(txn, &self.table, values)
    }

    /// Records whose `search_column` equals `search_key`
    pub fn select(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
    ) -> DbResult<Vec<Record>> {
        self.select_version(search_key, search_column, projection, 0)
    }

    pub fn select_in(
        &self,
        txn: &mut Transaction,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
    ) -> DbResult<Vec<Record>> {
        self.select_version_in(txn, search_key, search_column, projection, 0)
    }

    pub fn select_version(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
        relative_version: i64,
    ) -> DbResult<Vec<Record>> {
        run_in_transaction(&self.engine, |txn| {
            self.select_version_in(txn, search_key, search_column, projection, relative_version)
        })
    }

    /// Like [`Query::select_in`], reading the version `relative_version`
    /// steps back (`0` latest, `-1` previous)
    pub fn select_version_in(
        &self,
        txn: &mut Transaction,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
        relative_version: i64,
    ) -> DbResult<Vec<Record>> {
        self.table.check_width(projection.len())?;
        self.table.check_column(search_column)?;

        let projected: Vec<usize> = projection
            .iter()
            .enumerate()
            .filter_map(|(column, &wanted)| wanted.then_some(column))
            .collect();
        let mut wanted = projected.clone();
        wanted.push(self.table.key_column());

        let mut records = Vec::new();
        for rid in self.matching(txn, search_key, search_column, relative_version)? {
            let values = match self.engine.read_version(txn, &self.table, rid, &wanted, relative_version) {
                Ok(values) => values,
                Err(DbError::RecordNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let mut columns = vec![None; self.table.num_columns()];
            for (&column, &value) in projected.iter().zip(&values) {
                columns[column] = Some(value);
            }
            records.push(Record {
                rid,
                key: values[projected.len()],
                columns,
            });
        }
        Ok(records)
    }

    /// RIDs whose `column` holds `key`: an index lookup for the key column,
    /// a scan otherwise
    fn matching(
        &self,
        txn: &mut Transaction,
        key: i64,
        column: usize,
        relative_version: i64,
    ) -> DbResult<Vec<Rid>> {
        if column == self.table.key_column() {
            return Ok(self.table.index().lookup(key).into_iter().collect());
        }

        let mut rids = Vec::new();
        for rid in self.table.rids() {
            match self.engine.read_version(txn, &self.table, rid, &[column], relative_version) {
                Ok(values) if values[0] == key => rids.push(rid),
                Ok(_) | Err(DbError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(rids)
    }

    fn rid_for(&self, key: i64) -> DbResult<Rid> {
        self.table.index().lookup(key).ok_or(DbError::KeyNotFound(key))
    }

    pub fn update(&self, key: i64, values: &[Option<i64>]) -> DbResult<()> {
        run_in_transaction(&self.engine, |txn| self.update_in(txn, key, values))
    }

    pub fn update_in(&self, txn: &mut Transaction, key: i64, values: &[Option<i64>]) -> DbResult<()> {
        let rid = self.rid_for(key)?;
        self.engine.update(txn, &self.table, rid, values)
    }

    pub fn delete(&self, key: i64) -> DbResult<()> {
        run_in_transaction(&self.engine, |txn| self.delete_in(txn, key))
    }

    pub fn delete_in(&self, txn: &mut Transaction, key: i64) -> DbResult<()> {
        let rid = self.rid_for(key)?;
        self.engine.delete(txn, &self.table, rid)
    }

    /// Sum of `column` over the records with keys in `start..=end`
    pub fn sum(&self, start: i64, end: i64, column: usize) -> DbResult<i64> {
        self.sum_version(start, end, column, 0)
    }

    pub fn sum_in(&self, txn: &mut Transaction, start: i64, end: i64, column: usize) -> DbResult<i64> {
        self.sum_version_in(txn, start, end, column, 0)
    }

    pub fn sum_version(&self, start: i64, end: i64, column: usize, relative_version: i64) -> DbResult<i64> {
        run_in_transaction(&self.engine, |txn| {
            self.sum_version_in(txn, start, end, column, relative_version)
        })
    }

    pub fn sum_version_in(
        &self,
        txn: &mut Transaction,
        start: i64,
        end: i64,
        column: usize,
        relative_version: i64,
    ) -> DbResult<i64> {
        self.table.check_column(column)?;
        let mut total = 0i64;
        for (_, rid) in self.table.index().range_lookup(start..=end) {
            match self.engine.read_version(txn, &self.table, rid, &[column], relative_version) {
                Ok(values) => total = total.wrapping_add(values[0]),
                Err(DbError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Add one to `column` of the record with `key`
    pub fn increment(&self, key: i64, column: usize) -> DbResult<()> {
        run_in_transaction(&self.engine, |txn| self.increment_in(txn, key, column))
    }

    pub fn increment_in(&self, txn: &mut Transaction, key: i64, column: usize) -> DbResult<()> {
        self.table.check_column(column)?;
        let rid = self.rid_for(key)?;
        let current = self.engine.read(txn, &self.table, rid, &[column])?[0];
        let next = current
            .checked_add(1)
            .ok_or(DbError::ValueOverflow { key, column })?;
        let mut values = vec![None; self.table.num_columns()];
        values[column] = Some(next);
        self.engine.update(txn, &self.table, rid, &values)
    }
}
