use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::Query;
use crate::database::{Transaction, run_in_transaction};
use crate::error::{DbError, DbResult};

/// One queued query operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOp {
    Insert(Vec<i64>),
    Select {
        key: i64,
        column: usize,
        projection: Vec<bool>,
        relative_version: i64,
    },
    Update {
        key: i64,
        values: Vec<Option<i64>>,
    },
    Delete(i64),
    Sum {
        start: i64,
        end: i64,
        column: usize,
        relative_version: i64,
    },
    Increment {
        key: i64,
        column: usize,
    },
}

impl QueryOp {
    fn apply(&self, query: &Query, txn: &mut Transaction) -> DbResult<()> {
        match self {
            QueryOp::Insert(values) => query.insert_in(txn, values).map(drop),
            QueryOp::Select {
                key,
                column,
                projection,
                relative_version,
            } => query
                .select_version_in(txn, *key, *column, projection, *relative_version)
                .map(drop),
            QueryOp::Update { key, values } => query.update_in(txn, *key, values),
            QueryOp::Delete(key) => query.delete_in(txn, *key),
            QueryOp::Sum {
                start,
                end,
                column,
                relative_version,
            } => query
                .sum_version_in(txn, *start, *end, *column, *relative_version)
                .map(drop),
            QueryOp::Increment { key, column } => query.increment_in(txn, *key, *column),
        }
    }
}

/// Operations run together in one transaction
#[derive(Clone, Default)]
pub struct QueryTransaction {
    queries: Vec<(Query, QueryOp)>,
}

impl QueryTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_query(&mut self, query: &Query, op: QueryOp) {
        self.queries.push((query.clone(), op));
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Run every operation, committing if all succeed. Returns whether the
    /// transaction committed.
    pub fn run(&self) -> bool {
        match self.try_run() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "queued transaction aborted");
                false
            }
        }
    }

    /// Like [`QueryTransaction::run`], returning the error that aborted the transaction
    pub fn try_run(&self) -> DbResult<()> {
        let Some((first, _)) = self.queries.first() else {
            return Ok(());
        };
        run_in_transaction(first.engine(), |txn| {
            for (query, op) in &self.queries {
                op.apply(query, txn)?;
            }
            Ok(())
        })
    }
}

/// Per-worker results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub committed: usize,
    pub aborted: usize,
    /// Reruns after a retryable failure
    pub retries: usize,
    /// Whether each queued transaction finally committed, in queue order
    pub outcomes: Vec<bool>,
}

/// Runs queued transactions on its own thread
pub struct TransactionWorker {
    transactions: Vec<QueryTransaction>,
    max_retries: usize,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl TransactionWorker {
    /// A worker that reruns a transaction up to `max_retries` times after a
    /// lock conflict or a full buffer pool
    pub fn new(max_retries: usize) -> Self {
        Self {
            transactions: Vec::new(),
            max_retries,
            handle: None,
        }
    }

    pub fn add_transaction(&mut self, transaction: QueryTransaction) {
        self.transactions.push(transaction);
    }

    /// Start running the queued transactions
    pub fn run(&mut self) -> DbResult<()> {
        let transactions = std::mem::take(&mut self.transactions);
        let max_retries = self.max_retries;
        let handle = thread::Builder::new()
            .name("lstore-worker".to_string())
            .spawn(move || run_all(&transactions, max_retries))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Wait for the worker. A worker that was never started runs its queue
    /// on the calling thread.
    pub fn join(&mut self) -> WorkerStats {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                tracing::warn!("transaction worker panicked");
                WorkerStats::default()
            }),
            None => run_all(&std::mem::take(&mut self.transactions), self.max_retries),
        }
    }
}

fn run_all(transactions: &[QueryTransaction], max_retries: usize) -> WorkerStats {
    let mut stats = WorkerStats::default();
    for transaction in transactions {
        let mut attempt = 0;
        let committed = loop {
            match transaction.try_run() {
                Ok(()) => break true,
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    stats.retries += 1;
                    thread::sleep(backoff(attempt));
                }
                Err(e) => {
                    if !matches!(e, DbError::LockConflict(_)) {
                        tracing::debug!(error = %e, "queued transaction failed");
                    }
                    break false;
                }
            }
        };
        if committed {
            stats.committed += 1;
        } else {
            stats.aborted += 1;
        }
        stats.outcomes.push(committed);
    }
    stats
}

fn backoff(attempt: usize) -> Duration {
    Duration::from_micros(50 << attempt.min(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::database::Database;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database, Query) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        let query = Query::new(&db, table);
        (temp_dir, db, query)
    }

    #[test]
    fn test_query_transaction_commits() {
        let (_temp, _db, query) = setup();
        let mut txn = QueryTransaction::new();
        txn.add_query(&query, QueryOp::Insert(vec![1, 0, 0]));
        txn.add_query(&query, QueryOp::Increment { key: 1, column: 1 });
        assert!(txn.run());
        assert_eq!(query.select(1, 0, &[true; 3]).unwrap()[0].columns[1], Some(1));
    }

    #[test]
    fn test_query_transaction_aborts_on_failure() {
        let (_temp, _db, query) = setup();
        let mut txn = QueryTransaction::new();
        txn.add_query(&query, QueryOp::Insert(vec![1, 0, 0]));
        txn.add_query(&query, QueryOp::Delete(2));
        assert!(!txn.run());
        assert!(query.select(1, 0, &[true; 3]).unwrap().is_empty());
    }

    #[test]
    fn test_worker_runs_queue() {
        let (_temp, _db, query) = setup();
        for key in 0..5 {
            query.insert(&[key, 0, 0]).unwrap();
        }

        let mut worker = TransactionWorker::new(10);
        for key in 0..5 {
            let mut txn = QueryTransaction::new();
            txn.add_query(&query, QueryOp::Increment { key, column: 2 });
            worker.add_transaction(txn);
        }
        let mut bad = QueryTransaction::new();
        bad.add_query(&query, QueryOp::Delete(42));
        worker.add_transaction(bad);

        worker.run().unwrap();
        let stats = worker.join();
        assert_eq!(stats.committed, 5);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.outcomes, vec![true, true, true, true, true, false]);
        assert_eq!(query.sum(0, 4, 2).unwrap(), 5);
    }
}
