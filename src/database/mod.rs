//! The storage engine and its public handle.
//!
//! [`Database`] owns an [`Engine`]: the shared buffer pool, log, lock table
//! and transaction manager of one data directory, plus its tables. Opening a
//! database replays the log, so a handle is always in a consistent state.

mod merger;
mod transaction;

#[cfg(test)]
mod tests;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{DbError, DbResult};
use crate::file::{BufferPool, LogFlusher, PagedFileManager};
use crate::lock::LockManager;
use crate::record::{Lsn, Rid, TableId, Timestamp};
use crate::table::{Table, TableStats};
use crate::txn::TransactionManager;
use crate::wal::{
    CheckpointFile, LogBody, LogManager, LogRecord, Recovery, RecoveryReport, RecoveryTarget,
    UpdateOp,
};

pub use merger::MergeTask;
use merger::{MergeMessage, MergeWorker};
pub use transaction::Transaction;

const LOG_FILE: &str = "wal.log";
const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Default)]
struct Tables {
    by_name: AHashMap<String, Arc<Table>>,
    by_id: AHashMap<TableId, Arc<Table>>,
}

impl Tables {
    fn insert(&mut self, table: Arc<Table>) {
        self.by_id.insert(table.id(), Arc::clone(&table));
        self.by_name.insert(table.name().to_string(), table);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Table>> {
        let table = self.by_name.remove(name)?;
        self.by_id.remove(&table.id());
        Some(table)
    }
}

/// Applies recovered log records to the tables that still exist
struct Replay<'a> {
    tables: &'a Tables,
}

impl Replay<'_> {
    fn table(&self, op: &UpdateOp) -> Option<&Arc<Table>> {
        self.tables.by_id.get(&op.table())
    }
}

impl RecoveryTarget for Replay<'_> {
    fn register(&self, op: &UpdateOp) -> DbResult<()> {
        match self.table(op) {
            Some(table) => table.register(op),
            None => Ok(()),
        }
    }

    fn redo(&self, op: &UpdateOp, commit_ts: Timestamp, lsn: Lsn) -> DbResult<()> {
        match self.table(op) {
            Some(table) => table.redo(op, commit_ts, lsn),
            None => Ok(()),
        }
    }

    fn undo(&self, op: &UpdateOp) -> DbResult<()> {
        match self.table(op) {
            Some(table) => table.undo(op, 0),
            None => Ok(()),
        }
    }
}

/// Shared state of an open database
pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
    catalog: Mutex<Catalog>,
    tables: RwLock<Tables>,
    pool: Arc<BufferPool>,
    log: Arc<LogManager>,
    locks: LockManager,
    txns: TransactionManager,
    /// Held shared by every record operation, exclusively by a checkpoint
    quiesce: RwLock<()>,
    merger: Mutex<Option<MergeWorker>>,
    closed: AtomicBool,
}

impl Engine {
    fn open(root: &Path, config: EngineConfig) -> DbResult<(Arc<Self>, RecoveryReport)> {
        config.validate()?;
        fs::create_dir_all(root)?;

        let (log, records) = LogManager::open(root.join(LOG_FILE), config.sync_mode)?;
        let log = Arc::new(log);
        let pool = Arc::new(BufferPool::new(
            PagedFileManager::new(config.page_size),
            config.buffer_pool_pages,
            Some(Arc::clone(&log) as Arc<dyn LogFlusher>),
        ));

        let catalog = Catalog::load(root)?;
        let mut tables = Tables::default();
        for meta in catalog.tables.values() {
            let dir = root.join(&meta.name);
            let table = Table::open(meta.clone(), &dir, Arc::clone(&pool), &config)?;
            tables.insert(Arc::new(table));
        }

        let report = Recovery::new(&records).run(&Replay { tables: &tables })?;
        let checkpoint = CheckpointFile::load(root.join(CHECKPOINT_FILE))?.unwrap_or_default();
        for table in tables.by_id.values() {
            table.finish_recovery()?;
        }

        let engine = Arc::new(Self {
            root: root.to_path_buf(),
            config,
            catalog: Mutex::new(catalog),
            tables: RwLock::new(tables),
            pool,
            log,
            locks: LockManager::new(),
            txns: TransactionManager::new(
                report.clock.max(checkpoint.clock),
                report.next_txn.max(checkpoint.next_txn),
            ),
            quiesce: RwLock::new(()),
            merger: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        *engine.merger.lock() = Some(MergeWorker::spawn(Arc::downgrade(&engine))?);

        engine.checkpoint()?;
        for table in engine.tables() {
            table.sweep_orphans()?;
        }
        Ok((engine, report))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn txns(&self) -> &TransactionManager {
        &self.txns
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn begin(self: &Arc<Self>) -> DbResult<Transaction> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        let (id, start_ts) = self.txns.begin();
        Ok(Transaction::new(id, start_ts, Arc::clone(self)))
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().by_name.get(name).cloned()
    }

    pub fn table_by_id(&self, id: TableId) -> Option<Arc<Table>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Every table, ordered by id
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<Arc<Table>> = self.tables.read().by_id.values().cloned().collect();
        tables.sort_unstable_by_key(|table| table.id());
        tables
    }

    pub fn create_table(
        &self,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> DbResult<Arc<Table>> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        let mut catalog = self.catalog.lock();
        if let Some(table) = self.table(name) {
            return Ok(table);
        }

        let meta = catalog.add_table(name, num_columns, key_column)?;
        let table = match Table::open(meta, &self.root.join(name), Arc::clone(&self.pool), &self.config) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                catalog.remove_table(name)?;
                return Err(e);
            }
        };
        catalog.save(&self.root)?;
        self.tables.write().insert(Arc::clone(&table));
        tracing::info!(table = name, id = table.id(), num_columns, key_column, "created table");
        Ok(table)
    }

    /// Remove a table with all its pages. Transactions must not have
    /// uncommitted writes on it.
    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        let _quiesce = self.quiesce.write();
        let mut catalog = self.catalog.lock();
        catalog.remove_table(name)?;
        catalog.save(&self.root)?;

        if let Some(table) = self.tables.write().remove(name) {
            self.pool.drop_file(table.file())?;
        }
        let dir = self.root.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        tracing::info!(table = name, "dropped table");
        Ok(())
    }

    /// Flush every dirty page, persist the table directories and log a
    /// checkpoint record, returning its LSN
    pub fn checkpoint(&self) -> DbResult<Lsn> {
        let _quiesce = self.quiesce.write();
        self.pool.flush_all()?;
        for table in self.tables() {
            table.persist()?;
        }

        let clock = self.txns.clock();
        let next_txn = self.txns.next_txn();
        let active = self.txns.active_for_checkpoint();
        let active_count = active.len();
        let record = LogRecord::new(
            0,
            LogBody::Checkpoint {
                clock,
                next_txn,
                active,
            },
        );
        let lsn = self.log.append(&record)?;
        CheckpointFile {
            lsn,
            clock,
            next_txn,
        }
        .store(self.root.join(CHECKPOINT_FILE))?;

        tracing::info!(lsn, clock, active = active_count, "checkpoint");
        Ok(lsn)
    }

    fn submit_merge(&self, task: MergeTask) -> bool {
        let sender = match self.merger.lock().as_ref() {
            Some(worker) => worker.sender(),
            None => return false,
        };
        let sent = sender.send(MergeMessage::Merge(task)).is_ok();
        if sent {
            tracing::debug!(table = task.table, range = task.range, "queued merge");
        }
        sent
    }

    /// Block until every merge queued so far has finished
    pub fn wait_for_merges(&self) {
        let sender = match self.merger.lock().as_ref() {
            Some(worker) => worker.sender(),
            None => return,
        };
        let (done, wait) = std::sync::mpsc::channel();
        if sender.send(MergeMessage::Barrier(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    /// Merge one range now, on the calling thread
    pub fn merge_now(&self, table: &Table, range: u32) -> DbResult<()> {
        let outcome = {
            let _quiesce = self.quiesce.read();
            let watermark = self.txns.low_watermark();
            table.merge_range(range, watermark)?
        };
        if !outcome.retired.is_empty() {
            self.checkpoint()?;
            table.discard_pages(&outcome.retired)?;
        }
        tracing::info!(
            table = %table.name(),
            range,
            folded = outcome.folded,
            merged_ts = outcome.merged_ts,
            retired = outcome.retired.len(),
            "merge completed"
        );
        Ok(())
    }

    pub(crate) fn run_merge(&self, task: MergeTask) {
        let Some(table) = self.table_by_id(task.table) else {
            return;
        };
        let Some(range) = table.range(task.range) else {
            return;
        };
        match self.merge_now(&table, task.range) {
            Ok(()) => range.end_merge(true),
            Err(e) => {
                tracing::warn!(table = %table.name(), range = task.range, error = %e, "merge failed");
                range.end_merge(false);
            }
        }
    }

    fn stop_merger(&self) {
        let worker = self.merger.lock().take();
        if let Some(worker) = worker {
            worker.shutdown();
        }
    }
}

/// Handle to an open database directory
pub struct Database {
    engine: Arc<Engine>,
}

impl Database {
    /// Open the database at `path`, creating it if needed, and recover it
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> DbResult<Self> {
        let (engine, report) = Engine::open(path.as_ref(), config)?;
        tracing::info!(
            path = %path.as_ref().display(),
            tables = engine.tables().len(),
            "opened database, recovered {report}"
        );
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stop background merges and checkpoint. Later calls do nothing.
    pub fn close(&self) -> DbResult<()> {
        if self.engine.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.stop_merger();
        self.engine.checkpoint()?;
        tracing::info!(path = %self.engine.root.display(), "closed database");
        Ok(())
    }

    /// Drop the database as a crash would: unwritten pages and unflushed log
    /// records are lost
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        self.engine.closed.store(true, Ordering::Release);
        self.engine.stop_merger();
        self.engine.pool.discard_all();
    }

    /// Create a table, or return the existing table of that name
    pub fn create_table(&self, name: &str, num_columns: usize, key_column: usize) -> DbResult<Arc<Table>> {
        self.engine.create_table(name, num_columns, key_column)
    }

    pub fn get_table(&self, name: &str) -> DbResult<Arc<Table>> {
        self.engine
            .table(name)
            .ok_or_else(|| crate::catalog::CatalogError::TableNotFound(name.to_string()).into())
    }

    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        self.engine.drop_table(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.engine
            .tables()
            .iter()
            .map(|table| table.name().to_string())
            .collect()
    }

    pub fn table_stats(&self) -> Vec<(String, TableStats)> {
        self.engine
            .tables()
            .iter()
            .map(|table| (table.name().to_string(), table.stats()))
            .collect()
    }

    pub fn begin(&self) -> DbResult<Transaction> {
        self.engine.begin()
    }

    pub fn insert(&self, txn: &mut Transaction, table: &Arc<Table>, values: &[i64]) -> DbResult<Rid> {
        self.engine.insert(txn, table, values)
    }

    pub fn read(
        &self,
        txn: &mut Transaction,
        table: &Table,
        rid: Rid,
        columns: &[usize],
    ) -> DbResult<Vec<i64>> {
        self.engine.read(txn, table, rid, columns)
    }

    pub fn update(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        rid: Rid,
        values: &[Option<i64>],
    ) -> DbResult<()> {
        self.engine.update(txn, table, rid, values)
    }

    pub fn delete(&self, txn: &mut Transaction, table: &Arc<Table>, rid: Rid) -> DbResult<()> {
        self.engine.delete(txn, table, rid)
    }

    pub fn commit(&self, txn: &mut Transaction) -> DbResult<()> {
        self.engine.commit(txn)
    }

    pub fn abort(&self, txn: &mut Transaction) -> DbResult<()> {
        self.engine.abort(txn)
    }

    /// Run `f` in a new transaction, committing on success and aborting on error
    pub fn run<T>(&self, f: impl FnOnce(&mut Transaction) -> DbResult<T>) -> DbResult<T> {
        run_in_transaction(&self.engine, f)
    }

    pub fn read_as_of(
        &self,
        table: &Table,
        rid: Rid,
        columns: &[usize],
        ts: Timestamp,
    ) -> DbResult<Vec<i64>> {
        self.engine.read_as_of(table, rid, columns, ts)
    }

    pub fn checkpoint(&self) -> DbResult<Lsn> {
        self.engine.checkpoint()
    }

    pub fn wait_for_merges(&self) {
        self.engine.wait_for_merges()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close database cleanly");
        }
    }
}

pub(crate) fn run_in_transaction<T>(
    engine: &Arc<Engine>,
    f: impl FnOnce(&mut Transaction) -> DbResult<T>,
) -> DbResult<T> {
    let mut txn = engine.begin()?;
    match f(&mut txn) {
        Ok(value) => {
            engine.commit(&mut txn)?;
            Ok(value)
        }
        Err(e) => {
            if txn.is_active() {
                engine.abort(&mut txn)?;
            }
            Err(e)
        }
    }
}
