pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod failpoint;
pub mod file;
pub mod index;
pub mod lock;
pub mod query;
pub mod record;
pub mod table;
pub mod txn;
pub mod wal;

pub use config::{EngineConfig, SyncMode};
pub use database::{Database, Engine, MergeTask, Transaction};
pub use error::{DbError, DbResult};
pub use query::{Query, QueryOp, QueryTransaction, Record, TransactionWorker, WorkerStats};
pub use record::{Rid, Timestamp, TxnId};
pub use table::{Table, TableStats};
pub use txn::TxnState;
