//! Command line front end for an lstore data directory.
//!
//! Usage:
//!   lstore --data-dir ./data stress --records 1000 --workers 8 --txns 100
//!   lstore --data-dir ./data inspect

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};

use lstore::{Database, DbResult, EngineConfig, Query, QueryOp, QueryTransaction, TransactionWorker};

#[derive(Parser, Debug)]
#[command(name = "lstore", about = "Embedded L-Store storage engine")]
struct Cli {
    /// Database directory, created if missing.
    #[arg(long, default_value = "./lstore-data")]
    data_dir: PathBuf,

    /// JSON engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run concurrent increment transactions and check the totals
    Stress {
        /// Records in the stress table.
        #[arg(long, default_value_t = 1000)]
        records: i64,

        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Transactions per worker.
        #[arg(long, default_value_t = 100)]
        txns: usize,

        /// Reruns of a transaction that hit a lock conflict.
        #[arg(long, default_value_t = 20)]
        retries: usize,
    },
    /// Open and recover the database, then print per-table statistics
    Inspect,
}

const STRESS_TABLE: &str = "stress";
const STRESS_COLUMNS: usize = 5;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> DbResult<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let db = Database::open(&cli.data_dir, config)?;

    match cli.command {
        Command::Stress {
            records,
            workers,
            txns,
            retries,
        } => stress(&db, records, workers, txns, retries)?,
        Command::Inspect => inspect(&db),
    }
    db.close()
}

fn stress(db: &Database, records: i64, workers: usize, txns: usize, retries: usize) -> DbResult<()> {
    let table = db.create_table(STRESS_TABLE, STRESS_COLUMNS, 0)?;
    let query = Query::new(db, table);
    if query.table().stats().records == 0 {
        for key in 0..records {
            query.insert(&[key, 0, 0, 0, 0])?;
        }
    }

    let started = Instant::now();
    let mut runners: Vec<TransactionWorker> = (0..workers)
        .map(|worker| {
            let mut runner = TransactionWorker::new(retries);
            for i in 0..txns {
                let key = ((i * 31 + worker * 17) as i64).rem_euclid(records.max(1));
                let mut txn = QueryTransaction::new();
                for column in 1..STRESS_COLUMNS {
                    txn.add_query(&query, QueryOp::Increment { key, column });
                }
                runner.add_transaction(txn);
            }
            runner
        })
        .collect();
    for runner in &mut runners {
        runner.run()?;
    }

    let mut committed = 0;
    let mut aborted = 0;
    let mut retried = 0;
    for (worker, runner) in runners.iter_mut().enumerate() {
        let stats = runner.join();
        println!(
            "worker {worker}: {} committed, {} aborted, {} retries",
            stats.committed, stats.aborted, stats.retries
        );
        committed += stats.committed;
        aborted += stats.aborted;
        retried += stats.retries;
    }
    let elapsed = started.elapsed();
    println!(
        "{committed} committed, {aborted} aborted, {retried} retries in {:.2?} ({:.0} txn/s)",
        elapsed,
        committed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    let total = query.sum(0, records - 1, 1)?;
    let consistent = (2..STRESS_COLUMNS)
        .map(|column| query.sum(0, records - 1, column))
        .collect::<DbResult<Vec<i64>>>()?
        .iter()
        .all(|sum| *sum == total);
    println!("column totals {} ({total})", if consistent { "agree" } else { "DIVERGE" });
    Ok(())
}

fn inspect(db: &Database) {
    let engine = db.engine();
    println!("data directory: {}", engine.root().display());
    println!(
        "log end lsn: {}, clock: {}, next txn: {}",
        engine.log().end_lsn(),
        engine.txns().clock(),
        engine.txns().next_txn()
    );
    for (name, stats) in db.table_stats() {
        println!(
            "{name}: {} records, {} keys, {} ranges, {} base pages, {} tail pages",
            stats.records, stats.keys, stats.ranges, stats.base_pages, stats.tail_pages
        );
    }
}
