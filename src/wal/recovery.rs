use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use super::log_manager::LOG_HEADER_LEN;
use super::record::{LogBody, LogRecord, UpdateOp};
use crate::error::DbResult;
use crate::record::{Lsn, Timestamp, TxnId};

/// Master record pointing at the last completed checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub lsn: Lsn,
    pub clock: Timestamp,
    pub next_txn: TxnId,
}

impl CheckpointFile {
    /// Load the checkpoint file, or `None` if no checkpoint was taken yet
    pub fn load<P: AsRef<Path>>(path: P) -> DbResult<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the checkpoint file atomically
    pub fn store<P: AsRef<Path>>(&self, path: P) -> DbResult<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Applies recovered log records to the storage layer
pub trait RecoveryTarget {
    /// Make the pages, directory entries and counters an update refers to
    /// known to the store, whatever the fate of its transaction
    fn register(&self, op: &UpdateOp) -> DbResult<()>;

    /// Reapply a committed update and stamp it with `commit_ts`
    fn redo(&self, op: &UpdateOp, commit_ts: Timestamp, lsn: Lsn) -> DbResult<()>;

    /// Roll back an update of a transaction that never committed
    fn undo(&self, op: &UpdateOp) -> DbResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Analyze,
    Redo,
    Undo,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    InFlight,
    Committed(Timestamp),
    Aborted,
}

/// Summary of one recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub checkpoint_lsn: Option<Lsn>,
    /// Records examined from the scan start
    pub scanned: usize,
    pub winners: usize,
    pub losers: usize,
    pub redone: usize,
    pub undone: usize,
    /// Highest commit timestamp seen
    pub clock: Timestamp,
    /// First transaction id that is free to use
    pub next_txn: TxnId,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.checkpoint_lsn {
            Some(lsn) => write!(f, "from checkpoint at lsn {lsn}: ")?,
            None => write!(f, "from start of log: ")?,
        }
        write!(
            f,
            "{} records, {} committed and {} rolled back transactions, {} redone, {} undone",
            self.scanned, self.winners, self.losers, self.redone, self.undone
        )
    }
}

/// Two-pass crash recovery over the records of one log.
///
/// `Analyze` finds the last checkpoint and classifies every transaction
/// seen after the scan start. `Redo` reapplies committed updates that may be
/// missing from disk. `Undo` rolls back, newest first, every update whose
/// transaction has no commit record.
pub struct Recovery<'a> {
    records: &'a [(Lsn, LogRecord)],
    phase: RecoveryPhase,
    scan_from: usize,
    checkpoint_lsn: Option<Lsn>,
    /// Transactions running when the checkpoint was taken
    checkpoint_active: AHashSet<TxnId>,
    outcomes: AHashMap<TxnId, Outcome>,
    report: RecoveryReport,
}

impl<'a> Recovery<'a> {
    pub fn new(records: &'a [(Lsn, LogRecord)]) -> Self {
        Self {
            records,
            phase: RecoveryPhase::Analyze,
            scan_from: 0,
            checkpoint_lsn: None,
            checkpoint_active: AHashSet::new(),
            outcomes: AHashMap::new(),
            report: RecoveryReport {
                next_txn: 1,
                ..Default::default()
            },
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Run the current phase and move to the next one
    pub fn step<T: RecoveryTarget>(&mut self, target: &T) -> DbResult<RecoveryPhase> {
        self.phase = match self.phase {
            RecoveryPhase::Analyze => {
                self.analyze();
                RecoveryPhase::Redo
            }
            RecoveryPhase::Redo => {
                self.redo(target)?;
                RecoveryPhase::Undo
            }
            RecoveryPhase::Undo => {
                self.undo(target)?;
                RecoveryPhase::Done
            }
            RecoveryPhase::Done => RecoveryPhase::Done,
        };
        Ok(self.phase)
    }

    pub fn run<T: RecoveryTarget>(mut self, target: &T) -> DbResult<RecoveryReport> {
        while self.phase != RecoveryPhase::Done {
            self.step(target)?;
        }
        Ok(self.report)
    }

    fn analyze(&mut self) {
        let mut scan_lsn = LOG_HEADER_LEN;

        let checkpoint = self
            .records
            .iter()
            .rev()
            .find_map(|(lsn, record)| match &record.body {
                LogBody::Checkpoint {
                    clock,
                    next_txn,
                    active,
                } => Some((*lsn, *clock, *next_txn, active)),
                _ => None,
            });

        if let Some((lsn, clock, next_txn, active)) = checkpoint {
            self.checkpoint_lsn = Some(lsn);
            self.report.clock = clock;
            self.report.next_txn = next_txn;
            scan_lsn = active
                .iter()
                .map(|(_, first)| *first)
                .fold(lsn, Lsn::min);
            self.checkpoint_active = active.iter().map(|(txn, _)| *txn).collect();
        }

        self.scan_from = self.records.partition_point(|(lsn, _)| *lsn < scan_lsn);
        self.report.checkpoint_lsn = self.checkpoint_lsn;
        self.report.scanned = self.records.len() - self.scan_from;

        for (_, record) in &self.records[self.scan_from..] {
            if record.txn != 0 {
                self.report.next_txn = self.report.next_txn.max(record.txn + 1);
            }
            match &record.body {
                LogBody::Begin | LogBody::Update(_) => {
                    self.outcomes.entry(record.txn).or_insert(Outcome::InFlight);
                }
                LogBody::Commit { commit_ts } => {
                    self.report.clock = self.report.clock.max(*commit_ts);
                    self.outcomes
                        .insert(record.txn, Outcome::Committed(*commit_ts));
                }
                LogBody::Abort => {
                    self.outcomes.insert(record.txn, Outcome::Aborted);
                }
                LogBody::Checkpoint { .. } => {}
            }
        }

        for outcome in self.outcomes.values() {
            match outcome {
                Outcome::Committed(_) => self.report.winners += 1,
                Outcome::InFlight | Outcome::Aborted => self.report.losers += 1,
            }
        }
    }

    fn updates(&self) -> impl DoubleEndedIterator<Item = (Lsn, TxnId, &'a UpdateOp)> + use<'a> {
        let records: &'a [(Lsn, LogRecord)] = self.records;
        records[self.scan_from..]
            .iter()
            .filter_map(|(lsn, record)| match &record.body {
                LogBody::Update(op) => Some((*lsn, record.txn, op)),
                _ => None,
            })
    }

    fn redo<T: RecoveryTarget>(&mut self, target: &T) -> DbResult<()> {
        for (_, _, op) in self.updates() {
            target.register(op)?;
        }

        for (lsn, txn, op) in self.updates() {
            let Some(Outcome::Committed(commit_ts)) = self.outcomes.get(&txn) else {
                continue;
            };
            // changes logged before the checkpoint reached disk with it,
            // unless their transaction was still running then
            let after_checkpoint = self.checkpoint_lsn.is_none_or(|ckpt| lsn > ckpt);
            if after_checkpoint || self.checkpoint_active.contains(&txn) {
                target.redo(op, *commit_ts, lsn)?;
                self.report.redone += 1;
            }
        }
        Ok(())
    }

    fn undo<T: RecoveryTarget>(&mut self, target: &T) -> DbResult<()> {
        for (_, txn, op) in self.updates().rev() {
            if matches!(self.outcomes.get(&txn), Some(Outcome::Committed(_))) {
                continue;
            }
            target.undo(op)?;
            self.report.undone += 1;
        }
        Ok(())
    }
}
