//! In-memory view of all suite ledgers, backed by the SQLite database.
//!
//! Every suite has its own writer lock, appends to different suites only meet at the (short)
//! database commit. Readers work on an immutable snapshot of a ledger which only grows after
//! the entry is durably committed, so they never observe an entry that isn't on disk yet.
//! A snapshot still held by a reader is copied before it grows, otherwise it grows in place.

use crate::database::{ConnectionError, SharedConnection};
use benchledger_analysis::{RegressionAlert, Report};
use benchledger_ingest::{
    now_millis, validate_entry, BenchmarkData, Entry, Units, ValidationError,
};
use parking_lot::{FairMutex, RwLock};
use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Suite {suite} already holds commit {commit} ({tool}) with different measurements")]
    ConflictingHistory {
        suite: String,
        commit: String,
        tool: String,
    },
    #[error("Commit {commit} is not part of suite {suite}")]
    UnknownCommit { suite: String, commit: String },
    #[error("Ingestion was cancelled before it was committed")]
    Cancelled,
    #[error("Storage failure: {0}")]
    Storage(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended,
    /// identical measurements were already recorded for this commit and tool
    AlreadyPresent,
}

#[derive(Debug, Clone, Default)]
/// Shared flag to abandon an ingestion; it is only honored up to the commit.
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
/// append only history of one suite
pub struct SuiteLedger {
    name: String,
    entries: Vec<Arc<Entry>>,
    keys: BTreeMap<(String, String), usize>,
    units: Units,
}

impl SuiteLedger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            keys: BTreeMap::new(),
            units: Units::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn units(&self) -> &Units {
        &self.units
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Entry> + ExactSizeIterator + '_ {
        self.entries.iter().map(Arc::as_ref)
    }

    pub fn position(&self, commit: &str, tool: &str) -> Option<usize> {
        self.keys
            .get(&(commit.to_owned(), tool.to_owned()))
            .copied()
    }

    pub fn get(&self, commit: &str, tool: &str) -> Option<&Entry> {
        self.position(commit, tool)
            .map(|position| self.entries[position].as_ref())
    }

    fn push(&mut self, entry: Entry) {
        let (commit, tool) = entry.key();
        let key = (commit.to_owned(), tool.to_owned());

        self.units.record(&entry);
        self.keys.insert(key, self.entries.len());
        self.entries.push(Arc::new(entry));
    }
}

#[derive(Debug)]
struct LedgerSlot {
    writer: FairMutex<()>,
    snapshot: RwLock<Arc<SuiteLedger>>,
}

impl LedgerSlot {
    fn new(ledger: SuiteLedger) -> Self {
        Self {
            writer: FairMutex::new(()),
            snapshot: RwLock::new(Arc::new(ledger)),
        }
    }

    fn snapshot(&self) -> Arc<SuiteLedger> {
        self.snapshot.read().clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    /// first commit of the range, inclusive
    pub from_commit: Option<String>,
    /// last commit of the range, inclusive
    pub to_commit: Option<String>,
    /// earliest entry date in epoch milliseconds, inclusive
    pub since: Option<i64>,
    /// latest entry date in epoch milliseconds, inclusive
    pub until: Option<i64>,
    pub tool: Option<String>,
}

impl QueryFilter {
    pub fn commits(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_commit = Some(from.into());
        self.to_commit = Some(to.into());
        self
    }

    pub fn dates(mut self, since: i64, until: i64) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    fn matches(&self, entry: &Entry) -> bool {
        self.since.map_or(true, |since| entry.date >= since)
            && self.until.map_or(true, |until| entry.date <= until)
            && self.tool.as_ref().map_or(true, |tool| &entry.tool == tool)
    }
}

#[derive(Debug, Clone)]
/// Lazy, restartable result of `HistoryStore::query`, bound to the snapshot it was created from.
pub struct Query {
    ledger: Arc<SuiteLedger>,
    range: Range<usize>,
    filter: QueryFilter,
}

impl Query {
    pub fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.ledger.entries[self.range.clone()]
            .iter()
            .map(Arc::as_ref)
            .filter(|entry| self.filter.matches(entry))
    }
}

impl<'a> IntoIterator for &'a Query {
    type Item = &'a Entry;
    type IntoIter = Box<dyn Iterator<Item = &'a Entry> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[derive(Debug)]
pub struct HistoryStore {
    connection: SharedConnection,
    ledgers: RwLock<BTreeMap<String, Arc<LedgerSlot>>>,
    last_update: AtomicI64,
}

impl HistoryStore {
    /// load every persisted ledger, an empty database yields an empty store
    pub fn open(connection: SharedConnection) -> Result<Self, LedgerError> {
        let mut ledgers = BTreeMap::new();
        let mut counter = 0;

        for (name, entries) in connection.ledgers()? {
            let mut ledger = SuiteLedger::new(name.clone());
            counter += entries.len();
            entries.into_iter().for_each(|entry| ledger.push(entry));

            ledgers.insert(name, Arc::new(LedgerSlot::new(ledger)));
        }

        info!("Loaded {} suites with {counter} entries", ledgers.len());

        Ok(Self {
            last_update: AtomicI64::new(connection.last_update()?.unwrap_or_default()),
            connection,
            ledgers: RwLock::new(ledgers),
        })
    }

    fn slot(&self, suite: &str) -> Arc<LedgerSlot> {
        if let Some(slot) = self.ledgers.read().get(suite) {
            return slot.clone();
        }

        self.ledgers
            .write()
            .entry(suite.to_owned())
            .or_insert_with(|| {
                debug!(suite = %suite, "Created ledger");
                Arc::new(LedgerSlot::new(SuiteLedger::new(suite)))
            })
            .clone()
    }

    /// Snapshot of the ledger of `suite`, created empty if unknown.
    ///
    /// A new ledger only reaches the database with its first entry.
    pub fn get_or_create_ledger(&self, suite: &str) -> Arc<SuiteLedger> {
        self.slot(suite).snapshot()
    }

    pub fn ledger(&self, suite: &str) -> Option<Arc<SuiteLedger>> {
        self.ledgers.read().get(suite).map(|slot| slot.snapshot())
    }

    pub fn suites(&self) -> Vec<String> {
        self.ledgers.read().keys().cloned().collect()
    }

    pub fn len(&self, suite: &str) -> usize {
        self.ledger(suite).map_or(0, |ledger| ledger.len())
    }

    /// epoch milliseconds of the last committed append, zero for a fresh store
    pub fn last_update(&self) -> i64 {
        self.last_update.load(Ordering::SeqCst)
    }

    pub fn append(&self, suite: &str, entry: Entry) -> Result<AppendResult, LedgerError> {
        self.append_checked(suite, entry, &Cancellation::new(), |_, _| Report::default())
            .map(|(result, _)| result)
    }

    /// Append `entry` to `suite` unless its commit and tool are already recorded.
    ///
    /// `detect` runs under the suite's writer lock on the ledger the entry is appended to and only
    /// for entries that are actually new. Its alerts are committed in the same transaction as the
    /// entry.
    #[instrument(level = "debug", skip(self, entry, cancellation, detect), fields(commit = %entry.commit.id, tool = %entry.tool))]
    pub fn append_checked<F>(
        &self,
        suite: &str,
        entry: Entry,
        cancellation: &Cancellation,
        detect: F,
    ) -> Result<(AppendResult, Option<Report>), LedgerError>
    where
        F: FnOnce(&SuiteLedger, &Entry) -> Report,
    {
        validate_entry(&entry)?;

        let slot = self.slot(suite);
        let _writer = slot.writer.lock();
        let current = slot.snapshot();

        if let Some(existing) = current.get(&entry.commit.id, &entry.tool) {
            if existing.same_measurements(&entry) {
                info!(suite = %suite, "Entry already present, nothing to do");

                return Ok((AppendResult::AlreadyPresent, None));
            }

            warn!(suite = %suite, "Refusing to replace recorded measurements");

            return Err(LedgerError::ConflictingHistory {
                suite: suite.to_owned(),
                commit: entry.commit.id,
                tool: entry.tool,
            });
        }

        current.units().check(&entry)?;

        let report = detect(&current, &entry);

        if cancellation.is_cancelled() {
            info!(suite = %suite, "Ingestion cancelled before commit");

            return Err(LedgerError::Cancelled);
        }

        let now = now_millis();
        let seq = current.len();
        self.connection
            .append(suite, seq, &entry, report.alerts(), now)?;

        drop(current);
        {
            let mut snapshot = slot.snapshot.write();
            Arc::make_mut(&mut *snapshot).push(entry);
        }
        self.last_update.fetch_max(now, Ordering::SeqCst);

        info!(suite = %suite, seq, "Appended entry");

        Ok((AppendResult::Appended, Some(report)))
    }

    /// entries of `suite` in ledger order, unknown suites yield nothing
    pub fn query(&self, suite: &str, filter: QueryFilter) -> Result<Query, LedgerError> {
        let ledger = self
            .ledger(suite)
            .unwrap_or_else(|| Arc::new(SuiteLedger::new(suite)));

        let unknown = |commit: &str| LedgerError::UnknownCommit {
            suite: suite.to_owned(),
            commit: commit.to_owned(),
        };

        let start = match filter.from_commit.as_deref() {
            Some(commit) => ledger
                .iter()
                .position(|entry| entry.commit.id == commit)
                .ok_or_else(|| unknown(commit))?,
            None => 0,
        };
        let end = match filter.to_commit.as_deref() {
            Some(commit) => {
                ledger
                    .iter()
                    .rposition(|entry| entry.commit.id == commit)
                    .ok_or_else(|| unknown(commit))?
                    + 1
            }
            None => ledger.len(),
        };

        Ok(Query {
            range: start..end.max(start),
            ledger,
            filter,
        })
    }

    /// persisted alerts recorded together with the entry, `None` if there is no such entry
    pub fn verdict(
        &self,
        suite: &str,
        commit: &str,
        tool: &str,
    ) -> Result<Option<Vec<RegressionAlert>>, LedgerError> {
        Ok(self.connection.alerts(suite, commit, tool)?)
    }

    /// everything in the shape the dashboard expects
    pub fn export(&self, repo_url: Option<String>) -> BenchmarkData {
        let suites = self
            .ledgers
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.snapshot()))
            .filter(|(_, ledger)| !ledger.is_empty())
            .map(|(name, ledger)| (name, ledger.iter().cloned().collect::<Vec<_>>()))
            .collect();

        BenchmarkData {
            last_update: self.last_update(),
            repo_url,
            suites,
        }
    }

    pub fn close(self) -> Result<(), LedgerError> {
        drop(self.ledgers);

        Ok(self.connection.close()?)
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
