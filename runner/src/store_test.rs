use super::{AppendResult, Cancellation, HistoryStore, LedgerError, QueryFilter};
use crate::database::SharedConnection;
use benchledger_analysis::{RegressionAlert, Report, Verdict};
use benchledger_ingest::{CommitInfo, Entry, Measurement, ValidationError};
use std::{sync::Arc, thread};

const SUITE: &str = "Benchmark";

fn entry(commit: &str, tool: &str, date: i64, value: f64) -> Entry {
    let mut bench = Measurement::new("test_simple_query", value, "iter/sec");
    bench.range = Some("stddev: 0.0006".to_owned());
    bench.extra = Some("mean: 941.04 usec\nrounds: 569".to_owned());

    Entry::new(CommitInfo::new(commit), date, tool, vec![bench])
}

fn store() -> (SharedConnection, HistoryStore) {
    let connection = SharedConnection::in_memory().unwrap();
    let store = HistoryStore::open(connection.clone()).unwrap();

    (connection, store)
}

fn commits(store: &HistoryStore, filter: QueryFilter) -> Vec<String> {
    store
        .query(SUITE, filter)
        .unwrap()
        .iter()
        .map(|entry| entry.commit.id.clone())
        .collect()
}

#[test]
pub fn get_or_create_ledger_is_idempotent() {
    let (_, store) = store();

    assert!(store.get_or_create_ledger(SUITE).is_empty());
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    assert_eq!(store.get_or_create_ledger(SUITE).len(), 1);
    assert_eq!(store.suites(), vec![SUITE.to_owned()]);
}

#[test]
pub fn identical_append_is_recorded_once() {
    let (_, store) = store();

    assert_eq!(
        store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap(),
        AppendResult::Appended
    );
    // a retry of the same run carries a new ingestion date
    assert_eq!(
        store.append(SUITE, entry("a", "pytest", 2, 1.0)).unwrap(),
        AppendResult::AlreadyPresent
    );

    assert_eq!(store.len(SUITE), 1);
    assert_eq!(store.ledger(SUITE).unwrap().iter().next().unwrap().date, 1);
}

#[test]
pub fn same_commit_of_another_tool_is_a_new_entry() {
    let (_, store) = store();

    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();
    store.append(SUITE, entry("a", "criterion", 1, 2.0)).unwrap();

    assert_eq!(store.len(SUITE), 2);
}

#[test]
pub fn conflicting_history_leaves_ledger_unchanged() {
    let (connection, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    let result = store.append(SUITE, entry("a", "pytest", 1, 2.0));
    assert!(matches!(
        result,
        Err(LedgerError::ConflictingHistory { ref commit, ref tool, .. }) if commit == "a" && tool == "pytest"
    ));

    assert_eq!(store.len(SUITE), 1);
    assert_eq!(
        store.ledger(SUITE).unwrap().get("a", "pytest").unwrap().benches[0].value,
        1.0
    );
    assert_eq!(connection.ledgers().unwrap()[0].1.len(), 1);
}

#[test]
pub fn unit_conflict_is_rejected() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    let mut other = entry("b", "criterion", 2, 1.0);
    other.benches[0].unit = "ns/iter".to_owned();

    assert!(matches!(
        store.append(SUITE, other),
        Err(LedgerError::Validation(ValidationError::UnitConflict { .. }))
    ));
    assert_eq!(store.len(SUITE), 1);
}

#[test]
pub fn units_are_tracked_per_suite() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    let mut other = entry("a", "pytest", 1, 1.0);
    other.benches[0].unit = "ns/iter".to_owned();

    assert_eq!(store.append("Other", other).unwrap(), AppendResult::Appended);
}

#[test]
pub fn ledgers_survive_reopening() {
    let file = tempfile::NamedTempFile::new().unwrap();

    let store = HistoryStore::open(SharedConnection::open(file.path()).unwrap()).unwrap();
    for (index, commit) in ["c", "a", "b"].iter().enumerate() {
        store
            .append(SUITE, entry(commit, "pytest", 10 - index as i64, index as f64))
            .unwrap();
    }
    store.append("Other", entry("x", "cargo", 1, 1.0)).unwrap();
    let last_update = store.last_update();
    let before = store.export(None);
    store.close().unwrap();

    let store = HistoryStore::open(SharedConnection::open(file.path()).unwrap()).unwrap();

    assert_eq!(store.export(None), before);
    assert_eq!(store.last_update(), last_update);
    assert_eq!(commits(&store, QueryFilter::default()), vec!["c", "a", "b"]);
}

#[test]
pub fn concurrent_appends_are_not_lost() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(HistoryStore::open(SharedConnection::open(file.path()).unwrap()).unwrap());

    thread::scope(|scope| {
        for worker in 0..8 {
            let store = store.clone();

            scope.spawn(move || {
                for run in 0..10 {
                    let commit = format!("{worker}-{run}");
                    let suite = if run % 2 == 0 { SUITE } else { "Other" };

                    assert_eq!(
                        store.append(suite, entry(&commit, "pytest", run, 1.0)).unwrap(),
                        AppendResult::Appended
                    );
                }
            });
        }
    });

    assert_eq!(store.len(SUITE), 40);
    assert_eq!(store.len("Other"), 40);

    let store = Arc::try_unwrap(store).unwrap();
    store.close().unwrap();

    let store = HistoryStore::open(SharedConnection::open(file.path()).unwrap()).unwrap();
    assert_eq!(store.len(SUITE), 40);
    assert_eq!(store.len("Other"), 40);
}

#[test]
pub fn query_filters_by_commit_range_date_and_tool() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 100, 1.0)).unwrap();
    store.append(SUITE, entry("b", "pytest", 300, 1.0)).unwrap();
    store.append(SUITE, entry("b", "criterion", 310, 1.0)).unwrap();
    store.append(SUITE, entry("c", "pytest", 200, 1.0)).unwrap();
    store.append(SUITE, entry("d", "pytest", 400, 1.0)).unwrap();

    assert_eq!(
        commits(&store, QueryFilter::default().commits("b", "c")),
        vec!["b", "b", "c"]
    );
    assert_eq!(
        commits(&store, QueryFilter::default().dates(150, 310)),
        vec!["b", "b", "c"]
    );
    assert_eq!(
        commits(&store, QueryFilter::default().tool("criterion")),
        vec!["b"]
    );
    assert_eq!(
        commits(
            &store,
            QueryFilter::default().commits("a", "c").dates(0, 250).tool("pytest")
        ),
        vec!["a", "c"]
    );
    assert!(commits(&store, QueryFilter::default().commits("d", "a")).is_empty());
}

#[test]
pub fn query_rejects_unknown_commit() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    assert!(matches!(
        store.query(SUITE, QueryFilter::default().commits("a", "zzz")),
        Err(LedgerError::UnknownCommit { commit, .. }) if commit == "zzz"
    ));
}

#[test]
pub fn query_of_unknown_suite_is_empty() {
    let (_, store) = store();

    assert_eq!(store.query("Missing", QueryFilter::default()).unwrap().iter().count(), 0);
    assert!(store.suites().is_empty());
}

#[test]
pub fn query_is_restartable_and_isolated_from_later_appends() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();
    store.append(SUITE, entry("b", "pytest", 2, 1.0)).unwrap();

    let query = store.query(SUITE, QueryFilter::default()).unwrap();
    store.append(SUITE, entry("c", "pytest", 3, 1.0)).unwrap();

    assert_eq!(query.iter().count(), 2);
    assert_eq!((&query).into_iter().count(), 2);
    assert_eq!(store.query(SUITE, QueryFilter::default()).unwrap().iter().count(), 3);
}

#[test]
pub fn storage_failure_keeps_memory_in_sync() {
    let (connection, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    connection.execute_batch("drop table alerts;").unwrap();
    let detect = |_: &super::SuiteLedger, _: &Entry| Report {
        verdicts: vec![(
            "test_simple_query".to_owned(),
            Verdict::Regressed(RegressionAlert {
                name: "test_simple_query".to_owned(),
                baseline_mean: 1.0,
                baseline_stddev: 0.0,
                new_value: 2.0,
                percent_change: 100.0,
            }),
        )],
    };

    let result = store.append_checked(
        SUITE,
        entry("b", "pytest", 2, 2.0),
        &Cancellation::new(),
        detect,
    );

    assert!(matches!(result, Err(LedgerError::Storage(_))));
    assert_eq!(store.len(SUITE), 1);
    assert_eq!(connection.ledgers().unwrap()[0].1.len(), 1);
}

#[test]
pub fn cancelled_append_changes_nothing() {
    let (connection, store) = store();
    let cancellation = Cancellation::new();
    cancellation.cancel();

    let result = store.append_checked(SUITE, entry("a", "pytest", 1, 1.0), &cancellation, |_, _| {
        Report::default()
    });

    assert!(matches!(result, Err(LedgerError::Cancelled)));
    assert_eq!(store.len(SUITE), 0);
    assert!(connection.ledgers().unwrap().is_empty());
}

#[test]
pub fn detection_only_sees_preceding_entries() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();
    store.append(SUITE, entry("b", "pytest", 2, 1.0)).unwrap();

    let (result, report) = store
        .append_checked(SUITE, entry("c", "pytest", 3, 1.0), &Cancellation::new(), |ledger, new| {
            assert_eq!(ledger.len(), 2);
            assert!(ledger.get(&new.commit.id, &new.tool).is_none());

            Report::default()
        })
        .unwrap();

    assert_eq!(result, AppendResult::Appended);
    assert!(report.is_some());

    let (result, report) = store
        .append_checked(SUITE, entry("c", "pytest", 3, 1.0), &Cancellation::new(), |_, _| {
            panic!("detection must not run for entries already present")
        })
        .unwrap();

    assert_eq!(result, AppendResult::AlreadyPresent);
    assert!(report.is_none());
}

#[test]
pub fn export_matches_ledgers() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();
    store.get_or_create_ledger("Empty");

    let data = store.export(Some("https://example.org/repo".to_owned()));

    assert_eq!(data.repo_url.as_deref(), Some("https://example.org/repo"));
    assert_eq!(data.suites.len(), 1);
    assert_eq!(data.suite(SUITE).unwrap(), &[entry("a", "pytest", 1, 1.0)]);
    assert_eq!(data.last_update, store.last_update());
    assert!(data.last_update > 0);
}

#[test]
pub fn invalid_entry_is_rejected_before_the_suite_exists() {
    let (connection, store) = store();
    let mut twice = entry("a", "pytest", 1, 1.0);
    twice.benches.push(twice.benches[0].clone());

    assert!(matches!(
        store.append(SUITE, twice),
        Err(LedgerError::Validation(ValidationError::DuplicateMeasurementName { .. }))
    ));
    assert!(matches!(
        store.append(SUITE, entry("", "pytest", 1, 1.0)),
        Err(LedgerError::Validation(ValidationError::MalformedInput { .. }))
    ));
    assert!(store.suites().is_empty());
    assert!(connection.ledgers().unwrap().is_empty());
}

#[test]
pub fn snapshot_is_only_copied_while_shared() {
    let (_, store) = store();
    store.append(SUITE, entry("a", "pytest", 1, 1.0)).unwrap();

    let unshared = Arc::as_ptr(&store.ledger(SUITE).unwrap());
    store.append(SUITE, entry("b", "pytest", 2, 1.0)).unwrap();

    let held = store.ledger(SUITE).unwrap();
    assert_eq!(Arc::as_ptr(&held), unshared);
    assert_eq!(held.len(), 2);

    store.append(SUITE, entry("c", "pytest", 3, 1.0)).unwrap();

    let latest = store.ledger(SUITE).unwrap();
    assert_ne!(Arc::as_ptr(&latest), Arc::as_ptr(&held));
    assert_eq!(held.len(), 2);
    assert_eq!(latest.len(), 3);
}
