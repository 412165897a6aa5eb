use crate::store::{AppendResult, Cancellation, HistoryStore, LedgerError};
use benchledger_analysis::{RegressionAlert, RegressionConfig, RegressionDetector, Report};
use benchledger_ingest::{validate_entry, BenchmarkData, RawRun, Run, ValidationError};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// the entry is new, `report` holds the verdict for each of its measurements
    Appended {
        suite: String,
        commit: String,
        tool: String,
        report: Report,
    },
    AlreadyPresent {
        suite: String,
        commit: String,
        tool: String,
    },
}

impl IngestOutcome {
    pub fn alerts(&self) -> Vec<&RegressionAlert> {
        match self {
            Self::Appended { report, .. } => report.alerts().collect(),
            Self::AlreadyPresent { .. } => Vec::new(),
        }
    }

    pub fn has_regressions(&self) -> bool {
        !self.alerts().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub appended: usize,
    pub already_present: usize,
}

#[derive(Debug, Clone)]
/// parse -> validate -> append -> detect for incoming runs
pub struct Pipeline {
    store: Arc<HistoryStore>,
    detector: RegressionDetector,
}

impl Pipeline {
    pub fn new(store: Arc<HistoryStore>, config: RegressionConfig) -> Self {
        Self {
            store,
            detector: RegressionDetector::new(config),
        }
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    pub fn ingest_str(
        &self,
        input: &str,
        cancellation: &Cancellation,
    ) -> Result<IngestOutcome, LedgerError> {
        self.ingest(RawRun::from_str(input)?, cancellation)
    }

    pub fn ingest(
        &self,
        raw: RawRun,
        cancellation: &Cancellation,
    ) -> Result<IngestOutcome, LedgerError> {
        self.ingest_run(raw.validate()?, cancellation)
    }

    #[instrument(level = "info", skip_all, fields(suite = %run.suite, commit = %run.entry.commit.id, tool = %run.entry.tool))]
    pub fn ingest_run(
        &self,
        run: Run,
        cancellation: &Cancellation,
    ) -> Result<IngestOutcome, LedgerError> {
        // reject early against the current state, the store checks again under its lock
        if let Some(ledger) = self.store.ledger(&run.suite) {
            ledger.units().check(&run.entry)?;
        }

        let Run { suite, entry } = run;
        let (commit, tool) = (entry.commit.id.clone(), entry.tool.clone());

        let (result, report) =
            self.store
                .append_checked(&suite, entry, cancellation, |ledger, entry| {
                    self.detector.detect(ledger.iter(), entry)
                })?;

        match (result, report) {
            (AppendResult::Appended, Some(report)) => {
                info!(
                    alerts = report.alerts().count(),
                    "Ingested {} measurements",
                    report.verdicts.len()
                );

                Ok(IngestOutcome::Appended {
                    suite,
                    commit,
                    tool,
                    report,
                })
            }
            (AppendResult::Appended, None) => Ok(IngestOutcome::Appended {
                suite,
                commit,
                tool,
                report: Report::default(),
            }),
            (AppendResult::AlreadyPresent, _) => {
                debug!("Skipping regression check for known entry");

                Ok(IngestOutcome::AlreadyPresent {
                    suite,
                    commit,
                    tool,
                })
            }
        }
    }

    /// Bring a dashboard `data.js` into the store, entries are appended without regression checks.
    ///
    /// Every entry is validated before the first one is appended, a broken file changes nothing.
    #[instrument(level = "info", skip_all)]
    pub fn import(&self, data: &BenchmarkData) -> Result<ImportSummary, LedgerError> {
        for (suite, entries) in data.suites.iter() {
            if suite.is_empty() {
                return Err(ValidationError::MalformedInput {
                    field: "entries".to_owned(),
                    reason: "suite name must not be empty".to_owned(),
                }
                .into());
            }

            for (index, entry) in entries.iter().enumerate() {
                validate_entry(entry).map_err(|error| {
                    warn!(suite = %suite, index, "Rejecting invalid entry of import");
                    error
                })?;
            }
        }

        let mut summary = ImportSummary::default();

        for (suite, entries) in data.suites.iter() {
            for entry in entries {
                match self.store.append(suite, entry.clone())? {
                    AppendResult::Appended => summary.appended += 1,
                    AppendResult::AlreadyPresent => summary.already_present += 1,
                }
            }
        }

        info!(
            appended = summary.appended,
            already_present = summary.already_present,
            "Imported {} suites",
            data.suites.len()
        );

        Ok(summary)
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
