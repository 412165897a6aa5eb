//! Reader and writer for the `data.js` file consumed by the benchmark dashboard.
//!
//! The file is a single JavaScript assignment wrapping a JSON document:
//!
//! ```text
//! window.BENCHMARK_DATA = {
//!   "lastUpdate": 1771543043464,
//!   "repoUrl": "https://github.com/...",
//!   "entries": { "Benchmark": [ ... ] }
//! }
//! ```

use crate::model::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DATA_JS_PREFIX: &str = "window.BENCHMARK_DATA = ";

#[derive(Debug, Error)]
pub enum DataJsError {
    #[error("File does not start with `window.BENCHMARK_DATA = `")]
    MissingPrefix,
    #[error("Failed to (de)serialize benchmark data: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Wire {
    last_update: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_url: Option<String>,
    entries: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BenchmarkData {
    pub last_update: i64,
    pub repo_url: Option<String>,
    /// suites in file order
    pub suites: Vec<(String, Vec<Entry>)>,
}

impl BenchmarkData {
    pub fn parse(input: &str) -> Result<Self, DataJsError> {
        let json = input
            .trim_start()
            .strip_prefix(DATA_JS_PREFIX)
            .ok_or(DataJsError::MissingPrefix)?
            .trim_end()
            .trim_end_matches(';');

        let wire: Wire = serde_json::from_str(json)?;
        let suites = wire
            .entries
            .into_iter()
            .map(|(suite, entries)| Ok((suite, serde_json::from_value(entries)?)))
            .collect::<Result<Vec<_>, DataJsError>>()?;

        Ok(Self {
            last_update: wire.last_update,
            repo_url: wire.repo_url,
            suites,
        })
    }

    pub fn to_js(&self) -> Result<String, DataJsError> {
        let mut entries = Map::new();

        for (suite, ledger) in self.suites.iter() {
            entries.insert(suite.clone(), serde_json::to_value(ledger)?);
        }

        let wire = Wire {
            last_update: self.last_update,
            repo_url: self.repo_url.clone(),
            entries,
        };

        Ok(format!(
            "{DATA_JS_PREFIX}{}",
            serde_json::to_string_pretty(&wire)?
        ))
    }

    pub fn suite(&self, name: &str) -> Option<&[Entry]> {
        self.suites
            .iter()
            .find(|(suite, _)| suite == name)
            .map(|(_, entries)| entries.as_slice())
    }
}

#[cfg(test)]
#[path = "datajs_test.rs"]
mod datajs_test;
