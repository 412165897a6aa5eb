use benchledger_analysis::RegressionConfig;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config failed preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(alias = "db", default)]
    pub database: DatabaseConfig,
    // window, thresholds and polarity of the regression check
    #[serde(default)]
    pub regression: RegressionConfig,
    // settings for the dashboard `data.js`
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    #[serde(default = "default_export_path")]
    pub path: PathBuf,
    pub repo_url: Option<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: default_export_path(),
            repo_url: None,
        }
    }
}

impl LedgerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// log every problem of the config at once, returns true if any was found
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;
        let regression = &self.regression;

        if regression.window == 0 {
            error!("regression.window must be at least 1");
            contains_error = true;
        }

        if regression.min_samples < 2 {
            error!(
                "regression.min_samples ({}) must be at least 2, a single value has no deviation",
                regression.min_samples
            );
            contains_error = true;
        } else if regression.min_samples > regression.window {
            error!(
                "regression.min_samples ({}) exceeds regression.window ({}), nothing could ever be flagged",
                regression.min_samples, regression.window
            );
            contains_error = true;
        }

        if !(regression.threshold_ratio.is_finite() && regression.threshold_ratio > 0.0) {
            error!(
                "regression.threshold_ratio ({}) must be a positive number",
                regression.threshold_ratio
            );
            contains_error = true;
        }

        if !(regression.min_percent_change.is_finite() && regression.min_percent_change >= 0.0) {
            error!(
                "regression.min_percent_change ({}) must not be negative",
                regression.min_percent_change
            );
            contains_error = true;
        }

        if regression.polarity.is_empty() && regression.units.is_empty() {
            warn!("Neither regression.polarity nor regression.units is set, no regression will be reported");
        }

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("benchledger.db")
}

fn default_export_path() -> PathBuf {
    PathBuf::from("dev/bench/data.js")
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
