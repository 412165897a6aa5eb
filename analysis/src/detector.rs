use crate::baseline::{collect_samples, Baseline};
use benchledger_ingest::{Entry, Measurement};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// direction of improvement of a measurement
pub enum Polarity {
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegressionConfig {
    // number of prior entries of the same tool forming the baseline
    #[serde(default = "default_window")]
    pub window: usize,
    // below this many prior values no verdict is given
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    // deviation in multiples of the baseline standard deviation
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
    // deviation in percent of the baseline mean
    #[serde(default = "default_min_percent_change")]
    pub min_percent_change: f64,
    // polarity per measurement name
    #[serde(default)]
    pub polarity: BTreeMap<String, Polarity>,
    // fallback polarity per unit, e.g. `iter/sec: higher_is_better`
    #[serde(default)]
    pub units: BTreeMap<String, Polarity>,
}

fn default_window() -> usize {
    10
}

fn default_min_samples() -> usize {
    2
}

fn default_threshold_ratio() -> f64 {
    1.5
}

fn default_min_percent_change() -> f64 {
    5.0
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            min_samples: default_min_samples(),
            threshold_ratio: default_threshold_ratio(),
            min_percent_change: default_min_percent_change(),
            polarity: BTreeMap::new(),
            units: BTreeMap::new(),
        }
    }
}

impl RegressionConfig {
    pub fn polarity_of(&self, bench: &Measurement) -> Option<Polarity> {
        self.polarity
            .get(&bench.name)
            .or_else(|| self.units.get(&bench.unit))
            .copied()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RegressionAlert {
    pub name: String,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    pub new_value: f64,
    /// infinite for a zero baseline mean, written as `"inf"` or `"-inf"`
    #[serde(with = "signed_percent")]
    pub percent_change: f64,
}

// JSON has no infinity, serde_json would silently write `null`
mod signed_percent {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Written {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_infinite() {
            serializer.serialize_str(if value.is_sign_positive() { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Written::deserialize(deserializer)? {
            Written::Number(value) => Ok(value),
            Written::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!(
                    "expected a number, `inf` or `-inf`, found `{other}`"
                ))),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Clean(Baseline),
    Regressed(RegressionAlert),
    /// not enough prior values to judge, never a regression
    InsufficientHistory { samples: usize },
    /// neither the name nor the unit has a configured polarity
    UnknownPolarity(Baseline),
}

#[derive(Clone, Debug, Default, PartialEq)]
/// verdict for every measurement of an entry, in the entry's order
pub struct Report {
    pub verdicts: Vec<(String, Verdict)>,
}

impl Report {
    pub fn alerts(&self) -> impl Iterator<Item = &RegressionAlert> + '_ {
        self.verdicts.iter().filter_map(|(_, verdict)| match verdict {
            Verdict::Regressed(alert) => Some(alert),
            _ => None,
        })
    }

    pub fn into_alerts(self) -> Vec<RegressionAlert> {
        self.verdicts
            .into_iter()
            .filter_map(|(_, verdict)| match verdict {
                Verdict::Regressed(alert) => Some(alert),
                _ => None,
            })
            .collect_vec()
    }

    pub fn is_clean(&self) -> bool {
        self.alerts().next().is_none()
    }

    pub fn verdict(&self, name: &str) -> Option<&Verdict> {
        self.verdicts
            .iter()
            .find(|(bench, _)| bench == name)
            .map(|(_, verdict)| verdict)
    }
}

#[derive(Clone, Debug, Default)]
/// Stateless regression check of a new entry against the rolling baseline of its ledger.
pub struct RegressionDetector {
    config: RegressionConfig,
}

impl RegressionDetector {
    pub fn new(config: RegressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    /// `history` are the ledger entries preceding `entry`, in ledger order
    #[tracing::instrument(level = "debug", skip_all, fields(commit = %entry.commit.id, tool = %entry.tool))]
    pub fn detect<'a, I>(&self, history: I, entry: &Entry) -> Report
    where
        I: IntoIterator<Item = &'a Entry>,
        I::IntoIter: DoubleEndedIterator,
    {
        let samples = collect_samples(history, &entry.tool, self.config.window);

        let verdicts = entry
            .benches
            .iter()
            .map(|bench| {
                let values = samples.get(bench.name.as_str()).map_or(&[][..], Vec::as_slice);

                (bench.name.clone(), self.judge(bench, values))
            })
            .collect_vec();

        let report = Report { verdicts };

        for alert in report.alerts() {
            warn!(
                name = %alert.name,
                mean = alert.baseline_mean,
                stddev = alert.baseline_stddev,
                value = alert.new_value,
                "Regression of {:.2}%",
                alert.percent_change
            );
        }

        if report.is_clean() {
            info!("No regressions in {} measurements", report.verdicts.len());
        }

        report
    }

    fn judge(&self, bench: &Measurement, values: &[f64]) -> Verdict {
        let baseline = match Baseline::from_samples(values) {
            Some(baseline) if baseline.samples >= self.config.min_samples => baseline,
            _ => {
                debug!(name = %bench.name, samples = values.len(), "Insufficient history");

                return Verdict::InsufficientHistory {
                    samples: values.len(),
                };
            }
        };

        let polarity = match self.config.polarity_of(bench) {
            Some(polarity) => polarity,
            None => {
                debug!(name = %bench.name, unit = %bench.unit, "No polarity configured");

                return Verdict::UnknownPolarity(baseline);
            }
        };

        let percent_change = baseline.percent_change(bench.value);
        // positive means worse, regardless of polarity
        let (worsening, worsening_percent) = match polarity {
            Polarity::LowerIsBetter => (bench.value - baseline.mean, percent_change),
            Polarity::HigherIsBetter => (baseline.mean - bench.value, -percent_change),
        };

        if worsening > self.config.threshold_ratio * baseline.stddev
            && worsening_percent > self.config.min_percent_change
        {
            Verdict::Regressed(RegressionAlert {
                name: bench.name.clone(),
                baseline_mean: baseline.mean,
                baseline_stddev: baseline.stddev,
                new_value: bench.value,
                percent_change,
            })
        } else {
            Verdict::Clean(baseline)
        }
    }
}

#[cfg(test)]
#[path = "detector_test.rs"]
mod detector_test;
