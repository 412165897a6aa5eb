use benchledger_ingest::Entry;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
/// rolling summary of the prior values of one measurement
pub struct Baseline {
    pub samples: usize,
    pub mean: f64,
    /// sample standard deviation (n - 1), zero for a single sample
    pub stddev: f64,
}

impl Baseline {
    pub fn from_samples(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let samples = values.len();
        let mean = values.iter().sum::<f64>() / samples as f64;
        let stddev = if samples < 2 {
            0.0
        } else {
            let variance = values
                .iter()
                .map(|value| (value - mean).powi(2))
                .sum::<f64>()
                / (samples - 1) as f64;

            variance.sqrt()
        };

        Some(Self {
            samples,
            mean,
            stddev,
        })
    }

    /// signed change of `value` relative to the mean, in percent
    pub fn percent_change(&self, value: f64) -> f64 {
        let delta = value - self.mean;

        if delta == 0.0 {
            0.0
        } else if self.mean == 0.0 {
            f64::INFINITY.copysign(delta)
        } else {
            delta / self.mean.abs() * 100.0
        }
    }
}

/// Collect the values of every measurement from the `window` most recent entries of `tool`.
///
/// `history` has to be in ledger order and must only contain entries preceding the one under
/// test. Entries of other tools are skipped without counting towards the window.
pub fn collect_samples<'a, I>(history: I, tool: &str, window: usize) -> BTreeMap<&'a str, Vec<f64>>
where
    I: IntoIterator<Item = &'a Entry>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut samples: BTreeMap<&'a str, Vec<f64>> = BTreeMap::new();

    history
        .into_iter()
        .rev()
        .filter(|entry| entry.tool == tool)
        .take(window)
        .flat_map(|entry| entry.benches.iter())
        .for_each(|bench| {
            samples
                .entry(bench.name.as_str())
                .or_default()
                .push(bench.value)
        });

    samples
}
