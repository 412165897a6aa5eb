pub mod baseline;
pub mod detector;

pub use baseline::Baseline;
pub use detector::{
    Polarity, RegressionAlert, RegressionConfig, RegressionDetector, Report, Verdict,
};
