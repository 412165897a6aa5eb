pub mod datajs;
pub mod model;
pub mod record;

pub use datajs::{BenchmarkData, DataJsError};
pub use model::{now_millis, CommitInfo, Entry, Measurement, Person};
pub use record::{validate_entry, RawRun, Run, Units, ValidationError};
