pub mod config;
pub mod database;
pub mod pipeline;
pub mod store;

pub use config::{ConfigErrors, LedgerConfig};
pub use database::{ConnectionError, SharedConnection};
pub use pipeline::{ImportSummary, IngestOutcome, Pipeline};
pub use store::{
    AppendResult, Cancellation, HistoryStore, LedgerError, Query, QueryFilter, SuiteLedger,
};
