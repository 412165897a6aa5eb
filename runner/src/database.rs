pub mod sqlite;
pub mod util;

pub use sqlite::SharedConnection;

use thiserror::Error;

pub type ID = i64;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("SQLite query failed: {0}")]
    SQLite(rusqlite::Error),
    #[error("Stored entry could not be (de)serialized: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Connection is still shared and can't be closed")]
    StillShared,
}

// TODO: Add a migration table once the schema changes for the first time
pub const SQL_SCHEMA: [&str; 4] = [
    "create table if not exists suites (
    id integer primary key,
    name text not null unique
);",
    "create table if not exists entries (
    id integer primary key,
    suite integer not null references suites (id),
    seq integer not null,
    commit_id text not null,
    tool text not null,
    date integer not null,
    payload text not null,

    unique (suite, seq),
    unique (suite, commit_id, tool)
);",
    "create table if not exists alerts (
    id integer primary key,
    entry integer not null references entries (id),
    position integer not null,
    name text not null,
    baseline_mean real not null,
    baseline_stddev real not null,
    new_value real not null,
    percent_change real not null
);",
    "create table if not exists metadata (
    key text primary key,
    value text not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
