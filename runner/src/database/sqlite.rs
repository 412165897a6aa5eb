use super::{
    util::{retrieve_ids, IDMap},
    ConnectionError, ID, SQL_SCHEMA, SQL_SCHEMA_NUMBER,
};
use benchledger_analysis::RegressionAlert;
use benchledger_ingest::Entry;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
    suites: IDMap,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    /// open (or create) the database at `path` and apply the schema
    pub fn open(path: &Path) -> Result<Self, ConnectionError> {
        let mut inner = InnerConnection::new(Connection::open(path)?);
        inner.init()?;

        info!(path = ?path, "Opened ledger database");

        Ok(Self::new(inner))
    }

    pub fn in_memory() -> Result<Self, ConnectionError> {
        let mut inner = InnerConnection::new(Connection::open_in_memory()?);
        inner.init()?;

        Ok(Self::new(inner))
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0)
            .map_err(|_| ConnectionError::StillShared)?
            .into_inner()
            .close()
    }

    pub fn ledgers(&self) -> Result<Vec<(String, Vec<Entry>)>, ConnectionError> {
        self.lock().ledgers()
    }

    pub fn append<'a, I: Iterator<Item = &'a RegressionAlert>>(
        &self,
        suite: &str,
        seq: usize,
        entry: &Entry,
        alerts: I,
        last_update: i64,
    ) -> Result<ID, ConnectionError> {
        self.lock().append(suite, seq, entry, alerts, last_update)
    }

    pub fn alerts(
        &self,
        suite: &str,
        commit: &str,
        tool: &str,
    ) -> Result<Option<Vec<RegressionAlert>>, ConnectionError> {
        self.lock().alerts(suite, commit, tool)
    }

    pub fn last_update(&self) -> Result<Option<i64>, ConnectionError> {
        self.lock().last_update()
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), ConnectionError> {
        Ok(self.lock().connection.execute_batch(sql)?)
    }
}

impl InnerConnection {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            suites: IDMap::new(),
        }
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        // an append only counts once it reached the disk
        self.connection.pragma_update(None, "synchronous", "FULL")?;

        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match self.connection.execute(table, []) {
                Ok(_) => debug!(
                    "Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})",
                    counter + 1
                ),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(ConnectionError::SQLite(error));
                }
            };
        }

        self.suites = retrieve_ids(&self.connection, "select id, name from suites")?;

        info!("Found {} existing suites", self.suites.len());

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    /// every suite with its entries in ledger order
    pub fn ledgers(&self) -> Result<Vec<(String, Vec<Entry>)>, ConnectionError> {
        let mut ledgers: Vec<(String, Vec<Entry>)> = Vec::new();

        let mut statement = self.connection.prepare_cached(
            "select suites.name, entries.payload
             from suites left join entries on entries.suite = suites.id
             order by suites.id, entries.seq",
        )?;
        let mut rows = statement.query(params![])?;

        while let Some(row) = rows.next()? {
            let suite: String = row.get(0)?;
            let payload: Option<String> = row.get(1)?;

            if ledgers.last().map(|(name, _)| name != &suite).unwrap_or(true) {
                ledgers.push((suite, Vec::new()));
            }

            if let (Some(payload), Some((_, entries))) = (payload, ledgers.last_mut()) {
                entries.push(Entry::from_json(&payload)?);
            }
        }

        debug!("Loaded {} ledgers", ledgers.len());

        Ok(ledgers)
    }

    /// Persist `entry` as number `seq` of `suite` together with its alerts, all or nothing.
    pub fn append<'a, I: Iterator<Item = &'a RegressionAlert>>(
        &mut self,
        suite: &str,
        seq: usize,
        entry: &Entry,
        alerts: I,
        last_update: i64,
    ) -> Result<ID, ConnectionError> {
        let payload = entry.to_json()?;

        // NOTE: We can guarantee that no nested transactions are present due to only having one
        // connection at a time.
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        let suite_id: ID = match self.suites.get(suite) {
            Some(id) => *id,
            None => tx
                .prepare_cached("insert into suites (name) values (?) returning id")?
                .query_row(params![suite], |row| row.get(0))?,
        };

        let id: ID = tx
            .prepare_cached(
                "insert into entries
                 (suite, seq, commit_id, tool, date, payload)
                 values (?, ?, ?, ?, ?, ?) returning id",
            )?
            .query_row(
                params![
                    suite_id,
                    seq as i64,
                    entry.commit.id,
                    entry.tool,
                    entry.date,
                    payload
                ],
                |row| row.get(0),
            )?;

        let mut counter = 0;
        for (position, alert) in alerts.enumerate() {
            tx.prepare_cached(
                "insert into alerts
                 (entry, position, name, baseline_mean, baseline_stddev, new_value, percent_change)
                 values (?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                id,
                position as i64,
                alert.name,
                alert.baseline_mean,
                alert.baseline_stddev,
                alert.new_value,
                alert.percent_change
            ])?;
            counter += 1;
        }

        tx.prepare_cached(
            "insert into metadata (key, value) values ('last_update', ?)
             on conflict (key) do update set value = excluded.value",
        )?
        .execute(params![last_update.to_string()])?;

        tx.commit()?;

        // only cache the id once it is guaranteed to exist
        self.suites.entry(suite.to_owned()).or_insert(suite_id);

        debug!(id = id, seq = seq, alerts = counter, "Inserted entry");

        Ok(id)
    }

    pub fn alerts(
        &self,
        suite: &str,
        commit: &str,
        tool: &str,
    ) -> Result<Option<Vec<RegressionAlert>>, ConnectionError> {
        let entry: Option<ID> = self
            .connection
            .prepare_cached(
                "select entries.id from entries join suites on entries.suite = suites.id
                 where suites.name = ? and entries.commit_id = ? and entries.tool = ?",
            )?
            .query_row(params![suite, commit, tool], |row| row.get(0))
            .optional()?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        let alerts = self
            .connection
            .prepare_cached(
                "select name, baseline_mean, baseline_stddev, new_value, percent_change
                 from alerts where entry = ? order by position",
            )?
            .query_map(params![entry], |row| {
                Ok(RegressionAlert {
                    name: row.get(0)?,
                    baseline_mean: row.get(1)?,
                    baseline_stddev: row.get(2)?,
                    new_value: row.get(3)?,
                    percent_change: row.get(4)?,
                })
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<RegressionAlert>, ConnectionError>(init)
            })?;

        Ok(Some(alerts))
    }

    pub fn last_update(&self) -> Result<Option<i64>, ConnectionError> {
        let value: Option<String> = self
            .connection
            .prepare_cached("select value from metadata where key = 'last_update'")?
            .query_row(params![], |row| row.get(0))
            .optional()?;

        Ok(value.and_then(|value| value.parse().ok()))
    }
}

#[cfg(test)]
#[path = "sqlite_test.rs"]
mod sqlite_test;
