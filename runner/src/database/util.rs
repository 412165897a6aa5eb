use super::{ConnectionError, ID};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

pub type IDMap = BTreeMap<String, ID>;

/// run a query returning `(id, name)` rows and collect them as name -> id
pub fn retrieve_ids(connection: &Connection, query: &str) -> Result<IDMap, ConnectionError> {
    connection
        .prepare_cached(query)?
        .query_map(params![], |row| Ok((row.get(0)?, row.get(1)?)))?
        .try_fold(BTreeMap::new(), |mut init, result| {
            let (id, name) = result?;
            init.insert(name, id);

            Ok::<IDMap, ConnectionError>(init)
        })
}
