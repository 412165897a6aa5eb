use serde::{ser::Error as _, Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

// NOTE: field order of every struct below is the serialized order and has to stay in sync with
// the dashboard data files, otherwise persisted ledgers stop round-tripping byte for byte.
// `CommitInfo` is the exception, its keys are always written sorted.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// source control metadata of a single run, everything except `id` is informational
pub struct CommitInfo {
    #[serde(default)]
    pub author: Option<Person>,
    #[serde(default)]
    pub committer: Option<Person>,
    #[serde(default)]
    pub distinct: Option<bool>,
    pub id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub tree_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// fields of the push payload the ledger doesn't interpret, e.g. `added` and `modified`
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl CommitInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            author: None,
            committer: None,
            distinct: None,
            id: id.into(),
            message: None,
            timestamp: None,
            tree_id: None,
            url: None,
            other: Map::new(),
        }
    }
}

// Commit objects are written with their keys sorted, the way they come out of the GitHub push
// payload. Unknown fields are merged in by name so they end up where they were read from.
impl Serialize for CommitInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields: BTreeMap<&str, Value> = self
            .other
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();

        let known = [
            ("author", serde_json::to_value(&self.author)),
            ("committer", serde_json::to_value(&self.committer)),
            ("distinct", serde_json::to_value(self.distinct)),
            ("id", serde_json::to_value(&self.id)),
            ("message", serde_json::to_value(&self.message)),
            ("timestamp", serde_json::to_value(&self.timestamp)),
            ("tree_id", serde_json::to_value(&self.tree_id)),
            ("url", serde_json::to_value(&self.url)),
        ];

        for (key, value) in known {
            match value.map_err(S::Error::custom)? {
                Value::Null => {}
                value => {
                    fields.insert(key, value);
                }
            }
        }

        fields.serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    #[serde(serialize_with = "serialize_value")]
    pub value: f64,
    pub unit: String,
    /// dispersion, e.g. `stddev: 0.0006`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    /// opaque to the ledger, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            range: None,
            extra: None,
        }
    }
}

// integral values are written the way JavaScript prints them, `5` instead of `5.0`
fn serialize_value<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    const EXACT: f64 = 9_007_199_254_740_992.0;

    if value.fract() == 0.0 && value.abs() < EXACT {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// one commit's benchmark run as produced by a single tool
pub struct Entry {
    pub commit: CommitInfo,
    /// ingestion time in epoch milliseconds, not ordered with respect to commits
    pub date: i64,
    pub tool: String,
    pub benches: Vec<Measurement>,
    /// unknown fields of the entry, written back after `benches`
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Entry {
    pub fn new(
        commit: CommitInfo,
        date: i64,
        tool: impl Into<String>,
        benches: Vec<Measurement>,
    ) -> Self {
        Self {
            commit,
            date,
            tool: tool.into(),
            benches,
            other: Map::new(),
        }
    }

    /// identity of an entry inside a ledger
    pub fn key(&self) -> (&str, &str) {
        (self.commit.id.as_str(), self.tool.as_str())
    }

    pub fn same_measurements(&self, other: &Entry) -> bool {
        self.benches == other.benches
    }

    /// canonical persisted form of the entry
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}

/// current time in epoch milliseconds, saturating instead of wrapping
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "model_test.rs"]
mod model_test;
