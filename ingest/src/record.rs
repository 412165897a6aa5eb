use crate::model::{now_millis, CommitInfo, Entry, Measurement};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, str::FromStr};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed input at `{field}`: {reason}")]
    MalformedInput { field: String, reason: String },
    #[error("Unit of `{name}` is `{actual}` but the ledger already records `{expected}`")]
    UnitConflict {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("Measurement `{name}` appears twice (benches[{first}] and benches[{second}])")]
    DuplicateMeasurementName {
        name: String,
        first: usize,
        second: usize,
    },
}

impl ValidationError {
    fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// a validated ingestion record, ready to be appended to the ledger of `suite`
pub struct Run {
    pub suite: String,
    pub entry: Entry,
}

impl Run {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        RawRun::from_str(input)?.validate()
    }
}

#[derive(Debug, Clone, Default)]
/// ingestion record as handed over by the benchmark harness, nothing checked yet
pub struct RawRun {
    fields: Map<String, Value>,
}

impl FromStr for RawRun {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(input)
            .map_err(|error| ValidationError::malformed("$", error.to_string()))?;

        Self::from_value(value)
    }
}

impl RawRun {
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ValidationError::malformed(
                "$",
                format!("expected an object, found {}", kind(&other)),
            )),
        }
    }

    /// check shape and required fields, no ledger state is consulted here
    pub fn validate(self) -> Result<Run, ValidationError> {
        let suite = required_str(self.fields.get("suite_name"), "suite_name")?;
        let tool = required_str(self.fields.get("tool"), "tool")?;
        let commit = commit(self.fields.get("commit"))?;

        let date = match self.fields.get("date") {
            None | Some(Value::Null) => now_millis(),
            Some(value) => value.as_i64().ok_or_else(|| {
                ValidationError::malformed(
                    "date",
                    format!("expected epoch milliseconds, found {}", kind(value)),
                )
            })?,
        };

        let benches = match self.fields.get("benches") {
            Some(Value::Array(benches)) if !benches.is_empty() => benches,
            Some(Value::Array(_)) => {
                return Err(ValidationError::malformed(
                    "benches",
                    "at least one measurement is required",
                ))
            }
            None | Some(Value::Null) => {
                return Err(ValidationError::malformed("benches", "missing required field"))
            }
            Some(other) => {
                return Err(ValidationError::malformed(
                    "benches",
                    format!("expected an array, found {}", kind(other)),
                ))
            }
        };

        let measurements = benches
            .iter()
            .enumerate()
            .map(|(index, bench)| measurement(index, bench))
            .collect::<Result<Vec<_>, _>>()?;

        for key in self.fields.keys() {
            if !matches!(
                key.as_str(),
                "suite_name" | "tool" | "commit" | "date" | "benches"
            ) {
                debug!(field = %key, "Ignoring unknown field of ingestion record");
            }
        }

        let entry = Entry::new(commit, date, tool, measurements);
        validate_entry(&entry)?;

        Ok(Run { suite, entry })
    }
}

/// Invariants every entry of a ledger holds, no matter if it was ingested or imported.
pub fn validate_entry(entry: &Entry) -> Result<(), ValidationError> {
    if entry.commit.id.is_empty() {
        return Err(ValidationError::malformed("commit.id", "must not be empty"));
    }
    if entry.tool.is_empty() {
        return Err(ValidationError::malformed("tool", "must not be empty"));
    }
    if entry.benches.is_empty() {
        return Err(ValidationError::malformed(
            "benches",
            "at least one measurement is required",
        ));
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();

    for (index, bench) in entry.benches.iter().enumerate() {
        if bench.name.is_empty() {
            return Err(ValidationError::malformed(
                format!("benches[{index}].name"),
                "must not be empty",
            ));
        }
        if bench.unit.is_empty() {
            return Err(ValidationError::malformed(
                format!("benches[{index}].unit"),
                "must not be empty",
            ));
        }
        if !bench.value.is_finite() {
            return Err(ValidationError::malformed(
                format!("benches[{index}].value"),
                "expected a finite number",
            ));
        }

        if let Some(first) = seen.insert(&bench.name, index) {
            return Err(ValidationError::DuplicateMeasurementName {
                name: bench.name.clone(),
                first,
                second: index,
            });
        }
    }

    Ok(())
}

fn commit(value: Option<&Value>) -> Result<CommitInfo, ValidationError> {
    match value {
        Some(commit) if commit.is_object() => {
            required_str(commit.get("id"), "commit.id")?;

            serde_json::from_value(commit.clone())
                .map_err(|error| ValidationError::malformed("commit", error.to_string()))
        }
        None | Some(Value::Null) => Err(ValidationError::malformed(
            "commit",
            "missing required field",
        )),
        Some(other) => Err(ValidationError::malformed(
            "commit",
            format!("expected an object, found {}", kind(other)),
        )),
    }
}

fn measurement(index: usize, value: &Value) -> Result<Measurement, ValidationError> {
    let fields = value.as_object().ok_or_else(|| {
        ValidationError::malformed(
            format!("benches[{index}]"),
            format!("expected an object, found {}", kind(value)),
        )
    })?;

    let name = required_str(fields.get("name"), &format!("benches[{index}].name"))?;
    let unit = required_str(fields.get("unit"), &format!("benches[{index}].unit"))?;

    let field = format!("benches[{index}].value");
    let value = match fields.get("value") {
        None | Some(Value::Null) => {
            return Err(ValidationError::malformed(field, "missing required field"))
        }
        Some(Value::Number(number)) => number
            .as_f64()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ValidationError::malformed(&field, "expected a finite number"))?,
        Some(other) => {
            return Err(ValidationError::malformed(
                field,
                format!("expected a number, found {}", kind(other)),
            ))
        }
    };

    Ok(Measurement {
        name,
        value,
        unit,
        range: optional_str(fields.get("range"), &format!("benches[{index}].range"))?,
        extra: optional_str(fields.get("extra"), &format!("benches[{index}].extra"))?,
    })
}

fn required_str(value: Option<&Value>, field: &str) -> Result<String, ValidationError> {
    match optional_str(value, field)? {
        Some(value) if value.is_empty() => {
            Err(ValidationError::malformed(field, "must not be empty"))
        }
        Some(value) => Ok(value),
        None => Err(ValidationError::malformed(field, "missing required field")),
    }
}

fn optional_str(value: Option<&Value>, field: &str) -> Result<Option<String>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(ValidationError::malformed(
            field,
            format!("expected a string, found {}", kind(other)),
        )),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// map of measurement name -> first unit recorded for it in a ledger
pub struct Units(BTreeMap<String, String>);

impl Units {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<'a, I: IntoIterator<Item = &'a Entry>>(entries: I) -> Self {
        let mut units = Self::new();
        entries.into_iter().for_each(|entry| units.record(entry));

        units
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn check(&self, entry: &Entry) -> Result<(), ValidationError> {
        for bench in entry.benches.iter() {
            if let Some(expected) = self.get(&bench.name) {
                if expected != bench.unit {
                    return Err(ValidationError::UnitConflict {
                        name: bench.name.clone(),
                        expected: expected.to_owned(),
                        actual: bench.unit.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// the earliest unit wins, later entries never replace it
    pub fn record(&mut self, entry: &Entry) {
        for bench in entry.benches.iter() {
            self.0
                .entry(bench.name.clone())
                .or_insert_with(|| bench.unit.clone());
        }
    }
}

#[cfg(test)]
#[path = "record_test.rs"]
mod record_test;
