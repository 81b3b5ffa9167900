//! Data models for runlogger.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RunLoggerError};

/// Backend-issued sweep identifier.
pub type SweepId = i64;

/// Backend-issued run identifier.
pub type RunId = i64;

/// One selected value per parameter, in sweep order.
pub type ParameterAssignment = Map<String, Value>;

/// How runs of a sweep pick their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMethod {
    Grid,
    Random,
}

impl SweepMethod {
    /// The value a new sweep's grid index starts at.
    pub fn initial_grid_index(&self) -> Option<u64> {
        match self {
            SweepMethod::Grid => Some(0),
            SweepMethod::Random => None,
        }
    }
}

impl fmt::Display for SweepMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepMethod::Grid => write!(f, "grid"),
            SweepMethod::Random => write!(f, "random"),
        }
    }
}

impl FromStr for SweepMethod {
    type Err = RunLoggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "grid" => Ok(SweepMethod::Grid),
            "random" => Ok(SweepMethod::Random),
            other => Err(RunLoggerError::Configuration(format!(
                "unknown sweep method '{other}' (expected 'grid' or 'random')"
            ))),
        }
    }
}

/// A parameter name and its ordered candidate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamChoice {
    pub key: String,
    pub choices: Vec<Value>,
}

impl ParamChoice {
    pub fn new(key: impl Into<String>, choices: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            choices,
        }
    }
}

/// The parameter space of a sweep: an ordered list of named candidate lists.
///
/// The first parameter is the slowest-varying digit of the grid enumeration,
/// the last one the fastest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SweepSpec {
    params: Vec<ParamChoice>,
}

impl SweepSpec {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Append a parameter. Validation is deferred to [`SweepSpec::validate`].
    pub fn with_choice(mut self, key: impl Into<String>, choices: Vec<Value>) -> Self {
        self.params.push(ParamChoice::new(key, choices));
        self
    }

    /// Build a spec from backend state and check its invariants.
    pub fn from_choices(params: Vec<ParamChoice>) -> Result<Self> {
        let spec = Self { params };
        spec.validate()?;
        Ok(spec)
    }

    /// Build a spec from a sweep config document.
    ///
    /// A mapping yields one parameter per key; a bare list is a single
    /// parameter with an empty name. Scalar values are single candidates.
    pub fn from_config(config: &Value) -> Result<Self> {
        let params = match config {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| ParamChoice::new(key.clone(), candidates(value)))
                .collect(),
            Value::Array(items) => vec![ParamChoice::new("", items.clone())],
            other => {
                return Err(RunLoggerError::InvalidSweepState(format!(
                    "sweep config must be a mapping or a list, got {other}"
                )))
            }
        };
        Self::from_choices(params)
    }

    pub fn params(&self) -> &[ParamChoice] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Reject empty specs, empty candidate lists and repeated names.
    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(RunLoggerError::InvalidSweepState(
                "no parameter choices found".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(self.params.len());
        for param in &self.params {
            if param.choices.is_empty() {
                return Err(RunLoggerError::InvalidSweepState(format!(
                    "{} is empty",
                    param.key
                )));
            }
            if !seen.insert(param.key.as_str()) {
                return Err(RunLoggerError::InvalidSweepState(format!(
                    "{} appears more than once",
                    param.key
                )));
            }
        }
        Ok(())
    }
}

fn candidates(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        scalar => vec![scalar.clone()],
    }
}

/// What the backend knows about the sweep a new run was bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepState {
    pub spec: SweepSpec,
    /// Index handed to this run; `None` for random sweeps.
    pub grid_index: Option<u64>,
}

/// Result of registering a run.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertedRun {
    pub run_id: RunId,
    pub sweep: Option<SweepState>,
}

/// The two buffered streams a run writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Log,
    Blob,
}

impl EntryKind {
    /// Field name the payload is stored under in a batch row.
    pub fn field(&self) -> &'static str {
        match self {
            EntryKind::Log => "log",
            EntryKind::Blob => "blob",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// A queued log or blob row, already normalised to JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    pub run_id: RunId,
    pub payload: Value,
}

impl RunEntry {
    /// Row shape sent to the backend: `{"log": .., "run_id": ..}`.
    pub fn to_row(&self, kind: EntryKind) -> Value {
        let mut row = Map::with_capacity(2);
        row.insert(kind.field().to_string(), self.payload.clone());
        row.insert("run_id".to_string(), Value::from(self.run_id));
        Value::Object(row)
    }
}
