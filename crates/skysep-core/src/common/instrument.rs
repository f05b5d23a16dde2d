//! Instrument descriptor adapter.
//!
//! Callers hand over either a structured record or a loosely keyed mapping
//! (typically the configuration dictionary of an instrument). Both are
//! normalised once here and read through the same fixed accessors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const FREQUENCIES_KEY: &str = "frequencies";
pub const SENS_I_KEY: &str = "sens_i";
pub const SENS_P_KEY: &str = "sens_p";
pub const BEAMS_KEY: &str = "beams";

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("no attribute named '{name}'")]
    MissingAttribute { name: String },
    #[error("attribute '{name}' must be a number or a sequence of numbers")]
    InvalidAttribute { name: String },
    #[error("instrument description must be a mapping, got {kind}")]
    NotAMapping { kind: &'static str },
    #[error("failed to read instrument '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse instrument description: {source}")]
    Parse { source: serde_json::Error },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub frequencies: Vec<f64>,
    #[serde(default)]
    pub sens_i: Option<Vec<f64>>,
    #[serde(default)]
    pub sens_p: Option<Vec<f64>>,
    #[serde(default)]
    pub beams: Option<Vec<f64>>,
}

impl InstrumentRecord {
    pub fn new(frequencies: Vec<f64>) -> Self {
        Self {
            frequencies,
            ..Self::default()
        }
    }

    pub fn with_sens_i(mut self, sens_i: Vec<f64>) -> Self {
        self.sens_i = Some(sens_i);
        self
    }

    pub fn with_sens_p(mut self, sens_p: Vec<f64>) -> Self {
        self.sens_p = Some(sens_p);
        self
    }

    pub fn with_beams(mut self, beams: Vec<f64>) -> Self {
        self.beams = Some(beams);
        self
    }
}

/// Mapping-backed instrument with every key folded to lower case.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstrumentMapping {
    entries: BTreeMap<String, Value>,
}

impl InstrumentMapping {
    pub fn new(entries: Map<String, Value>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.to_lowercase(), value))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .get(&name.to_lowercase())
            .filter(|value| !value.is_null())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instrument {
    Record(InstrumentRecord),
    Mapping(InstrumentMapping),
}

impl Instrument {
    pub fn from_json_value(value: Value) -> Result<Self, InstrumentError> {
        match value {
            Value::Object(entries) => Ok(Self::Mapping(InstrumentMapping::new(entries))),
            other => Err(InstrumentError::NotAMapping {
                kind: json_kind(&other),
            }),
        }
    }

    pub fn from_json_str(source: &str) -> Result<Self, InstrumentError> {
        let value =
            serde_json::from_str(source).map_err(|source| InstrumentError::Parse { source })?;
        Self::from_json_value(value)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, InstrumentError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| InstrumentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&source)
    }

    pub fn frequencies(&self) -> Result<Vec<f64>, InstrumentError> {
        match self {
            Self::Record(record) => Ok(record.frequencies.clone()),
            Self::Mapping(_) => self
                .optional_sequence(FREQUENCIES_KEY)?
                .ok_or_else(|| InstrumentError::MissingAttribute {
                    name: "Frequencies".to_string(),
                }),
        }
    }

    pub fn sens_i(&self) -> Result<Option<Vec<f64>>, InstrumentError> {
        self.optional_sequence(SENS_I_KEY)
    }

    pub fn sens_p(&self) -> Result<Option<Vec<f64>>, InstrumentError> {
        self.optional_sequence(SENS_P_KEY)
    }

    pub fn beams(&self) -> Result<Option<Vec<f64>>, InstrumentError> {
        self.optional_sequence(BEAMS_KEY)
    }

    /// Case-insensitive attribute lookup over either representation.
    pub fn attribute(&self, name: &str) -> Result<Value, InstrumentError> {
        let missing = || InstrumentError::MissingAttribute {
            name: name.to_string(),
        };
        match self {
            Self::Mapping(mapping) => mapping.get(name).cloned().ok_or_else(missing),
            Self::Record(record) => {
                let field = match name.to_lowercase().as_str() {
                    FREQUENCIES_KEY => Some(&record.frequencies),
                    SENS_I_KEY => record.sens_i.as_ref(),
                    SENS_P_KEY => record.sens_p.as_ref(),
                    BEAMS_KEY => record.beams.as_ref(),
                    _ => None,
                };
                field
                    .map(|values| Value::from(values.clone()))
                    .ok_or_else(missing)
            }
        }
    }

    fn optional_sequence(&self, key: &str) -> Result<Option<Vec<f64>>, InstrumentError> {
        match self {
            Self::Record(record) => Ok(match key {
                FREQUENCIES_KEY => Some(record.frequencies.clone()),
                SENS_I_KEY => record.sens_i.clone(),
                SENS_P_KEY => record.sens_p.clone(),
                BEAMS_KEY => record.beams.clone(),
                _ => None,
            }),
            Self::Mapping(mapping) => mapping
                .get(key)
                .map(|value| numeric_sequence(key, value))
                .transpose(),
        }
    }
}

impl From<InstrumentRecord> for Instrument {
    fn from(record: InstrumentRecord) -> Self {
        Self::Record(record)
    }
}

impl From<InstrumentMapping> for Instrument {
    fn from(mapping: InstrumentMapping) -> Self {
        Self::Mapping(mapping)
    }
}

fn numeric_sequence(key: &str, value: &Value) -> Result<Vec<f64>, InstrumentError> {
    let invalid = || InstrumentError::InvalidAttribute {
        name: key.to_string(),
    };
    match value {
        Value::Number(number) => number.as_f64().map(|value| vec![value]).ok_or_else(invalid),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_f64().ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
