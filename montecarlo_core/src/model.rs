//! Model records: the formula plus the rules for drawing its variables.
//!
//! A model is loaded from an opaque JSON definition, validated once, then
//! only ever copied: the controller owns the active one, every worker holds
//! a read-only copy after syncing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// One concrete assignment of values to a model's variables.
///
/// A `BTreeMap` so that serialization has a deterministic key order, which is
/// what scenario de-duplication fingerprints.
pub type Scenario = BTreeMap<String, f64>;

/// Model load/validation errors.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model definition must be a JSON object")]
    NotAnObject,

    #[error("Invalid model: missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid model: field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Invalid model: no variables declared")]
    NoVariables,

    #[error("Unknown model reference: {0}")]
    UnknownReference(String),
}

/// Sampling distribution of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    /// `uniform(min, max)`, defaults `min = 0`, `max = 1`
    #[default]
    Uniform,

    /// `normal(mean, std)`, defaults `mean = 0`, `std = 1`
    Normal,

    /// `exponential(scale)`, default `scale = 1`
    Exponential,

    /// Anything else; sampled as `uniform(0, 1)`
    #[serde(other)]
    Unknown,
}

/// Generation rule for one variable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "distribucion", alias = "distribution", default)]
    pub distribution: DistributionKind,

    #[serde(rename = "parametros", alias = "parameters", default)]
    pub parameters: BTreeMap<String, f64>,
}

impl VariableSpec {
    /// Creates a spec from a distribution and `(name, value)` parameters.
    pub fn new(distribution: DistributionKind, parameters: &[(&str, f64)]) -> Self {
        Self {
            distribution,
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    /// `uniform(min, max)`
    pub fn uniform(min: f64, max: f64) -> Self {
        Self::new(DistributionKind::Uniform, &[("min", min), ("max", max)])
    }

    /// `normal(mean, std)`
    pub fn normal(mean: f64, std: f64) -> Self {
        Self::new(DistributionKind::Normal, &[("mean", mean), ("std", std)])
    }

    /// `exponential(scale)`
    pub fn exponential(scale: f64) -> Self {
        Self::new(DistributionKind::Exponential, &[("scale", scale)])
    }

    /// Returns a parameter, or `default` when it is not declared.
    pub fn param(&self, name: &str, default: f64) -> f64 {
        self.parameters.get(name).copied().unwrap_or(default)
    }
}

/// A named formula plus its variable generation rules.
///
/// Identity is the `name`; models are never mutated, only replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(alias = "nombre")]
    pub name: String,

    #[serde(alias = "descripcion")]
    pub description: String,

    /// Arithmetic expression over the variable names
    pub formula: String,

    pub variables: BTreeMap<String, VariableSpec>,
}

/// Required keys of a definition record, with their accepted aliases.
const REQUIRED_FIELDS: [(&str, &str); 4] = [
    ("name", "nombre"),
    ("description", "descripcion"),
    ("formula", "formula"),
    ("variables", "variables"),
];

impl Model {
    /// Builds a model in code (catalogs, tests).
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        formula: impl Into<String>,
        variables: impl IntoIterator<Item = (String, VariableSpec)>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            formula: formula.into(),
            variables: variables.into_iter().collect(),
        }
    }

    /// Parses and validates a definition record.
    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Validates the required keys, then deserializes.
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        let object = value.as_object().ok_or(ModelError::NotAnObject)?;
        for (field, alias) in REQUIRED_FIELDS {
            if !object.contains_key(field) && !object.contains_key(alias) {
                return Err(ModelError::MissingField(field));
            }
        }

        let model: Model = serde_json::from_value(value)?;
        model.validate()?;
        Ok(model)
    }

    /// Semantic checks beyond the record shape.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::EmptyField("name"));
        }
        if self.formula.trim().is_empty() {
            return Err(ModelError::EmptyField("formula"));
        }
        if self.variables.is_empty() {
            return Err(ModelError::NoVariables);
        }
        Ok(())
    }

    /// Names of the declared variables.
    pub fn variable_names(&self) -> BTreeSet<&str> {
        self.variables.keys().map(String::as_str).collect()
    }

    /// True if the scenario binds exactly this model's variables.
    ///
    /// A mismatch is how a worker learns its model went stale.
    pub fn matches(&self, scenario: &Scenario) -> bool {
        scenario.len() == self.variables.len()
            && scenario.keys().all(|k| self.variables.contains_key(k))
    }
}

/// Rounds to the 4 decimals used for every number on the wire.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
