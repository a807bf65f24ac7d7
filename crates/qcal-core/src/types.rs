use std::collections::BTreeMap;
use std::fmt::{self, Display};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Value bound to an assumption key or a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssumptionValue {
    /// Boolean switch.
    Flag(bool),
    /// Numeric calibration value.
    Number(f64),
    /// Free-form text (pulse names, labels, paths).
    Text(String),
}

impl AssumptionValue {
    /// Returns the numeric payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AssumptionValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the textual payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AssumptionValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl Display for AssumptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssumptionValue::Flag(value) => write!(f, "{value}"),
            AssumptionValue::Number(value) => write!(f, "{value}"),
            AssumptionValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<f64> for AssumptionValue {
    fn from(value: f64) -> Self {
        AssumptionValue::Number(value)
    }
}

impl From<bool> for AssumptionValue {
    fn from(value: bool) -> Self {
        AssumptionValue::Flag(value)
    }
}

impl From<&str> for AssumptionValue {
    fn from(value: &str) -> Self {
        AssumptionValue::Text(value.to_string())
    }
}

impl From<String> for AssumptionValue {
    fn from(value: String) -> Self {
        AssumptionValue::Text(value)
    }
}

/// Opaque key handed to a [`crate::DataSource`] to locate measurement data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataDescriptor(String);

impl DataDescriptor {
    /// Wraps a resolved descriptor string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the descriptor as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DataDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Measurement arrays returned by a data source, keyed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MeasurementData {
    /// Descriptor the data was fetched for.
    pub descriptor: String,
    /// Named columns in source order.
    pub columns: IndexMap<String, Vec<f64>>,
}

impl MeasurementData {
    /// Creates an empty data set for `descriptor`.
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            columns: IndexMap::new(),
        }
    }

    /// Appends a column, replacing any column with the same name.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.columns.insert(name.into(), values);
        self
    }

    /// Returns the named column.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Number of rows in the longest column.
    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Returns whether no samples are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Request handed to a [`crate::FitBackend`].
#[derive(Debug, Clone, Copy)]
pub struct FitRequest<'a> {
    /// Fit-model reference declared by the template.
    pub model: &'a str,
    /// Resolved calibration name the fit is performed for.
    pub name: &'a str,
    /// Measurement data to fit.
    pub data: &'a MeasurementData,
    /// Initial guess resolved from the template inputs.
    pub guess: &'a IndexMap<String, AssumptionValue>,
    /// Step-specific options forwarded verbatim.
    pub options: &'a BTreeMap<String, AssumptionValue>,
}

/// Parameters and covariance produced by a fit backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FitParameters {
    /// Fitted parameter values in backend order.
    pub values: IndexMap<String, f64>,
    /// Covariance matrix ordered like `values` (may be empty when unknown).
    #[serde(default)]
    pub covariance: Vec<Vec<f64>>,
    /// Optional residual norm of the fit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual: Option<f64>,
}

impl FitParameters {
    /// Returns the one-sigma uncertainty of the named parameter.
    pub fn std_dev(&self, name: &str) -> Option<f64> {
        let idx = self.values.get_index_of(name)?;
        let variance = *self.covariance.get(idx)?.get(idx)?;
        Some(variance.max(0.0).sqrt())
    }
}
