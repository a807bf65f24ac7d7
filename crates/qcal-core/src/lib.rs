#![deny(missing_docs)]
#![doc = "Core error, value and collaborator types for the qcal calibration engine."]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod errors;
pub mod provenance;
mod types;

pub use errors::{CalError, ErrorInfo, ErrorKind};
pub use provenance::{RunProvenance, SchemaVersion};
pub use types::{AssumptionValue, DataDescriptor, FitParameters, FitRequest, MeasurementData};

/// Source of measurement arrays for resolved calibration variants.
pub trait DataSource {
    /// Fetches the data addressed by `descriptor`.
    ///
    /// Implementations fail with [`CalError::DataAcquisition`] when the
    /// descriptor does not resolve.
    fn fetch(&mut self, descriptor: &DataDescriptor) -> Result<MeasurementData, CalError>;
}

/// External curve-fitting routine.
pub trait FitBackend {
    /// Fits the requested model, failing with [`CalError::FitConvergence`]
    /// when the routine does not converge.
    fn fit(&mut self, request: &FitRequest<'_>) -> Result<FitParameters, CalError>;
}

/// Severity attached to a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Progress information.
    Info,
    /// Recoverable anomalies (overwritten assumptions, skipped steps).
    Warn,
    /// Failed variants and aborted runs.
    Error,
}

/// Structured log record emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 timestamp taken when the record was built.
    pub timestamp: String,
    /// Severity of the record.
    pub level: LogLevel,
    /// Prefix identifying the step or variant (empty for run-level records).
    pub label: String,
    /// Human readable message.
    pub message: String,
    /// Structured payload (parameters, covariance, substitutions).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl LogRecord {
    /// Builds a record stamped with the current UTC time.
    pub fn new(level: LogLevel, label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level,
            label: label.into(),
            message: message.into(),
            payload: Value::Null,
        }
    }

    /// Attaches a structured payload to the record.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Logging capability handed explicitly to the components that need it.
///
/// Recording is best effort: implementations swallow their own failures and
/// never surface them into the engine.
pub trait Logger {
    /// Records a structured entry.
    fn record(&self, record: &LogRecord);
}

/// Logger that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn record(&self, _record: &LogRecord) {}
}
