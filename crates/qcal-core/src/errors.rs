//! Structured error types shared across qcal crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`CalError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (step label, resolved name, offending key).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

/// Discriminant of a [`CalError`], used in run summaries and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A required placeholder has no binding.
    UnresolvedPlaceholder,
    /// An assumption key was written twice under the reject policy.
    DuplicateAssumption,
    /// Lookup of an assumption key that is not bound.
    UnknownAssumption,
    /// The scheme is structurally invalid.
    SchemeValidation,
    /// Measurement data could not be acquired.
    DataAcquisition,
    /// The fit backend did not converge.
    FitConvergence,
    /// A fit result failed its sanity checks.
    ResultValidation,
    /// A mandatory step failed and the run was halted.
    MandatoryStep,
    /// Parsing, serialization or file access failed.
    Serde,
}

/// Canonical error type for the qcal engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum CalError {
    /// Missing binding for a required placeholder.
    #[error("unresolved placeholder: {0}")]
    UnresolvedPlaceholder(ErrorInfo),
    /// Rewrite of an existing assumption rejected by the store policy.
    #[error("duplicate assumption: {0}")]
    DuplicateAssumption(ErrorInfo),
    /// Lookup of an unbound assumption key.
    #[error("unknown assumption: {0}")]
    UnknownAssumption(ErrorInfo),
    /// Structural or ordering violation inside a scheme or template.
    #[error("scheme validation error: {0}")]
    SchemeValidation(ErrorInfo),
    /// Data source failures.
    #[error("data acquisition error: {0}")]
    DataAcquisition(ErrorInfo),
    /// Fit backend failures.
    #[error("fit convergence error: {0}")]
    FitConvergence(ErrorInfo),
    /// Fit results rejected by validation.
    #[error("result validation error: {0}")]
    ResultValidation(ErrorInfo),
    /// A mandatory step failed.
    #[error("mandatory step failed: {0}")]
    MandatoryStep(ErrorInfo),
    /// Serialization, schema and IO errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl CalError {
    /// Builds an error of the given kind.
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        let info = ErrorInfo::new(code, message);
        match kind {
            ErrorKind::UnresolvedPlaceholder => CalError::UnresolvedPlaceholder(info),
            ErrorKind::DuplicateAssumption => CalError::DuplicateAssumption(info),
            ErrorKind::UnknownAssumption => CalError::UnknownAssumption(info),
            ErrorKind::SchemeValidation => CalError::SchemeValidation(info),
            ErrorKind::DataAcquisition => CalError::DataAcquisition(info),
            ErrorKind::FitConvergence => CalError::FitConvergence(info),
            ErrorKind::ResultValidation => CalError::ResultValidation(info),
            ErrorKind::MandatoryStep => CalError::MandatoryStep(info),
            ErrorKind::Serde => CalError::Serde(info),
        }
    }

    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            CalError::UnresolvedPlaceholder(info)
            | CalError::DuplicateAssumption(info)
            | CalError::UnknownAssumption(info)
            | CalError::SchemeValidation(info)
            | CalError::DataAcquisition(info)
            | CalError::FitConvergence(info)
            | CalError::ResultValidation(info)
            | CalError::MandatoryStep(info)
            | CalError::Serde(info) => info,
        }
    }

    fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            CalError::UnresolvedPlaceholder(info)
            | CalError::DuplicateAssumption(info)
            | CalError::UnknownAssumption(info)
            | CalError::SchemeValidation(info)
            | CalError::DataAcquisition(info)
            | CalError::FitConvergence(info)
            | CalError::ResultValidation(info)
            | CalError::MandatoryStep(info)
            | CalError::Serde(info) => info,
        }
    }

    /// Returns the discriminant of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalError::UnresolvedPlaceholder(_) => ErrorKind::UnresolvedPlaceholder,
            CalError::DuplicateAssumption(_) => ErrorKind::DuplicateAssumption,
            CalError::UnknownAssumption(_) => ErrorKind::UnknownAssumption,
            CalError::SchemeValidation(_) => ErrorKind::SchemeValidation,
            CalError::DataAcquisition(_) => ErrorKind::DataAcquisition,
            CalError::FitConvergence(_) => ErrorKind::FitConvergence,
            CalError::ResultValidation(_) => ErrorKind::ResultValidation,
            CalError::MandatoryStep(_) => ErrorKind::MandatoryStep,
            CalError::Serde(_) => ErrorKind::Serde,
        }
    }

    /// Returns whether the error makes the whole scheme unrunnable.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CalError::UnresolvedPlaceholder(_) | CalError::SchemeValidation(_)
        )
    }

    /// Adds a context entry, keeping any value already recorded under `key`.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info_mut()
            .context
            .entry(key.into())
            .or_insert_with(|| value.into());
        self
    }

    /// Sets a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.info_mut().hint = Some(hint.into());
        self
    }
}
