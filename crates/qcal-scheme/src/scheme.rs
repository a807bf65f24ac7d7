use std::collections::BTreeMap;
use std::fmt::{self, Display};

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::AssumptionValue;
use serde::{Deserialize, Serialize};

use crate::placeholder::Pattern;

/// One entry of a calibration scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationStep {
    /// Referenced template name.
    pub template: String,
    /// Explicit label; defaults to the template name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Data descriptor override pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Pattern>,
    /// Substitution sets; set `i` binds its keys at index `i`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub substitutions: Vec<IndexMap<String, AssumptionValue>>,
    /// Extra options forwarded to the fit backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, AssumptionValue>,
    /// A failed variant of a mandatory step halts the run.
    #[serde(default)]
    pub mandatory: bool,
}

impl CalibrationStep {
    /// Creates a step for `template` with default settings.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            label: None,
            data: None,
            substitutions: Vec::new(),
            options: BTreeMap::new(),
            mandatory: false,
        }
    }

    /// Sets an explicit label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Appends a substitution set.
    pub fn with_substitution(mut self, set: IndexMap<String, AssumptionValue>) -> Self {
        self.substitutions.push(set);
        self
    }

    /// Marks the step as mandatory.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Effective label of the step.
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.template)
    }
}

/// Position and label of a step within its scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    /// Zero-based position in the scheme.
    pub position: usize,
    /// Effective step label.
    pub label: String,
}

impl Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.position, self.label)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemeFile {
    Steps(Vec<CalibrationStep>),
    Wrapped { steps: Vec<CalibrationStep> },
}

/// Ordered sequence of calibration steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(from = "SchemeFile")]
pub struct CalibrationScheme {
    /// Steps in execution order.
    pub steps: Vec<CalibrationStep>,
}

impl From<SchemeFile> for CalibrationScheme {
    fn from(file: SchemeFile) -> Self {
        match file {
            SchemeFile::Steps(steps) | SchemeFile::Wrapped { steps } => Self { steps },
        }
    }
}

impl CalibrationScheme {
    /// Creates a scheme from ordered steps.
    pub fn new(steps: Vec<CalibrationStep>) -> Self {
        Self { steps }
    }

    /// Steps with their identifiers.
    pub fn iter(&self) -> impl Iterator<Item = (StepId, &CalibrationStep)> {
        self.steps.iter().enumerate().map(|(position, step)| {
            (
                StepId {
                    position,
                    label: step.label().to_string(),
                },
                step,
            )
        })
    }

    /// Position of the step labelled `label`.
    pub fn position_of(&self, label: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.label() == label)
    }

    /// Rejects empty labels and labels used by more than one step.
    pub fn validate(&self) -> Result<(), CalError> {
        for (id, step) in self.iter() {
            if id.label.trim().is_empty() {
                return Err(CalError::SchemeValidation(
                    ErrorInfo::new("qcal.scheme.empty_label", "step label must not be empty")
                        .with_context("step", id.to_string()),
                ));
            }
            if self.steps[..id.position]
                .iter()
                .any(|earlier| earlier.label() == step.label())
            {
                return Err(CalError::SchemeValidation(
                    ErrorInfo::new(
                        "qcal.scheme.duplicate_label",
                        format!("step label '{}' is used more than once", id.label),
                    )
                    .with_context("step", id.to_string())
                    .with_hint("give repeated templates an explicit label"),
                ));
            }
        }
        Ok(())
    }
}
