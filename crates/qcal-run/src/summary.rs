use indexmap::IndexMap;
use qcal_core::errors::ErrorKind;
use qcal_core::AssumptionValue;
use qcal_scheme::StepId;
use serde::{Deserialize, Serialize};

use crate::executor::{VariantOutcome, VariantState};

/// Overall state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RunStatus {
    /// No step has been executed.
    #[default]
    NotStarted,
    /// Steps are being executed.
    Running,
    /// Every step ran.
    Completed,
    /// A mandatory step failed.
    Halted {
        /// Step that failed.
        step: String,
        /// Failing variant.
        name: String,
    },
    /// Stopped between steps by a cancellation request.
    Cancelled {
        /// Last completed step, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },
}

/// Outcomes of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identifier.
    pub step: StepId,
    /// Template the step instantiated.
    pub template: String,
    /// Optional token that skipped the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    /// Variant outcomes in execution order.
    pub outcomes: Vec<VariantOutcome>,
    /// Assumptions after the step completed.
    pub assumptions: IndexMap<String, AssumptionValue>,
}

impl StepRecord {
    /// Number of recorded variants.
    pub fn recorded(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_recorded()).count()
    }

    /// Number of failed variants.
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_failed()).count()
    }
}

/// Failed variant as listed in a run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Step identifier.
    pub step: StepId,
    /// Resolved calibration name.
    pub name: String,
    /// Error family.
    pub kind: ErrorKind,
    /// Rendered error message.
    pub message: String,
}

/// Aggregated outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunSummary {
    /// Overall status.
    pub status: RunStatus,
    /// Executed steps in order.
    pub steps: Vec<StepRecord>,
}

impl RunSummary {
    /// Every variant outcome in execution order.
    pub fn outcomes(&self) -> impl Iterator<Item = &VariantOutcome> {
        self.steps.iter().flat_map(|record| record.outcomes.iter())
    }

    /// Number of attempted variants.
    pub fn attempted(&self) -> usize {
        self.outcomes()
            .filter(|outcome| outcome.state != VariantState::Skipped)
            .count()
    }

    /// Number of recorded variants.
    pub fn recorded(&self) -> usize {
        self.outcomes().filter(|outcome| outcome.is_recorded()).count()
    }

    /// Number of failed variants.
    pub fn failed(&self) -> usize {
        self.outcomes().filter(|outcome| outcome.is_failed()).count()
    }

    /// Number of skipped steps.
    pub fn skipped(&self) -> usize {
        self.steps.iter().filter(|record| record.skipped.is_some()).count()
    }

    /// Failed variants with their error kind and message.
    pub fn failures(&self) -> Vec<FailureEntry> {
        self.outcomes()
            .filter_map(|outcome| {
                outcome.error.as_ref().map(|error| FailureEntry {
                    step: outcome.step.clone(),
                    name: outcome.name.clone(),
                    kind: error.kind,
                    message: error.message.clone(),
                })
            })
            .collect()
    }

    /// Record of the step labelled `label`, most recent first.
    pub fn step(&self, label: &str) -> Option<&StepRecord> {
        self.steps.iter().rev().find(|record| record.step.label == label)
    }

    /// Returns whether the run completed without failures.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failed() == 0
    }
}
