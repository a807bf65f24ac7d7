//! Sequential execution of a calibration scheme.
//!
//! The controller plans the whole scheme up front so structural errors abort
//! before any fit runs, then executes steps in declared order. Each step is
//! resolved against the live snapshot with every key written by itself or a
//! later step hidden.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use qcal_core::errors::{CalError, ErrorInfo, ErrorKind};
use qcal_core::{DataSource, FitBackend, LogLevel, LogRecord, Logger};
use qcal_scheme::{
    AssumptionStore, CalibrationScheme, ExecutionPlan, ResolvedEntry, Resolver, StepId,
    StepResolution, TemplateLibrary,
};
use serde_json::{json, Value};

use crate::executor::{StepExecutor, VariantOutcome};
use crate::summary::{RunStatus, RunSummary, StepRecord};

/// Shared flag requesting that a run stop before its next step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs of a run that are not part of the scheme.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Cancellation flag checked between steps.
    pub cancel: CancelFlag,
    /// Relative-std bound for templates that declare none.
    pub max_relative_std: Option<f64>,
}

impl RunOptions {
    /// Default relative standard deviation bound.
    pub const DEFAULT_MAX_RELATIVE_STD: f64 = 0.05;
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cancel: CancelFlag::new(),
            max_relative_std: Some(Self::DEFAULT_MAX_RELATIVE_STD),
        }
    }
}

/// Drives a scheme through resolution, execution and bookkeeping.
pub struct RunController<'a> {
    templates: &'a TemplateLibrary,
    scheme: &'a CalibrationScheme,
    store: AssumptionStore,
    data: &'a mut dyn DataSource,
    fit: &'a mut dyn FitBackend,
    logger: &'a dyn Logger,
    options: RunOptions,
    plan: Option<ExecutionPlan>,
    summary: RunSummary,
}

impl<'a> RunController<'a> {
    /// Creates a controller owning `store` for the duration of the run.
    pub fn new(
        templates: &'a TemplateLibrary,
        scheme: &'a CalibrationScheme,
        store: AssumptionStore,
        data: &'a mut dyn DataSource,
        fit: &'a mut dyn FitBackend,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            templates,
            scheme,
            store,
            data,
            fit,
            logger,
            options: RunOptions::default(),
            plan: None,
            summary: RunSummary::default(),
        }
    }

    /// Replaces the run options.
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Static execution plan, computed on first use against the store
    /// without any key a step has written.
    pub fn plan(&mut self) -> Result<&ExecutionPlan, CalError> {
        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => {
                let initial = self.store.snapshot().visible_to(0);
                let plan = Resolver::new(self.templates).plan(self.scheme, &initial)?;
                tracing::info!(
                    steps = plan.steps.len(),
                    variants = plan.variant_count(),
                    unresolved = plan.unresolved_count(),
                    "scheme planned"
                );
                plan
            }
        };
        Ok(&*self.plan.insert(plan))
    }

    /// Runs every step in order.
    ///
    /// Structural problems abort before any step runs. A failed variant of
    /// a mandatory step halts the run with [`CalError::MandatoryStep`]; the
    /// partial summary stays available through [`RunController::summary`].
    /// Every call starts a fresh summary.
    pub fn run_all(&mut self) -> Result<RunSummary, CalError> {
        self.summary = RunSummary::default();
        self.plan()?;
        self.summary.status = RunStatus::Running;
        self.logger.record(
            &LogRecord::new(LogLevel::Info, "", "Run started")
                .with_payload(json!({ "steps": self.scheme.steps.len() })),
        );
        for position in 0..self.scheme.steps.len() {
            if self.options.cancel.is_cancelled() {
                let after = self.summary.steps.last().map(|record| record.step.label.clone());
                tracing::warn!(after = ?after, "run cancelled");
                self.logger.record(
                    &LogRecord::new(LogLevel::Warn, "", "Run cancelled")
                        .with_payload(json!({ "after": after })),
                );
                self.summary.status = RunStatus::Cancelled { after };
                return Ok(self.summary.clone());
            }
            self.execute_position(position)?;
        }
        self.summary.status = RunStatus::Completed;
        self.logger.record(
            &LogRecord::new(LogLevel::Info, "", "Run finished").with_payload(json!({
                "attempted": self.summary.attempted(),
                "recorded": self.summary.recorded(),
                "failed": self.summary.failed(),
                "skipped": self.summary.skipped(),
            })),
        );
        tracing::info!(
            recorded = self.summary.recorded(),
            failed = self.summary.failed(),
            "run finished"
        );
        Ok(self.summary.clone())
    }

    /// Runs the single step labelled `label` against the current store.
    ///
    /// The record is appended to the current summary, which reads as
    /// running again until the next [`RunController::run_all`].
    pub fn run_step(&mut self, label: &str) -> Result<StepRecord, CalError> {
        let Some(position) = self.scheme.position_of(label) else {
            return Err(CalError::SchemeValidation(
                ErrorInfo::new("qcal.controller.unknown_step", format!("no step labelled '{label}'"))
                    .with_context("step", label),
            ));
        };
        self.plan()?;
        self.summary.status = RunStatus::Running;
        self.execute_position(position)
    }

    /// Outcomes collected so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Current assumption store.
    pub fn store(&self) -> &AssumptionStore {
        &self.store
    }

    /// Consumes the controller, returning the store.
    pub fn into_store(self) -> AssumptionStore {
        self.store
    }

    fn execute_position(&mut self, position: usize) -> Result<StepRecord, CalError> {
        let scheme = self.scheme;
        let templates = self.templates;
        let Some(step) = scheme.steps.get(position) else {
            return Err(CalError::SchemeValidation(
                ErrorInfo::new("qcal.controller.unknown_step", "step position out of range")
                    .with_context("position", position.to_string()),
            ));
        };
        let id = StepId {
            position,
            label: step.label().to_string(),
        };
        let template = templates
            .get(&step.template)
            .map_err(|err| err.with_context("step", id.to_string()))?;
        self.logger.record(
            &LogRecord::new(LogLevel::Info, id.label.as_str(), "Starting step").with_payload(json!({
                "position": position,
                "template": template.name,
                "mandatory": step.mandatory,
            })),
        );

        let snapshot = self.store.snapshot().visible_to(position);
        let planned = self.plan.as_ref().and_then(|plan| plan.step(position));
        let mut outcomes = Vec::new();
        let resolution = match Resolver::new(templates).resolve_step(&id, step, &snapshot) {
            Ok(mut resolution) => {
                if let Some(planned) = planned {
                    resolution.reconcile(&planned.resolution, &snapshot);
                }
                resolution
            }
            Err(err) if err.kind() == ErrorKind::UnresolvedPlaceholder => {
                // Nothing upstream produced the keys this step needs.
                tracing::warn!(step = %id, error = %err, "step cannot be resolved");
                let mut resolution = StepResolution {
                    step: id.clone(),
                    entries: Vec::new(),
                    skipped: None,
                };
                if let Some(planned) = planned {
                    resolution.reconcile(&planned.resolution, &snapshot);
                }
                if resolution.entries.is_empty() {
                    outcomes.push(VariantOutcome::failed(&id, &id.label, None, &err));
                }
                resolution
            }
            Err(err) => return Err(err),
        };

        if let Some(token) = &resolution.skipped {
            self.logger.record(
                &LogRecord::new(LogLevel::Warn, id.label.as_str(), "Step skipped")
                    .with_payload(json!({ "token": token })),
            );
            outcomes.push(VariantOutcome::skipped(&id, token));
        }

        let mut executor = StepExecutor::new(&mut *self.data, &mut *self.fit, self.logger)
            .with_max_relative_std(self.options.max_relative_std);
        for entry in &resolution.entries {
            let outcome = match entry {
                ResolvedEntry::Resolved(variant) => {
                    executor.execute(&id, template, &step.options, variant, &mut self.store)
                }
                ResolvedEntry::Unresolved(unresolved) => {
                    let err = unresolved.error(&id);
                    tracing::warn!(step = %id, error = %err, "variant unresolved");
                    self.logger.record(
                        &LogRecord::new(LogLevel::Error, id.label.as_str(), "Calibration failed")
                            .with_payload(json!({
                                "name": unresolved.name,
                                "kind": err.kind(),
                                "error": err.info(),
                            })),
                    );
                    VariantOutcome::unresolved(&id, unresolved)
                }
            };
            outcomes.push(outcome);
        }

        let after = self.store.snapshot();
        self.logger.record(
            &LogRecord::new(LogLevel::Debug, id.label.as_str(), "Assumptions updated")
                .with_payload(serde_json::to_value(&after).unwrap_or(Value::Null)),
        );
        let record = StepRecord {
            step: id.clone(),
            template: template.name.clone(),
            skipped: resolution.skipped.clone(),
            outcomes,
            assumptions: after.values(),
        };
        tracing::info!(
            step = %id,
            recorded = record.recorded(),
            failed = record.failed(),
            "step finished"
        );
        self.summary.steps.push(record.clone());

        if step.mandatory {
            if let Some(failed) = record.outcomes.iter().find(|outcome| outcome.is_failed()) {
                let cause = failed
                    .error
                    .as_ref()
                    .map(|error| error.message.clone())
                    .unwrap_or_default();
                self.summary.status = RunStatus::Halted {
                    step: id.label.clone(),
                    name: failed.name.clone(),
                };
                self.logger.record(
                    &LogRecord::new(LogLevel::Error, id.label.as_str(), "Run halted")
                        .with_payload(json!({ "name": failed.name, "cause": cause })),
                );
                return Err(CalError::MandatoryStep(
                    ErrorInfo::new(
                        "qcal.controller.mandatory",
                        format!("mandatory step '{}' failed", id.label),
                    )
                    .with_context("step", id.to_string())
                    .with_context("name", failed.name.as_str())
                    .with_context("cause", cause),
                ));
            }
        }
        Ok(record)
    }
}
