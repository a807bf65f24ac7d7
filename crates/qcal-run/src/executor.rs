//! Execution of a single resolved variant.
//!
//! Every variant walks `pending -> data-acquired -> fit-attempted` and ends
//! in `recorded` or `failed`. A failed variant never touches the store.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo, ErrorKind};
use qcal_core::{
    AssumptionValue, DataSource, FitBackend, FitParameters, FitRequest, LogLevel, LogRecord,
    Logger,
};
use qcal_scheme::{AssumptionStore, CalibrationTemplate, Origin, StepId, UnresolvedVariant, Variant};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Lifecycle state of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantState {
    /// Not started yet.
    Pending,
    /// Measurement data fetched.
    DataAcquired,
    /// Fit backend invoked.
    FitAttempted,
    /// Result validated and written to the store.
    Recorded,
    /// Failed; the store is unchanged.
    Failed,
    /// Not executed because an optional placeholder was unbound.
    Skipped,
}

impl VariantState {
    /// Returns whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VariantState::Recorded | VariantState::Failed | VariantState::Skipped
        )
    }
}

/// Single assumption written from a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssumptionWrite {
    /// Assumption key.
    pub key: String,
    /// Stored value (after scaling).
    pub value: f64,
}

/// Validated fit and the writes derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Resolved calibration name.
    pub name: String,
    /// Fitted parameters in backend order.
    pub parameters: IndexMap<String, f64>,
    /// Covariance matrix ordered like `parameters`.
    pub covariance: Vec<Vec<f64>>,
    /// Residual norm, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual: Option<f64>,
    /// Writes committed to the assumption store.
    pub writes: Vec<AssumptionWrite>,
}

/// Error recorded for a failed variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    /// Error family.
    pub kind: ErrorKind,
    /// Rendered message.
    pub message: String,
    /// Structured payload.
    pub info: ErrorInfo,
}

impl From<&CalError> for OutcomeError {
    fn from(err: &CalError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            info: err.info().clone(),
        }
    }
}

/// Terminal outcome of a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantOutcome {
    /// Step the variant belongs to.
    pub step: StepId,
    /// Resolved calibration name.
    pub name: String,
    /// Substitution set or zip index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Final state.
    pub state: VariantState,
    /// States visited, in order.
    pub trace: Vec<VariantState>,
    /// Data descriptor that was fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Fit result for recorded variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitResult>,
    /// Error for failed variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl VariantOutcome {
    fn pending(step: &StepId, name: &str, index: Option<usize>) -> Self {
        Self {
            step: step.clone(),
            name: name.to_string(),
            index,
            state: VariantState::Pending,
            trace: vec![VariantState::Pending],
            data: None,
            fit: None,
            error: None,
        }
    }

    fn advance(&mut self, state: VariantState) {
        self.state = state;
        self.trace.push(state);
    }

    /// Failed outcome for a variant that never reached the executor.
    pub fn failed(step: &StepId, name: &str, index: Option<usize>, err: &CalError) -> Self {
        let mut outcome = Self::pending(step, name, index);
        outcome.error = Some(OutcomeError::from(err));
        outcome.advance(VariantState::Failed);
        outcome
    }

    /// Failed outcome for a variant lacking a required binding.
    pub fn unresolved(step: &StepId, unresolved: &UnresolvedVariant) -> Self {
        Self::failed(step, &unresolved.name, unresolved.index, &unresolved.error(step))
    }

    /// Outcome for a step skipped by an optional placeholder.
    pub fn skipped(step: &StepId, token: &str) -> Self {
        let mut outcome = Self::pending(step, &step.label, None);
        outcome.advance(VariantState::Skipped);
        tracing::debug!(step = %step, token = %token, "variant skipped");
        outcome
    }

    /// Returns whether the variant was recorded.
    pub fn is_recorded(&self) -> bool {
        self.state == VariantState::Recorded
    }

    /// Returns whether the variant failed.
    pub fn is_failed(&self) -> bool {
        self.state == VariantState::Failed
    }
}

fn validation_error(variant: &Variant, message: impl Into<String>) -> CalError {
    CalError::ResultValidation(
        ErrorInfo::new("qcal.executor.validation", message).with_context("name", variant.name.as_str()),
    )
}

fn relative_std(value: f64, std: f64) -> f64 {
    if std == 0.0 {
        0.0
    } else if value == 0.0 {
        f64::INFINITY
    } else {
        std / value.abs()
    }
}

/// Checks a fit against the template's sanity constraints.
pub fn validate_fit(
    template: &CalibrationTemplate,
    variant: &Variant,
    parameters: &FitParameters,
    default_max_relative_std: Option<f64>,
) -> Result<(), CalError> {
    for (name, value) in &parameters.values {
        if !value.is_finite() {
            return Err(validation_error(variant, format!("parameter '{name}' is not finite"))
                .with_context("parameter", name.as_str()));
        }
    }

    let size = parameters.values.len();
    if !parameters.covariance.is_empty() {
        let square = parameters.covariance.len() == size
            && parameters.covariance.iter().all(|row| row.len() == size);
        if !square {
            return Err(validation_error(
                variant,
                format!("covariance is not a {size}x{size} matrix"),
            ));
        }
        if parameters
            .covariance
            .iter()
            .flatten()
            .any(|entry| !entry.is_finite())
        {
            return Err(validation_error(variant, "covariance contains non-finite entries"));
        }
    }

    for output in &variant.outputs {
        if !parameters.values.contains_key(&output.parameter) {
            return Err(validation_error(
                variant,
                format!("fit did not return output parameter '{}'", output.parameter),
            )
            .with_context("parameter", output.parameter.as_str()));
        }
    }

    for (name, bounds) in &template.bounds {
        let Some(value) = parameters.values.get(name) else {
            return Err(validation_error(
                variant,
                format!("bounded parameter '{name}' is missing from the fit"),
            )
            .with_context("parameter", name.as_str()));
        };
        if !bounds.contains(*value) {
            return Err(validation_error(
                variant,
                format!("parameter '{name}' = {value} is outside its bounds"),
            )
            .with_context("parameter", name.as_str())
            .with_context("value", value.to_string()));
        }
    }

    let Some(limit) = template.max_relative_std.or(default_max_relative_std) else {
        return Ok(());
    };
    if parameters.covariance.is_empty() {
        return Ok(());
    }
    let checked: Vec<&str> = if variant.outputs.is_empty() {
        parameters.values.keys().map(String::as_str).collect()
    } else {
        variant
            .outputs
            .iter()
            .map(|output| output.parameter.as_str())
            .collect()
    };
    for name in checked {
        let (Some(value), Some(std)) = (parameters.values.get(name), parameters.std_dev(name)) else {
            continue;
        };
        let ratio = relative_std(*value, std);
        if ratio > limit {
            return Err(validation_error(
                variant,
                format!("relative standard deviation of '{name}' is {ratio:.4}, above {limit}"),
            )
            .with_context("parameter", name)
            .with_hint("inspect the data or relax max_relative_std"));
        }
    }
    Ok(())
}

/// Assumption writes derived from a validated fit.
pub fn derive_writes(variant: &Variant, parameters: &FitParameters) -> Vec<AssumptionWrite> {
    if variant.outputs.is_empty() {
        return parameters
            .values
            .iter()
            .map(|(name, value)| AssumptionWrite {
                key: format!("{}/{name}", variant.name),
                value: *value,
            })
            .collect();
    }
    variant
        .outputs
        .iter()
        .filter_map(|output| {
            parameters
                .values
                .get(&output.parameter)
                .map(|value| AssumptionWrite {
                    key: output.key.clone(),
                    value: value * output.scale,
                })
        })
        .collect()
}

/// Runs resolved variants against the data source and fit backend.
pub struct StepExecutor<'a> {
    data: &'a mut dyn DataSource,
    fit: &'a mut dyn FitBackend,
    logger: &'a dyn Logger,
    default_max_relative_std: Option<f64>,
}

impl<'a> StepExecutor<'a> {
    /// Creates an executor over the given collaborators.
    pub fn new(
        data: &'a mut dyn DataSource,
        fit: &'a mut dyn FitBackend,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            data,
            fit,
            logger,
            default_max_relative_std: None,
        }
    }

    /// Sets the relative-std bound applied when the template declares none.
    pub fn with_max_relative_std(mut self, limit: Option<f64>) -> Self {
        self.default_max_relative_std = limit;
        self
    }

    /// Executes one variant. Errors become a failed outcome; only a
    /// recorded outcome mutates `store`.
    pub fn execute(
        &mut self,
        step: &StepId,
        template: &CalibrationTemplate,
        options: &BTreeMap<String, AssumptionValue>,
        variant: &Variant,
        store: &mut AssumptionStore,
    ) -> VariantOutcome {
        let mut outcome = VariantOutcome::pending(step, &variant.name, variant.index);
        self.logger.record(
            &LogRecord::new(LogLevel::Info, step.label.as_str(), "Starting calibration").with_payload(
                json!({
                    "name": variant.name,
                    "data": variant.data.as_str(),
                    "bindings": variant
                        .bindings
                        .iter()
                        .map(|(token, binding)| (token.clone(), binding.value.as_ref().map(ToString::to_string)))
                        .collect::<BTreeMap<_, _>>(),
                }),
            ),
        );

        match self.attempt(step, template, options, variant, store, &mut outcome) {
            Ok(result) => {
                outcome.advance(VariantState::Recorded);
                tracing::debug!(step = %step, name = %variant.name, writes = result.writes.len(), "variant recorded");
                self.logger.record(
                    &LogRecord::new(LogLevel::Info, step.label.as_str(), "Fit recorded").with_payload(json!({
                        "name": result.name,
                        "parameters": result.parameters,
                        "covariance": result.covariance,
                        "residual": result.residual,
                        "writes": result.writes,
                    })),
                );
                outcome.fit = Some(result);
            }
            Err(err) => {
                let err = err
                    .with_context("step", step.to_string())
                    .with_context("name", variant.name.as_str());
                tracing::warn!(step = %step, name = %variant.name, error = %err, "variant failed");
                self.logger.record(
                    &LogRecord::new(LogLevel::Error, step.label.as_str(), "Calibration failed").with_payload(
                        json!({
                            "name": variant.name,
                            "kind": err.kind(),
                            "error": err.info(),
                        }),
                    ),
                );
                outcome.error = Some(OutcomeError::from(&err));
                outcome.advance(VariantState::Failed);
            }
        }
        outcome
    }

    fn attempt(
        &mut self,
        step: &StepId,
        template: &CalibrationTemplate,
        options: &BTreeMap<String, AssumptionValue>,
        variant: &Variant,
        store: &mut AssumptionStore,
        outcome: &mut VariantOutcome,
    ) -> Result<FitResult, CalError> {
        let data = self
            .data
            .fetch(&variant.data)
            .map_err(|err| err.with_context("descriptor", variant.data.as_str()))?;
        outcome.data = Some(variant.data.to_string());
        outcome.advance(VariantState::DataAcquired);

        let guess = variant.guess();
        let request = FitRequest {
            model: &template.model,
            name: &variant.name,
            data: &data,
            guess: &guess,
            options,
        };
        let fitted = self.fit.fit(&request);
        outcome.advance(VariantState::FitAttempted);
        let parameters = fitted.map_err(|err| err.with_context("model", template.model.as_str()))?;

        validate_fit(template, variant, &parameters, self.default_max_relative_std)?;
        let writes = derive_writes(variant, &parameters);
        store.put_all(
            writes
                .iter()
                .map(|write| (write.key.clone(), AssumptionValue::Number(write.value)))
                .collect(),
            Origin::Step {
                position: step.position,
                label: step.label.clone(),
            },
        )?;

        Ok(FitResult {
            name: variant.name.clone(),
            parameters: parameters.values,
            covariance: parameters.covariance,
            residual: parameters.residual,
            writes,
        })
    }
}
