use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::AssumptionValue;
use serde::{Deserialize, Serialize};

use crate::scheme::CalibrationScheme;

fn sweep_error(message: impl Into<String>) -> CalError {
    CalError::SchemeValidation(ErrorInfo::new("qcal.sweep.invalid", message))
}

/// Substitution token swept over a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParameter {
    /// Token name injected into every substitution set.
    pub name: String,
    /// Values in sweep order.
    pub values: Vec<AssumptionValue>,
}

/// Grid of substitution values the scheme is repeated over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SweepPlan {
    /// Swept tokens; the first varies slowest.
    pub parameters: Vec<SweepParameter>,
    /// Optional cap on the number of grid points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SweepPlan {
    /// Single-token sweep.
    pub fn single(name: impl Into<String>, values: Vec<AssumptionValue>) -> Self {
        Self {
            parameters: vec![SweepParameter {
                name: name.into(),
                values,
            }],
            limit: None,
        }
    }

    /// Grid points in deterministic order.
    pub fn points(&self) -> Result<Vec<IndexMap<String, AssumptionValue>>, CalError> {
        if self.parameters.is_empty() {
            return Err(sweep_error("sweep declares no parameters"));
        }
        for (idx, parameter) in self.parameters.iter().enumerate() {
            if parameter.name.trim().is_empty() {
                return Err(sweep_error("sweep parameter name must not be empty"));
            }
            if parameter.values.is_empty() {
                return Err(sweep_error(format!(
                    "sweep parameter '{}' has no values",
                    parameter.name
                )));
            }
            if self.parameters[..idx]
                .iter()
                .any(|earlier| earlier.name == parameter.name)
            {
                return Err(sweep_error(format!(
                    "sweep parameter '{}' is declared twice",
                    parameter.name
                )));
            }
        }
        let mut points = Vec::new();
        expand_grid(&self.parameters, 0, &mut IndexMap::new(), &mut points);
        if let Some(limit) = self.limit {
            points.truncate(limit);
        }
        Ok(points)
    }
}

fn expand_grid(
    parameters: &[SweepParameter],
    idx: usize,
    current: &mut IndexMap<String, AssumptionValue>,
    out: &mut Vec<IndexMap<String, AssumptionValue>>,
) {
    if idx == parameters.len() {
        out.push(current.clone());
        return;
    }
    let parameter = &parameters[idx];
    for value in &parameter.values {
        current.insert(parameter.name.clone(), value.clone());
        expand_grid(parameters, idx + 1, current, out);
    }
    current.shift_remove(&parameter.name);
}

/// Repeats `scheme` once per grid point of `plan`.
///
/// Each copy of a step is labelled `<label>@<token>=<value>,...` and carries
/// the point's values in every substitution set (or in a single new set when
/// the step had none).
pub fn expand_sweep(scheme: &CalibrationScheme, plan: &SweepPlan) -> Result<CalibrationScheme, CalError> {
    let points = plan.points()?;
    let mut steps = Vec::with_capacity(points.len() * scheme.steps.len());
    for point in &points {
        let suffix = point
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        for step in &scheme.steps {
            let mut repeated = step.clone();
            repeated.label = Some(format!("{}@{suffix}", step.label()));
            if repeated.substitutions.is_empty() {
                repeated.substitutions.push(point.clone());
            } else {
                for set in &mut repeated.substitutions {
                    for (name, value) in point {
                        set.insert(name.clone(), value.clone());
                    }
                }
            }
            steps.push(repeated);
        }
    }
    tracing::debug!(points = points.len(), steps = steps.len(), "expanded sweep");
    let expanded = CalibrationScheme::new(steps);
    expanded.validate()?;
    Ok(expanded)
}
