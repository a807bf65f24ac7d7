//! Expansion of a calibration scheme into resolved step variants.
//!
//! [`Resolver::plan`] is the static pass: it walks the scheme against a
//! projection of the initial assumptions plus every output key declared by
//! earlier steps, so structural problems surface before any fit runs.
//! [`Resolver::resolve_step`] is the dynamic pass the run controller uses
//! against the live assumption snapshot.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo, ErrorKind};
use qcal_core::{AssumptionValue, DataDescriptor};
use serde::Serialize;

use crate::assumptions::AssumptionSnapshot;
use crate::placeholder::{expand, match_key, Binding, BindingScope, Expanded, KeySource};
use crate::scheme::{CalibrationScheme, CalibrationStep, StepId};
use crate::template::{CalibrationTemplate, TemplateLibrary};

/// Assumption read forwarded to the fit backend as an initial guess.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedInput {
    /// Assumption key the value is read from.
    pub key: String,
    /// Current value; `None` while planning if produced by an earlier step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<AssumptionValue>,
}

/// Assumption write derived from a fitted parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedOutput {
    /// Fit parameter providing the value.
    pub parameter: String,
    /// Assumption key the value is stored under.
    pub key: String,
    /// Factor applied before storing.
    pub scale: f64,
}

/// One concrete instantiation of a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    /// Position among the step's enumerated variants.
    pub ordinal: usize,
    /// Substitution set or zip index of the variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Resolved calibration name.
    pub name: String,
    /// Bindings in template token order.
    pub bindings: IndexMap<String, Binding>,
    /// Initial guess per fit parameter.
    pub inputs: IndexMap<String, ResolvedInput>,
    /// Writes performed on success; empty means every fitted parameter is
    /// stored under `<name>/<parameter>`.
    pub outputs: Vec<ResolvedOutput>,
    /// Data-source descriptor.
    pub data: DataDescriptor,
}

impl Variant {
    /// Returns whether any binding or input still waits for a value.
    pub fn is_deferred(&self) -> bool {
        self.bindings.values().any(|binding| binding.value.is_none())
            || self.inputs.values().any(|input| input.value.is_none())
    }

    /// Initial guess handed to the fit backend.
    pub fn guess(&self) -> IndexMap<String, AssumptionValue> {
        self.inputs
            .iter()
            .filter_map(|(parameter, input)| {
                input
                    .value
                    .as_ref()
                    .map(|value| (parameter.clone(), value.clone()))
            })
            .collect()
    }

    fn same_bindings(&self, bindings: &IndexMap<String, Binding>) -> bool {
        self.bindings.len() == bindings.len()
            && self
                .bindings
                .iter()
                .zip(bindings.iter())
                .all(|((left_token, left), (right_token, right))| {
                    left_token == right_token
                        && left.index == right.index
                        && left.source == right.source
                })
    }
}

/// Variant that cannot run because a required binding or input is missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedVariant {
    /// Substitution set or zip index of the variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Calibration name as far as it could be rendered.
    pub name: String,
    /// Placeholder or input parameter lacking a value.
    pub token: String,
    /// Assumption key that was looked for.
    pub key: String,
    /// Bindings established before the miss, if any.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub bindings: IndexMap<String, Binding>,
}

impl UnresolvedVariant {
    /// Error describing why the variant could not be resolved.
    pub fn error(&self, step: &StepId) -> CalError {
        CalError::UnresolvedPlaceholder(
            ErrorInfo::new(
                "qcal.resolve.unresolved_variant",
                format!("'{}' has no value for '{}'", self.key, self.token),
            )
            .with_context("step", step.to_string())
            .with_context("name", self.name.as_str())
            .with_context("token", self.token.as_str())
            .with_context("key", self.key.as_str()),
        )
    }
}

/// Resolved or unresolved variant, kept in enumeration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ResolvedEntry {
    /// Every binding and input is available.
    Resolved(Variant),
    /// A required binding or input is missing.
    Unresolved(UnresolvedVariant),
}

/// Outcome of resolving a single step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResolution {
    /// Step the resolution belongs to.
    pub step: StepId,
    /// Variants in enumeration order.
    pub entries: Vec<ResolvedEntry>,
    /// Optional token whose absence skipped the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl StepResolution {
    /// Resolved variants in order.
    pub fn variants(&self) -> impl Iterator<Item = &Variant> {
        self.entries.iter().filter_map(|entry| match entry {
            ResolvedEntry::Resolved(variant) => Some(variant),
            ResolvedEntry::Unresolved(_) => None,
        })
    }

    /// Unresolved variants in order.
    pub fn unresolved(&self) -> impl Iterator<Item = &UnresolvedVariant> {
        self.entries.iter().filter_map(|entry| match entry {
            ResolvedEntry::Unresolved(unresolved) => Some(unresolved),
            ResolvedEntry::Resolved(_) => None,
        })
    }

    /// Returns whether the step was skipped by an optional placeholder.
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// Adds an unresolved entry for every planned variant the live
    /// resolution no longer produces, so upstream failures surface as
    /// missing bindings instead of silently shrinking the step.
    pub fn reconcile(&mut self, planned: &StepResolution, snapshot: &AssumptionSnapshot) {
        let mut lost = Vec::new();
        for expected in planned.variants() {
            let covered = self.entries.iter().any(|entry| match entry {
                ResolvedEntry::Resolved(variant) => variant.same_bindings(&expected.bindings),
                ResolvedEntry::Unresolved(unresolved) if !unresolved.bindings.is_empty() => {
                    expected.same_bindings(&unresolved.bindings)
                }
                ResolvedEntry::Unresolved(unresolved) => {
                    unresolved.index.is_some() && unresolved.index == expected.index
                }
            });
            if covered {
                continue;
            }
            let (token, key) = expected
                .bindings
                .values()
                .find_map(|binding| {
                    binding
                        .key()
                        .filter(|key| !snapshot.contains_key(key))
                        .map(|key| (binding.token.clone(), key.to_string()))
                })
                .or_else(|| {
                    expected.inputs.iter().find_map(|(parameter, input)| {
                        (!snapshot.contains_key(&input.key))
                            .then(|| (parameter.clone(), input.key.clone()))
                    })
                })
                .unwrap_or_else(|| (String::new(), expected.name.clone()));
            lost.push(ResolvedEntry::Unresolved(UnresolvedVariant {
                index: expected.index,
                name: expected.name.clone(),
                token,
                key,
                bindings: expected.bindings.clone(),
            }));
        }
        self.entries.extend(lost);
    }
}

/// Step of an [`ExecutionPlan`] with its static resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedStep {
    /// Template the step instantiates.
    pub template: String,
    /// Static resolution (values of later-produced keys are deferred).
    pub resolution: StepResolution,
    /// Keys the step reads.
    pub consumes: Vec<String>,
    /// Keys the step writes on success.
    pub produces: Vec<String>,
}

/// `(step, variant, data descriptor)` entry of the execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry<'a> {
    /// Step identifier.
    pub step: &'a StepId,
    /// Resolved variant.
    pub variant: &'a Variant,
}

impl PlanEntry<'_> {
    /// Data-source descriptor of the variant.
    pub fn data(&self) -> &DataDescriptor {
        &self.variant.data
    }
}

/// Ordered, statically checked execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ExecutionPlan {
    /// Planned steps in scheme order.
    pub steps: Vec<PlannedStep>,
}

impl ExecutionPlan {
    /// Every planned variant in execution order.
    pub fn entries(&self) -> impl Iterator<Item = PlanEntry<'_>> {
        self.steps.iter().flat_map(|planned| {
            planned.resolution.variants().map(move |variant| PlanEntry {
                step: &planned.resolution.step,
                variant,
            })
        })
    }

    /// Planned step at `position`.
    pub fn step(&self, position: usize) -> Option<&PlannedStep> {
        self.steps.get(position)
    }

    /// Number of resolved variants across all steps.
    pub fn variant_count(&self) -> usize {
        self.entries().count()
    }

    /// Number of variants already known to be unresolvable.
    pub fn unresolved_count(&self) -> usize {
        self.steps
            .iter()
            .map(|planned| planned.resolution.unresolved().count())
            .sum()
    }
}

/// Initial assumptions plus keys declared by already planned steps.
struct Projection<'a> {
    initial: &'a AssumptionSnapshot,
    produced: IndexMap<String, usize>,
}

impl<'a> Projection<'a> {
    fn new(initial: &'a AssumptionSnapshot) -> Self {
        Self {
            initial,
            produced: IndexMap::new(),
        }
    }
}

impl KeySource for Projection<'_> {
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, Option<&AssumptionValue>)> + '_> {
        let initial = self.initial.iter().map(|(key, value)| {
            if self.produced.contains_key(key) {
                (key, None)
            } else {
                (key, Some(value))
            }
        });
        let produced = self
            .produced
            .keys()
            .filter(|key| !self.initial.contains_key(key))
            .map(|key| (key.as_str(), None));
        Box::new(initial.chain(produced))
    }

    fn lookup(&self, key: &str) -> Option<Option<&AssumptionValue>> {
        if self.produced.contains_key(key) {
            return Some(None);
        }
        self.initial.get(key).map(Some)
    }
}

/// Output keys a step declares, rendered with its substitution sets alone.
fn declared_outputs(step: &CalibrationStep, template: &CalibrationTemplate) -> Vec<String> {
    let mut keys = Vec::new();
    for output in template.outputs.values() {
        if step.substitutions.is_empty() {
            let (key, complete) = output.key().render_with(|_| None);
            if complete {
                keys.push(key);
            }
            continue;
        }
        for set in &step.substitutions {
            let (key, complete) =
                output
                    .key()
                    .render_with(|token| set.get(token).map(ToString::to_string));
            if complete && !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Resolves schemes and steps against a template library.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    templates: &'a TemplateLibrary,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver over `templates`.
    pub fn new(templates: &'a TemplateLibrary) -> Self {
        Self { templates }
    }

    fn template_for(&self, id: &StepId, step: &CalibrationStep) -> Result<&'a CalibrationTemplate, CalError> {
        self.templates
            .get(&step.template)
            .map_err(|err| err.with_context("step", id.to_string()))
    }

    /// Static pass over the whole scheme.
    ///
    /// Fails with [`CalError::SchemeValidation`] for structural problems,
    /// including a step consuming a key that only it or a later step
    /// produces, and with [`CalError::UnresolvedPlaceholder`] when a required
    /// binding is not available at all.
    pub fn plan(
        &self,
        scheme: &CalibrationScheme,
        initial: &AssumptionSnapshot,
    ) -> Result<ExecutionPlan, CalError> {
        scheme.validate()?;
        let mut declared: Vec<(usize, String, Vec<String>)> = Vec::with_capacity(scheme.steps.len());
        for (id, step) in scheme.iter() {
            let template = self.template_for(&id, step)?;
            declared.push((id.position, id.label.clone(), declared_outputs(step, template)));
        }

        let mut projection = Projection::new(initial);
        let mut steps = Vec::with_capacity(scheme.steps.len());
        for (id, step) in scheme.iter() {
            let template = self.template_for(&id, step)?;
            let resolution = self
                .resolve_with(&id, step, template, &projection)
                .map_err(|err| ordering_violation(err, &id, &declared))?;
            for unresolved in resolution.unresolved() {
                let err = unresolved.error(&id);
                if let Some(violation) = producer_at_or_after(&unresolved.key, &id, &declared) {
                    return Err(violation);
                }
                tracing::warn!(step = %id, error = %err, "variant is unresolvable");
            }

            let mut consumes = Vec::new();
            let mut produces = Vec::new();
            for variant in resolution.variants() {
                let keys = variant
                    .bindings
                    .values()
                    .filter_map(Binding::key)
                    .chain(variant.inputs.values().map(|input| input.key.as_str()));
                for key in keys {
                    if !consumes.iter().any(|known| known == key) {
                        consumes.push(key.to_string());
                    }
                }
                for output in &variant.outputs {
                    if output.key.contains('{') {
                        tracing::debug!(step = %id, key = %output.key, "output key depends on a deferred value");
                        continue;
                    }
                    if !produces.contains(&output.key) {
                        produces.push(output.key.clone());
                    }
                }
            }
            for key in &produces {
                projection.produced.insert(key.clone(), id.position);
            }
            tracing::debug!(
                step = %id,
                variants = resolution.variants().count(),
                unresolved = resolution.unresolved().count(),
                "planned step"
            );
            steps.push(PlannedStep {
                template: template.name.clone(),
                resolution,
                consumes,
                produces,
            });
        }
        Ok(ExecutionPlan { steps })
    }

    /// Dynamic pass for one step against the live snapshot.
    ///
    /// Keys last written by this step or a later one are invisible, so a
    /// re-run or out-of-order step only binds upstream results.
    pub fn resolve_step(
        &self,
        id: &StepId,
        step: &CalibrationStep,
        snapshot: &AssumptionSnapshot,
    ) -> Result<StepResolution, CalError> {
        let template = self.template_for(id, step)?;
        let visible = snapshot.visible_to(id.position);
        self.resolve_with(id, step, template, &visible)
    }

    fn resolve_with(
        &self,
        id: &StepId,
        step: &CalibrationStep,
        template: &CalibrationTemplate,
        source: &dyn KeySource,
    ) -> Result<StepResolution, CalError> {
        let tokens = template.tokens(step.data.as_ref());
        let scope = BindingScope::new(source).with_substitutions(&step.substitutions);
        let expansion = expand(
            &tokens,
            |token| template.requirement(token),
            template.pairing,
            &scope,
        )
        .map_err(|err| {
            err.with_context("step", id.to_string())
                .with_context("template", template.name.as_str())
        })?;

        if let Some(token) = expansion.skipped {
            tracing::info!(step = %id, token = %token, "optional placeholder unbound, skipping step");
            return Ok(StepResolution {
                step: id.clone(),
                entries: Vec::new(),
                skipped: Some(token),
            });
        }

        let name_pattern = template.name_pattern();
        let data_pattern = step.data.as_ref().or(template.data.as_ref());
        let mut names = BTreeSet::new();
        let mut entries = Vec::with_capacity(expansion.entries.len());
        for (ordinal, entry) in expansion.entries.into_iter().enumerate() {
            let bound = match entry {
                Expanded::Missing(missing) => {
                    entries.push(ResolvedEntry::Unresolved(UnresolvedVariant {
                        index: missing.index,
                        name: name_pattern.as_str().to_string(),
                        token: missing.token,
                        key: missing.key,
                        bindings: IndexMap::new(),
                    }));
                    continue;
                }
                Expanded::Bound(bound) => bound,
            };

            let name = name_pattern.render(&bound.bindings);
            let mut inputs = IndexMap::new();
            let mut missing_input = None;
            for (parameter, pattern) in &template.inputs {
                let Some(key) = pattern.try_render(&bound.bindings) else {
                    inputs.insert(
                        parameter.clone(),
                        ResolvedInput {
                            key: pattern.render(&bound.bindings),
                            value: None,
                        },
                    );
                    continue;
                };
                match scope.lookup(&key) {
                    Some(value) => {
                        inputs.insert(
                            parameter.clone(),
                            ResolvedInput {
                                key,
                                value: value.cloned(),
                            },
                        );
                    }
                    None => {
                        missing_input = Some((parameter.clone(), key));
                        break;
                    }
                }
            }
            if let Some((parameter, key)) = missing_input {
                entries.push(ResolvedEntry::Unresolved(UnresolvedVariant {
                    index: bound.index,
                    name,
                    token: parameter,
                    key,
                    bindings: bound.bindings,
                }));
                continue;
            }

            if !names.insert(name.clone()) {
                return Err(CalError::SchemeValidation(
                    ErrorInfo::new(
                        "qcal.resolve.duplicate_variant",
                        format!("variant name '{name}' is produced more than once"),
                    )
                    .with_context("step", id.to_string())
                    .with_context("name", name.as_str())
                    .with_hint("add the varying placeholder to the template pattern"),
                ));
            }

            let outputs = template
                .outputs
                .iter()
                .map(|(parameter, output)| ResolvedOutput {
                    parameter: parameter.clone(),
                    key: output.key().render(&bound.bindings),
                    scale: output.scale(),
                })
                .collect();
            let data = DataDescriptor::new(
                data_pattern.map_or_else(|| name.clone(), |pattern| pattern.render(&bound.bindings)),
            );
            entries.push(ResolvedEntry::Resolved(Variant {
                ordinal,
                index: bound.index,
                name,
                bindings: bound.bindings,
                inputs,
                outputs,
                data,
            }));
        }

        let resolution = StepResolution {
            step: id.clone(),
            entries,
            skipped: None,
        };
        if resolution.variants().next().is_none() {
            if let Some(unresolved) = resolution.unresolved().next() {
                return Err(unresolved
                    .error(id)
                    .with_context("template", template.name.as_str()));
            }
        }
        Ok(resolution)
    }
}

/// Turns an unresolved placeholder into an ordering violation when the
/// missing key is declared by the same or a later step.
fn ordering_violation(err: CalError, id: &StepId, declared: &[(usize, String, Vec<String>)]) -> CalError {
    if err.kind() != ErrorKind::UnresolvedPlaceholder {
        return err;
    }
    let context = &err.info().context;
    let missing = context
        .get("key")
        .or_else(|| context.get("token"))
        .cloned();
    match missing.and_then(|key| producer_at_or_after(&key, id, declared)) {
        Some(violation) => violation,
        None => err,
    }
}

fn producer_at_or_after(
    missing: &str,
    id: &StepId,
    declared: &[(usize, String, Vec<String>)],
) -> Option<CalError> {
    declared
        .iter()
        .filter(|(position, _, _)| *position >= id.position)
        .find_map(|(position, label, keys)| {
            keys.iter()
                .find(|key| *key == missing || match_key(missing, key).is_some())
                .map(|key| {
                    CalError::SchemeValidation(
                        ErrorInfo::new(
                            "qcal.scheme.order",
                            format!(
                                "step '{}' consumes '{key}' before step '{label}' produces it",
                                id.label
                            ),
                        )
                        .with_context("step", id.to_string())
                        .with_context("key", key.as_str())
                        .with_context("producer", format!("#{position} {label}"))
                        .with_hint("move the producing step earlier in the scheme"),
                    )
                })
        })
}
