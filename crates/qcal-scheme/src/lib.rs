#![deny(missing_docs)]
#![doc = "Placeholder substitution, assumption storage and scheme resolution for qcal."]

/// Assumption store with snapshot isolation.
pub mod assumptions;
/// Canonical hashing helpers.
pub mod hash;
/// Declarative scheme, template and assumption loading.
pub mod loader;
/// Placeholder substitution engine.
pub mod placeholder;
/// Calibration scheme resolver.
pub mod resolve;
/// Calibration scheme and step definitions.
pub mod scheme;
/// Canonical JSON, YAML and TOML serde helpers.
pub mod serde;
/// Scheme repetition over substitution grids.
pub mod sweep;
/// Calibration templates and libraries.
pub mod template;

pub use assumptions::{
    AssumptionEntry, AssumptionSnapshot, AssumptionStore, DuplicatePolicy, Origin,
    OverwriteWarning,
};
pub use hash::stable_hash_string;
pub use loader::{
    load_assumptions, load_scheme, load_templates, FileLoader, SchemeLoader, SourceFormat,
    TemplateLoader,
};
pub use placeholder::{
    expand, Binding, BindingScope, BindingSource, Expanded, Expansion, KeySource,
    MissingBinding, Pairing, Pattern, Requirement, VariantBindings,
};
pub use resolve::{
    ExecutionPlan, PlanEntry, PlannedStep, ResolvedEntry, ResolvedInput, ResolvedOutput,
    Resolver, StepResolution, UnresolvedVariant, Variant,
};
pub use scheme::{CalibrationScheme, CalibrationStep, StepId};
pub use sweep::{expand_sweep, SweepParameter, SweepPlan};
pub use template::{CalibrationTemplate, OutputSpec, ParameterBounds, TemplateLibrary};
