#![deny(missing_docs)]
#![doc = "Calibration step execution, run control and reporting for qcal."]

/// Run configuration files.
pub mod config;
/// Sequential run controller.
pub mod controller;
/// File and in-memory measurement sources.
pub mod data;
pub mod executor;
/// Closed-form reference fit models.
pub mod fit;
/// Logger implementations.
pub mod log;
pub mod pipeline;
/// Run reports and report sinks.
pub mod report;
/// Aggregated run outcomes.
pub mod summary;

pub use config::{load_config, RunConfig};
pub use controller::{CancelFlag, RunController, RunOptions};
pub use data::{FileDataSource, MemoryDataSource};
pub use executor::{
    derive_writes, validate_fit, AssumptionWrite, FitResult, OutcomeError, StepExecutor,
    VariantOutcome, VariantState,
};
pub use fit::BuiltinFits;
pub use log::{JsonLinesLogger, MemoryLogger, TeeLogger, TracingLogger};
pub use pipeline::{prepare, run_configured, PreparedRun, RunArtifacts};
pub use report::{
    AssumptionChange, AssumptionDiff, JsonReportSink, MemoryReportSink, ReportSink, RunReport,
};
pub use summary::{FailureEntry, RunStatus, RunSummary, StepRecord};
