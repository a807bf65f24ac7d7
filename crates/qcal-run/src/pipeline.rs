//! End-to-end run wired from a [`RunConfig`].

use std::path::PathBuf;

use indexmap::IndexMap;
use qcal_core::errors::CalError;
use qcal_core::{AssumptionValue, LogLevel, LogRecord, Logger};
use qcal_scheme::{
    expand_sweep, load_assumptions, load_scheme, load_templates, AssumptionSnapshot,
    AssumptionStore, CalibrationScheme, ExecutionPlan, Resolver, TemplateLibrary,
};

use crate::config::RunConfig;
use crate::controller::{RunController, RunOptions};
use crate::data::FileDataSource;
use crate::fit::BuiltinFits;
use crate::log::{JsonLinesLogger, TeeLogger, TracingLogger};
use crate::report::{JsonReportSink, ReportSink, RunReport};

/// Loaded inputs of a run, with any sweep already applied.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    /// Template library.
    pub templates: TemplateLibrary,
    /// Scheme to execute.
    pub scheme: CalibrationScheme,
    /// Initial assumptions.
    pub assumptions: IndexMap<String, AssumptionValue>,
}

impl PreparedRun {
    /// Static plan against the initial assumptions.
    pub fn plan(&self) -> Result<ExecutionPlan, CalError> {
        let snapshot = AssumptionSnapshot::from_values(self.assumptions.clone());
        Resolver::new(&self.templates).plan(&self.scheme, &snapshot)
    }
}

/// Loads scheme, templates and assumptions named by `config`.
pub fn prepare(config: &RunConfig) -> Result<PreparedRun, CalError> {
    let templates = load_templates(config.templates_path())?;
    let mut scheme = load_scheme(config.scheme_path())?;
    let assumptions = load_assumptions(config.assumptions_path())?;
    if let Some(sweep) = &config.sweep {
        scheme = expand_sweep(&scheme, sweep)?;
        tracing::info!(steps = scheme.steps.len(), "scheme expanded over sweep");
    }
    Ok(PreparedRun {
        templates,
        scheme,
        assumptions,
    })
}

/// Artefacts of a finished (possibly halted) run.
#[derive(Debug)]
pub struct RunArtifacts {
    /// Report that was persisted.
    pub report: RunReport,
    /// Path of the report file.
    pub report_path: Option<PathBuf>,
    /// Path of the JSON-lines log.
    pub log_path: PathBuf,
    /// Error that halted the run, if any.
    pub halted: Option<CalError>,
}

/// Runs the configured scheme against files under the data root using the
/// built-in fit models, then writes the report.
///
/// Structural errors are returned before any fit runs. A halted run still
/// produces a report and is signalled through [`RunArtifacts::halted`].
pub fn run_configured(config: &RunConfig, options: RunOptions) -> Result<RunArtifacts, CalError> {
    let prepared = prepare(config)?;
    let journal = JsonLinesLogger::create(&config.log_dir_path())?;
    let tracing_logger = TracingLogger;
    let logger = TeeLogger::new().with(&journal).with(&tracing_logger);

    let mut data = FileDataSource::new(config.data_root_path());
    let mut fit = BuiltinFits;
    let store = AssumptionStore::from_values(prepared.assumptions.clone(), config.duplicate_policy);
    let options = RunOptions {
        max_relative_std: config.max_relative_std,
        ..options
    };

    let mut controller = RunController::new(
        &prepared.templates,
        &prepared.scheme,
        store,
        &mut data,
        &mut fit,
        &logger,
    )
    .with_options(options);
    let halted = match controller.run_all() {
        Ok(_) => None,
        Err(err) if err.is_structural() => return Err(err),
        Err(err) => Some(err),
    };
    let summary = controller.summary().clone();
    let store = controller.into_store();

    let report = RunReport::new(
        &prepared.scheme,
        &prepared.templates,
        prepared.assumptions,
        store.snapshot().values(),
        summary,
        store.warnings().to_vec(),
    )?;
    let mut sink = JsonReportSink::new(config.report_dir_path());
    sink.save(&report)?;
    let report_path = sink.last_path().map(PathBuf::from);
    logger.record(
        &LogRecord::new(LogLevel::Info, "", "Report saved")
            .with_payload(serde_json::json!({ "path": report_path })),
    );

    Ok(RunArtifacts {
        report_path,
        log_path: journal.path().to_path_buf(),
        report,
        halted,
    })
}
