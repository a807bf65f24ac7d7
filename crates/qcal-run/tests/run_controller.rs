use indexmap::IndexMap;
use qcal_core::errors::CalError;
use qcal_core::{
    AssumptionValue, ErrorKind, FitBackend, FitParameters, FitRequest, MeasurementData,
    NullLogger,
};
use qcal_run::{
    BuiltinFits, CancelFlag, MemoryDataSource, MemoryLogger, RunController, RunOptions,
    RunStatus, StepRecord, VariantState,
};
use qcal_scheme::{
    AssumptionStore, CalibrationScheme, CalibrationStep, CalibrationTemplate, DuplicatePolicy,
    OutputSpec, Pattern, Requirement, TemplateLibrary,
};

fn pattern(source: &str) -> Pattern {
    Pattern::parse(source).expect("pattern")
}

fn idx_sets(count: usize) -> Vec<IndexMap<String, AssumptionValue>> {
    (0..count)
        .map(|idx| IndexMap::from([("idx".to_string(), AssumptionValue::Number(idx as f64))]))
        .collect()
}

fn library() -> TemplateLibrary {
    let mut pulse = CalibrationTemplate::new("pulse", "linear");
    pulse.pattern = Some(pattern("pulse_{idx}"));
    pulse
        .outputs
        .insert("slope".into(), OutputSpec::Key(pattern("value_a_{idx}")));

    let mut follow = CalibrationTemplate::new("follow", "constant");
    follow.pattern = Some(pattern("follow_{idx}"));
    follow.inputs.insert("mean".into(), pattern("value_a_{idx}"));

    let mut drive = CalibrationTemplate::new("drive", "constant");
    drive.pattern = Some(pattern("drive_{amp}"));
    drive.placeholders.insert("amp".into(), Requirement::Optional);

    let mut library = TemplateLibrary::new();
    for template in [pulse, follow, drive] {
        library.insert(template).expect("template");
    }
    library
}

fn step(template: &str, sets: usize) -> CalibrationStep {
    let mut step = CalibrationStep::new(template);
    step.substitutions = idx_sets(sets);
    step
}

fn line(descriptor: &str, slope: f64) -> MeasurementData {
    MeasurementData::new(descriptor)
        .with_column("x", vec![0.0, 1.0, 2.0, 3.0])
        .with_column("y", vec![1.0, 1.0 + slope, 1.0 + 2.0 * slope, 1.0 + 3.0 * slope])
}

fn flat(descriptor: &str, value: f64) -> MeasurementData {
    MeasurementData::new(descriptor).with_column("y", vec![value; 4])
}

/// `pulse_1` cannot be fitted: every x sample is equal.
fn data_with_failing_pulse() -> MemoryDataSource {
    MemoryDataSource::new()
        .with("pulse_0", line("pulse_0", 2.0))
        .with(
            "pulse_1",
            MeasurementData::new("pulse_1")
                .with_column("x", vec![1.0, 1.0, 1.0])
                .with_column("y", vec![1.0, 2.0, 3.0]),
        )
        .with("follow_0", flat("follow_0", 2.0))
        .with("follow_1", flat("follow_1", 3.0))
}

fn two_step_scheme() -> CalibrationScheme {
    CalibrationScheme::new(vec![step("pulse", 2), step("follow", 2)])
}

#[test]
fn upstream_failure_surfaces_as_unresolved_downstream_variant() {
    let library = library();
    let scheme = two_step_scheme();
    let mut data = data_with_failing_pulse();
    let mut fit = BuiltinFits;
    let logger = MemoryLogger::new();
    let mut controller = RunController::new(
        &library,
        &scheme,
        AssumptionStore::default(),
        &mut data,
        &mut fit,
        &logger,
    );
    let summary = controller.run_all().expect("run");
    assert_eq!(summary.status, RunStatus::Completed);

    let pulse = summary.step("pulse").expect("pulse record");
    assert_eq!(pulse.recorded(), 1);
    let failed = &pulse.outcomes[1];
    assert_eq!(failed.name, "pulse_1");
    assert_eq!(
        failed.trace,
        [
            VariantState::Pending,
            VariantState::DataAcquired,
            VariantState::FitAttempted,
            VariantState::Failed
        ]
    );
    assert_eq!(
        failed.error.as_ref().map(|error| error.kind),
        Some(ErrorKind::FitConvergence)
    );

    let follow = summary.step("follow").expect("follow record");
    assert_eq!(follow.outcomes.len(), 2);
    assert!(follow.outcomes[0].is_recorded());
    let unresolved = &follow.outcomes[1];
    assert_eq!(unresolved.name, "follow_1");
    assert_eq!(unresolved.index, Some(1));
    let error = unresolved.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::UnresolvedPlaceholder);
    assert_eq!(error.info.context.get("key").map(String::as_str), Some("value_a_1"));

    let store = controller.store();
    assert_eq!(store.get("value_a_0").expect("a0"), &AssumptionValue::Number(2.0));
    assert!(!store.contains_key("value_a_1"));
    assert!(store.contains_key("follow_0/mean"));
    assert!(!store.contains_key("follow_1/mean"));

    let messages: Vec<String> = logger
        .records()
        .into_iter()
        .map(|record| record.message)
        .collect();
    assert!(messages.iter().any(|message| message == "Fit recorded"));
    assert!(messages.iter().any(|message| message == "Calibration failed"));
}

#[test]
fn failed_variant_leaves_store_untouched_and_later_variants_run() {
    let library = library();
    let mut pulse = step("pulse", 3);
    pulse.substitutions.swap(0, 1);
    let scheme = CalibrationScheme::new(vec![pulse]);
    let mut data = data_with_failing_pulse().with("pulse_2", line("pulse_2", 4.0));
    let mut fit = BuiltinFits;
    let initial = IndexMap::from([("qubit/freq".to_string(), AssumptionValue::Number(4.4))]);
    let mut controller = RunController::new(
        &library,
        &scheme,
        AssumptionStore::from_values(initial.clone(), DuplicatePolicy::Overwrite),
        &mut data,
        &mut fit,
        &NullLogger,
    );
    let summary = controller.run_all().expect("run");

    let names: Vec<&str> = summary.outcomes().map(|outcome| outcome.name.as_str()).collect();
    assert_eq!(names, ["pulse_1", "pulse_0", "pulse_2"]);
    assert!(summary.outcomes().nth(0).is_some_and(|outcome| outcome.is_failed()));
    assert_eq!(summary.recorded(), 2);
    assert_eq!(summary.failed(), 1);

    let failures = summary.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, ErrorKind::FitConvergence);

    let values = controller.store().snapshot().values();
    assert_eq!(values.len(), 3);
    assert_eq!(values["qubit/freq"], AssumptionValue::Number(4.4));
    assert_eq!(values["value_a_2"], AssumptionValue::Number(4.0));
}

#[test]
fn identical_inputs_give_identical_runs() {
    let library = library();
    let scheme = two_step_scheme();
    let run = || {
        let mut data = data_with_failing_pulse();
        let mut fit = BuiltinFits;
        let mut controller = RunController::new(
            &library,
            &scheme,
            AssumptionStore::default(),
            &mut data,
            &mut fit,
            &NullLogger,
        );
        let summary = controller.run_all().expect("run");
        (summary, controller.into_store().snapshot().values())
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(
        first.1.keys().collect::<Vec<_>>(),
        ["value_a_0", "follow_0/mean"]
    );
}

#[test]
fn mandatory_failure_halts_and_keeps_the_partial_summary() {
    let library = library();
    let scheme = CalibrationScheme::new(vec![step("pulse", 2).mandatory(), step("follow", 2)]);
    let mut data = data_with_failing_pulse();
    let mut fit = BuiltinFits;
    {
        let mut controller = RunController::new(
            &library,
            &scheme,
            AssumptionStore::default(),
            &mut data,
            &mut fit,
            &NullLogger,
        );
        let err = controller.run_all().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MandatoryStep);
        assert_eq!(err.info().context.get("name").map(String::as_str), Some("pulse_1"));

        let summary = controller.summary();
        assert_eq!(
            summary.status,
            RunStatus::Halted {
                step: "pulse".into(),
                name: "pulse_1".into()
            }
        );
        assert_eq!(summary.steps.len(), 1);
        assert_eq!(summary.recorded(), 1);
    }
    assert_eq!(data.fetched(), ["pulse_0", "pulse_1"]);
}

#[test]
fn structural_errors_abort_before_any_fetch() {
    let library = library();
    let scheme = CalibrationScheme::new(vec![step("follow", 2)]);
    let mut data = data_with_failing_pulse();
    let mut fit = BuiltinFits;
    {
        let mut controller = RunController::new(
            &library,
            &scheme,
            AssumptionStore::default(),
            &mut data,
            &mut fit,
            &NullLogger,
        );
        let err = controller.run_all().unwrap_err();
        assert!(err.is_structural());
        assert_eq!(controller.summary().status, RunStatus::NotStarted);
    }
    assert!(data.fetched().is_empty());
}

#[test]
fn run_step_resolves_against_the_current_store() {
    let library = library();
    let scheme = two_step_scheme();
    let mut data = data_with_failing_pulse();
    let mut fit = BuiltinFits;
    let mut controller = RunController::new(
        &library,
        &scheme,
        AssumptionStore::default(),
        &mut data,
        &mut fit,
        &NullLogger,
    );

    let err = controller.run_step("nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemeValidation);

    let pulse = controller.run_step("pulse").expect("pulse");
    assert_eq!(pulse.recorded(), 1);
    assert_eq!(pulse.assumptions.len(), 1);

    let follow = controller.run_step("follow").expect("follow");
    assert_eq!(follow.recorded(), 1);
    assert_eq!(follow.failed(), 1);
    assert_eq!(controller.summary().steps.len(), 2);
    assert_eq!(controller.summary().status, RunStatus::Running);
}

#[test]
fn optional_placeholder_without_binding_skips_the_step() {
    let library = library();
    let scheme = CalibrationScheme::new(vec![CalibrationStep::new("drive"), step("pulse", 1)]);
    let mut data = data_with_failing_pulse();
    let mut fit = BuiltinFits;
    let mut controller = RunController::new(
        &library,
        &scheme,
        AssumptionStore::default(),
        &mut data,
        &mut fit,
        &NullLogger,
    );
    let summary = controller.run_all().expect("run");
    let drive = summary.step("drive").expect("drive record");
    assert_eq!(drive.skipped.as_deref(), Some("amp"));
    assert_eq!(drive.outcomes[0].state, VariantState::Skipped);
    assert_eq!(summary.skipped(), 1);
    assert_eq!(summary.attempted(), 1);
    assert!(summary.is_success());
}

#[test]
fn rejecting_store_fails_the_rewriting_variant_only() {
    let library = library();
    let scheme = CalibrationScheme::new(vec![step("pulse", 1)]);
    let mut data = data_with_failing_pulse();
    let mut fit = BuiltinFits;
    let initial = IndexMap::from([("value_a_0".to_string(), AssumptionValue::Number(1.0))]);
    let mut controller = RunController::new(
        &library,
        &scheme,
        AssumptionStore::from_values(initial, DuplicatePolicy::Reject),
        &mut data,
        &mut fit,
        &NullLogger,
    );
    let summary = controller.run_all().expect("run");
    let outcome = summary.outcomes().next().expect("outcome");
    assert_eq!(
        outcome.error.as_ref().map(|error| error.kind),
        Some(ErrorKind::DuplicateAssumption)
    );
    assert_eq!(
        controller.store().get("value_a_0").expect("kept"),
        &AssumptionValue::Number(1.0)
    );
}

struct CancellingFits {
    inner: BuiltinFits,
    cancel: CancelFlag,
}

impl FitBackend for CancellingFits {
    fn fit(&mut self, request: &FitRequest<'_>) -> Result<FitParameters, CalError> {
        self.cancel.cancel();
        self.inner.fit(request)
    }
}

#[test]
fn cancellation_stops_between_steps() {
    let library = library();
    let scheme = two_step_scheme();
    let mut data = data_with_failing_pulse();
    let cancel = CancelFlag::new();
    let mut fit = CancellingFits {
        inner: BuiltinFits,
        cancel: cancel.clone(),
    };
    let options = RunOptions {
        cancel,
        ..RunOptions::default()
    };
    let mut controller = RunController::new(
        &library,
        &scheme,
        AssumptionStore::default(),
        &mut data,
        &mut fit,
        &NullLogger,
    )
    .with_options(options);
    let summary = controller.run_all().expect("run");
    assert_eq!(
        summary.status,
        RunStatus::Cancelled {
            after: Some("pulse".into())
        }
    );
    assert_eq!(summary.steps.len(), 1);
    assert_eq!(summary.steps[0].outcomes.len(), 2);
}

/// `early` binds `v_<n>` from the store; `late` writes `v_1`.
fn upstream_library() -> TemplateLibrary {
    let mut early = CalibrationTemplate::new("early", "constant");
    early.pattern = Some(pattern("early_{v}"));

    let mut late = CalibrationTemplate::new("late", "constant");
    late.pattern = Some(pattern("late_{idx}"));
    late.outputs
        .insert("mean".into(), OutputSpec::Key(pattern("v_{idx}")));

    let mut library = TemplateLibrary::new();
    for template in [early, late] {
        library.insert(template).expect("template");
    }
    library
}

fn early_then_late() -> CalibrationScheme {
    CalibrationScheme::new(vec![
        CalibrationStep::new("early"),
        CalibrationStep::new("late").with_substitution(IndexMap::from([(
            "idx".to_string(),
            AssumptionValue::Number(1.0),
        )])),
    ])
}

fn upstream_data() -> MemoryDataSource {
    MemoryDataSource::new()
        .with("early_5", flat("early_5", 1.0))
        .with("early_7", flat("early_7", 1.0))
        .with("late_1", flat("late_1", 7.0))
}

fn upstream_store() -> AssumptionStore {
    AssumptionStore::from_values(
        IndexMap::from([("v_0".to_string(), AssumptionValue::Number(5.0))]),
        DuplicatePolicy::Overwrite,
    )
}

fn names(record: &StepRecord) -> Vec<&str> {
    record.outcomes.iter().map(|outcome| outcome.name.as_str()).collect()
}

#[test]
fn out_of_order_step_ignores_downstream_writes() {
    let library = upstream_library();
    let scheme = early_then_late();
    let mut data = upstream_data();
    let mut fit = BuiltinFits;
    {
        let mut controller = RunController::new(
            &library,
            &scheme,
            upstream_store(),
            &mut data,
            &mut fit,
            &NullLogger,
        );
        let late = controller.run_step("late").expect("late");
        assert_eq!(late.recorded(), 1);
        assert_eq!(
            controller.store().get("v_1").expect("v_1"),
            &AssumptionValue::Number(7.0)
        );

        let early = controller.run_step("early").expect("early");
        assert_eq!(names(&early), ["early_5"]);
        assert!(early.outcomes[0].is_recorded());
    }
    assert_eq!(data.fetched(), ["late_1", "early_5"]);
}

#[test]
fn repeated_run_all_starts_a_fresh_summary() {
    let library = upstream_library();
    let scheme = early_then_late();
    let mut data = upstream_data();
    let mut fit = BuiltinFits;
    let mut controller = RunController::new(
        &library,
        &scheme,
        upstream_store(),
        &mut data,
        &mut fit,
        &NullLogger,
    );
    let first = controller.run_all().expect("first run");
    let second = controller.run_all().expect("second run");
    assert_eq!(first.steps.len(), 2);
    assert_eq!(second.steps.len(), 2);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.attempted(), 2);
    for summary in [&first, &second] {
        assert_eq!(names(summary.step("early").expect("early record")), ["early_5"]);
        assert_eq!(names(summary.step("late").expect("late record")), ["late_1"]);
    }
    assert_eq!(controller.store().warnings().len(), 2);

    let early = controller.run_step("early").expect("early");
    assert_eq!(names(&early), ["early_5"]);
    assert_eq!(controller.summary().status, RunStatus::Running);
    assert_eq!(controller.summary().steps.len(), 3);
}

