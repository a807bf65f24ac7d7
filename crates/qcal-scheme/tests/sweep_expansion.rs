use indexmap::IndexMap;
use qcal_core::{AssumptionValue, ErrorKind};
use qcal_scheme::{expand_sweep, CalibrationScheme, CalibrationStep, SweepParameter, SweepPlan};

fn scheme() -> CalibrationScheme {
    CalibrationScheme::new(vec![
        CalibrationStep::new("spectroscopy"),
        CalibrationStep::new("rabi").with_substitution(IndexMap::from([(
            "pulse".to_string(),
            AssumptionValue::from("pi"),
        )])),
    ])
}

#[test]
fn flux_sweep_repeats_every_step_per_value() {
    let plan = SweepPlan::single(
        "flux",
        vec![AssumptionValue::Number(0.0), AssumptionValue::Number(0.25)],
    );
    let expanded = expand_sweep(&scheme(), &plan).expect("sweep");
    let labels: Vec<&str> = expanded.steps.iter().map(CalibrationStep::label).collect();
    assert_eq!(
        labels,
        [
            "spectroscopy@flux=0",
            "rabi@flux=0",
            "spectroscopy@flux=0.25",
            "rabi@flux=0.25",
        ]
    );
    assert_eq!(expanded.steps[0].substitutions.len(), 1);
    let rabi = &expanded.steps[3].substitutions[0];
    assert_eq!(rabi["pulse"], AssumptionValue::from("pi"));
    assert_eq!(rabi["flux"], AssumptionValue::Number(0.25));
}

#[test]
fn grid_points_vary_the_first_parameter_slowest() {
    let plan = SweepPlan {
        parameters: vec![
            SweepParameter {
                name: "flux".into(),
                values: vec![AssumptionValue::Number(0.0), AssumptionValue::Number(1.0)],
            },
            SweepParameter {
                name: "power".into(),
                values: vec![AssumptionValue::Number(-10.0), AssumptionValue::Number(-20.0)],
            },
        ],
        limit: Some(3),
    };
    let points = plan.points().expect("points");
    let rendered: Vec<String> = points
        .iter()
        .map(|point| format!("{}/{}", point["flux"], point["power"]))
        .collect();
    assert_eq!(rendered, ["0/-10", "0/-20", "1/-10"]);
}

#[test]
fn empty_sweeps_are_rejected() {
    let plan = SweepPlan::single("flux", Vec::new());
    let err = expand_sweep(&scheme(), &plan).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemeValidation);
}
