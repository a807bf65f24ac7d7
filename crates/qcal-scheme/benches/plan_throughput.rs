use criterion::{criterion_group, criterion_main, Criterion};
use indexmap::IndexMap;
use qcal_core::AssumptionValue;
use qcal_scheme::{
    AssumptionSnapshot, CalibrationScheme, CalibrationStep, CalibrationTemplate, OutputSpec,
    Pattern, Resolver, TemplateLibrary,
};

fn fixture(qubits: usize) -> (TemplateLibrary, CalibrationScheme, AssumptionSnapshot) {
    let mut spectroscopy = CalibrationTemplate::new("spectroscopy", "peak");
    spectroscopy.pattern = Some(Pattern::parse("spec_{qubit}").expect("pattern"));
    spectroscopy.outputs.insert(
        "center".into(),
        OutputSpec::Key(Pattern::parse("{qubit}/freq").expect("pattern")),
    );

    let mut ramsey = CalibrationTemplate::new("ramsey", "linear");
    ramsey.pattern = Some(Pattern::parse("ramsey_{qubit}_{delay}").expect("pattern"));
    ramsey
        .inputs
        .insert("intercept".into(), Pattern::parse("{qubit}/freq").expect("pattern"));

    let mut library = TemplateLibrary::new();
    library.insert(spectroscopy).expect("template");
    library.insert(ramsey).expect("template");

    let sets: Vec<IndexMap<String, AssumptionValue>> = (0..qubits)
        .map(|idx| IndexMap::from([("qubit".to_string(), AssumptionValue::from(format!("q{idx}")))]))
        .collect();
    let mut first = CalibrationStep::new("spectroscopy");
    first.substitutions = sets.clone();
    let mut second = CalibrationStep::new("ramsey");
    second.substitutions = sets;
    let scheme = CalibrationScheme::new(vec![first, second]);

    let delays = (0..8)
        .map(|idx| (format!("delay_{idx}"), AssumptionValue::Number(idx as f64 * 0.1)))
        .collect();
    (library, scheme, AssumptionSnapshot::from_values(delays))
}

fn bench_plan(c: &mut Criterion) {
    let (library, scheme, initial) = fixture(16);
    let resolver = Resolver::new(&library);
    c.bench_function("plan_throughput", |b| {
        b.iter(|| resolver.plan(&scheme, &initial).expect("plan"));
    });
}

criterion_group!(benches, bench_plan);
criterion_main!(benches);
