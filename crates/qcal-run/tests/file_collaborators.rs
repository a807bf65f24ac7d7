use std::fs;

use indexmap::IndexMap;
use qcal_core::{
    AssumptionValue, DataDescriptor, DataSource, ErrorKind, LogLevel, LogRecord, Logger,
};
use qcal_run::{
    FileDataSource, JsonLinesLogger, JsonReportSink, MemoryLogger, ReportSink, RunReport,
    RunSummary, TeeLogger,
};
use qcal_scheme::{CalibrationScheme, CalibrationStep, TemplateLibrary};
use serde_json::Value;

#[test]
fn csv_and_json_measurements_are_located_by_descriptor() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("rabi")).expect("mkdir");
    fs::write(
        dir.path().join("rabi/q0_pi.csv"),
        "amplitude, population\n0.1, 0.2\n0.2, 0.4\n",
    )
    .expect("csv");
    fs::write(
        dir.path().join("flux=0.25.json"),
        r#"{"bias": [0.0, 0.5], "shift": [1.0, 2.0]}"#,
    )
    .expect("json");

    let mut source = FileDataSource::new(dir.path());
    let csv = source
        .fetch(&DataDescriptor::new("rabi/q0_pi"))
        .expect("csv data");
    assert_eq!(csv.columns.keys().collect::<Vec<_>>(), ["amplitude", "population"]);
    assert_eq!(csv.column("population"), Some(&[0.2, 0.4][..]));
    assert_eq!(csv.descriptor, "rabi/q0_pi");

    let json = source
        .fetch(&DataDescriptor::new("flux=0.25"))
        .expect("json data");
    assert_eq!(json.column("shift"), Some(&[1.0, 2.0][..]));

    let explicit = source
        .fetch(&DataDescriptor::new("rabi/q0_pi.csv"))
        .expect("explicit extension");
    assert_eq!(explicit.len(), 2);
}

#[test]
fn missing_or_malformed_measurements_fail_acquisition() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("bad.csv"), "x,y\n1.0,oops\n").expect("csv");
    let mut source = FileDataSource::new(dir.path());

    let err = source.fetch(&DataDescriptor::new("absent")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataAcquisition);
    assert_eq!(err.info().context.get("descriptor").map(String::as_str), Some("absent"));

    let err = source.fetch(&DataDescriptor::new("bad")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataAcquisition);
    assert_eq!(err.info().context.get("line").map(String::as_str), Some("2"));
    assert_eq!(err.info().context.get("column").map(String::as_str), Some("y"));
}

#[test]
fn json_lines_logger_appends_one_record_per_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal = JsonLinesLogger::create(&dir.path().join("logs")).expect("logger");
    let memory = MemoryLogger::new();
    let tee = TeeLogger::new().with(&journal).with(&memory);

    tee.record(&LogRecord::new(LogLevel::Info, "rabi", "Starting calibration"));
    tee.record(
        &LogRecord::new(LogLevel::Error, "rabi", "Calibration failed")
            .with_payload(serde_json::json!({ "name": "rabi_q0_pi" })),
    );

    assert_eq!(memory.records().len(), 2);
    let text = fs::read_to_string(journal.path()).expect("log file");
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["level"], "info");
    assert!(lines[0].get("payload").is_none());
    assert_eq!(lines[1]["payload"]["name"], "rabi_q0_pi");
}

#[test]
fn report_sink_writes_canonical_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let scheme = CalibrationScheme::new(vec![CalibrationStep::new("rabi")]);
    let before = IndexMap::from([("q0/pi_amp".to_string(), AssumptionValue::Number(0.4))]);
    let after = IndexMap::from([
        ("q0/pi_amp".to_string(), AssumptionValue::Number(0.45)),
        ("q0/pi_half_amp".to_string(), AssumptionValue::Number(0.22)),
    ]);
    let report = RunReport::new(
        &scheme,
        &TemplateLibrary::new(),
        before.clone(),
        after,
        RunSummary::default(),
        Vec::new(),
    )
    .expect("report");
    assert_eq!(report.diff.added.len(), 1);
    assert_eq!(report.diff.changed.len(), 1);

    let again = RunReport::new(
        &scheme,
        &TemplateLibrary::new(),
        before.clone(),
        before,
        RunSummary::default(),
        Vec::new(),
    )
    .expect("report");
    assert_eq!(again.provenance.run_id, report.provenance.run_id);
    assert!(again.diff.is_empty());

    let mut sink = JsonReportSink::new(dir.path().join("reports"));
    sink.save(&report).expect("save");
    let path = sink.last_path().expect("path").to_path_buf();
    assert!(path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("report_") && name.ends_with(".json")));
    let text = fs::read_to_string(&path).expect("read");
    assert!(text.starts_with("{\"assumptions_after\":"));
    let value: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value["diff"]["changed"]["q0/pi_amp"]["after"], 0.45);
}
