use qcal_core::errors::{CalError, ErrorInfo, ErrorKind};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("step", "#1 rabi")
        .with_context("reason", "example")
}

#[test]
fn unresolved_placeholder_surface() {
    let err = CalError::UnresolvedPlaceholder(sample_info("P001", "missing value_a_1"));
    assert_eq!(err.info().code, "P001");
    assert_eq!(err.kind(), ErrorKind::UnresolvedPlaceholder);
    assert!(err.is_structural());
}

#[test]
fn scheme_validation_surface() {
    let err = CalError::SchemeValidation(sample_info("S001", "duplicate label"));
    assert!(err.is_structural());
    assert!(err.info().context.contains_key("step"));
}

#[test]
fn per_variant_errors_are_not_structural() {
    for kind in [
        ErrorKind::DataAcquisition,
        ErrorKind::FitConvergence,
        ErrorKind::ResultValidation,
        ErrorKind::DuplicateAssumption,
    ] {
        let err = CalError::new(kind, "X001", "variant failure");
        assert_eq!(err.kind(), kind);
        assert!(!err.is_structural());
    }
}

#[test]
fn with_context_keeps_first_value() {
    let err = CalError::new(ErrorKind::FitConvergence, "F001", "diverged")
        .with_context("name", "rabi_pi")
        .with_context("name", "overridden")
        .with_hint("widen the sweep");
    assert_eq!(err.info().context["name"], "rabi_pi");
    assert_eq!(err.info().hint.as_deref(), Some("widen the sweep"));
    let rendered = err.to_string();
    assert!(rendered.starts_with("fit convergence error: diverged (code: F001)"));
    assert!(rendered.contains("name=rabi_pi"));
}

#[test]
fn error_serializes_with_family_tag() {
    let err = CalError::DuplicateAssumption(sample_info("D001", "qubit/freq"));
    let json = serde_json::to_value(&err).expect("serialize");
    assert_eq!(json["family"], "DuplicateAssumption");
    let decoded: CalError = serde_json::from_value(json).expect("deserialize");
    assert_eq!(decoded, err);
}
