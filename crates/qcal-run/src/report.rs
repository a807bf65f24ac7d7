use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::{AssumptionValue, RunProvenance, SchemaVersion};
use qcal_scheme::serde::to_canonical_json_bytes;
use qcal_scheme::{stable_hash_string, CalibrationScheme, OverwriteWarning, TemplateLibrary};
use serde::{Deserialize, Serialize};

use crate::summary::RunSummary;

fn io_error(code: &str, path: &Path, err: impl ToString) -> CalError {
    CalError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Value change of a single assumption key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssumptionChange {
    /// Value before the run.
    pub before: AssumptionValue,
    /// Value after the run.
    pub after: AssumptionValue,
}

/// Per-key difference between two assumption maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssumptionDiff {
    /// Keys bound only after the run.
    pub added: IndexMap<String, AssumptionValue>,
    /// Keys whose value changed.
    pub changed: IndexMap<String, AssumptionChange>,
}

impl AssumptionDiff {
    /// Computes the difference from `before` to `after`.
    pub fn between(
        before: &IndexMap<String, AssumptionValue>,
        after: &IndexMap<String, AssumptionValue>,
    ) -> Self {
        let mut diff = Self::default();
        for (key, value) in after {
            match before.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(previous) if previous != value => {
                    diff.changed.insert(
                        key.clone(),
                        AssumptionChange {
                            before: previous.clone(),
                            after: value.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }
        diff
    }

    /// Returns whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }
}

/// Persisted record of a complete run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Report schema version.
    pub schema: SchemaVersion,
    /// Input hashes, timestamp and tool versions.
    pub provenance: RunProvenance,
    /// Scheme that was executed.
    pub scheme: CalibrationScheme,
    /// Assumptions loaded before the run.
    pub assumptions_before: IndexMap<String, AssumptionValue>,
    /// Assumptions at the end of the run.
    pub assumptions_after: IndexMap<String, AssumptionValue>,
    /// Difference between the two.
    pub diff: AssumptionDiff,
    /// Outcomes of every executed step.
    pub summary: RunSummary,
    /// Assumptions overwritten during the run.
    pub warnings: Vec<OverwriteWarning>,
}

impl RunReport {
    /// Builds a report, hashing the run inputs for provenance.
    pub fn new(
        scheme: &CalibrationScheme,
        templates: &TemplateLibrary,
        assumptions_before: IndexMap<String, AssumptionValue>,
        assumptions_after: IndexMap<String, AssumptionValue>,
        summary: RunSummary,
        warnings: Vec<OverwriteWarning>,
    ) -> Result<Self, CalError> {
        let diff = AssumptionDiff::between(&assumptions_before, &assumptions_after);
        let provenance = provenance(scheme, templates, &assumptions_before)?;
        Ok(Self {
            schema: SchemaVersion::default(),
            provenance,
            scheme: scheme.clone(),
            assumptions_before,
            assumptions_after,
            diff,
            summary,
            warnings,
        })
    }
}

fn provenance(
    scheme: &CalibrationScheme,
    templates: &TemplateLibrary,
    assumptions: &IndexMap<String, AssumptionValue>,
) -> Result<RunProvenance, CalError> {
    let mut versions = BTreeMap::new();
    versions.insert("qcal".to_string(), env!("CARGO_PKG_VERSION").to_string());
    let scheme_hash = stable_hash_string(scheme)?;
    let templates_hash = stable_hash_string(templates)?;
    let assumptions_hash = stable_hash_string(assumptions)?;
    let run_id = stable_hash_string(&[&scheme_hash, &templates_hash, &assumptions_hash])?;
    Ok(RunProvenance {
        run_id: run_id[..16].to_string(),
        scheme_hash,
        templates_hash,
        assumptions_hash,
        created_at: Utc::now().to_rfc3339(),
        tool_versions: versions,
    })
}

/// Destination for the report produced at the end of a run.
pub trait ReportSink {
    /// Persists `report`.
    fn save(&mut self, report: &RunReport) -> Result<(), CalError>;
}

/// Writes each report as canonical JSON to `<dir>/report_<timestamp>.json`.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    dir: PathBuf,
    last: Option<PathBuf>,
}

impl JsonReportSink {
    /// Creates a sink writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last: None,
        }
    }

    /// Path of the most recently written report.
    pub fn last_path(&self) -> Option<&Path> {
        self.last.as_deref()
    }
}

impl ReportSink for JsonReportSink {
    fn save(&mut self, report: &RunReport) -> Result<(), CalError> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| io_error("qcal.report.create_dir", &self.dir, err))?;
        let path = self.dir.join(format!(
            "report_{}.json",
            Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f")
        ));
        let bytes = to_canonical_json_bytes(report)?;
        fs::write(&path, bytes).map_err(|err| io_error("qcal.report.write", &path, err))?;
        tracing::info!(path = %path.display(), "run report written");
        self.last = Some(path);
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryReportSink {
    /// Reports saved so far.
    pub reports: Vec<RunReport>,
}

impl ReportSink for MemoryReportSink {
    fn save(&mut self, report: &RunReport) -> Result<(), CalError> {
        self.reports.push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use qcal_core::AssumptionValue;

    use super::AssumptionDiff;

    #[test]
    fn diff_lists_added_and_changed_keys_only() {
        let before = IndexMap::from([
            ("a".to_string(), AssumptionValue::from(1.0)),
            ("b".to_string(), AssumptionValue::from(2.0)),
        ]);
        let after = IndexMap::from([
            ("a".to_string(), AssumptionValue::from(1.0)),
            ("b".to_string(), AssumptionValue::from(2.5)),
            ("c".to_string(), AssumptionValue::from("x")),
        ]);
        let diff = AssumptionDiff::between(&before, &after);
        assert_eq!(diff.added.keys().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(diff.changed["b"].before, AssumptionValue::from(2.0));
        assert_eq!(diff.changed["b"].after, AssumptionValue::from(2.5));
        assert!(AssumptionDiff::between(&before, &before).is_empty());
    }
}
