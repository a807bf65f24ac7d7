use std::fs;
use std::path::{Path, PathBuf};

use qcal_core::errors::{CalError, ErrorInfo};
use qcal_scheme::{DuplicatePolicy, SourceFormat, SweepPlan};
use serde::{Deserialize, Serialize};

fn io_error(code: &str, path: &Path, err: impl ToString) -> CalError {
    CalError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Inputs and output locations of a configured run.
///
/// Relative paths are resolved against the directory of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Calibration scheme file.
    pub scheme: PathBuf,
    /// Template library file or directory.
    pub templates: PathBuf,
    /// Initial assumptions file.
    pub assumptions: PathBuf,
    /// Root directory of measurement files.
    #[serde(default = "RunConfig::default_data_root")]
    pub data_root: PathBuf,
    /// Directory receiving JSON-lines run logs.
    #[serde(default = "RunConfig::default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory receiving run reports.
    #[serde(default = "RunConfig::default_report_dir")]
    pub report_dir: PathBuf,
    /// Store behaviour on rewrites.
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// Relative-std bound for templates that declare none.
    #[serde(default = "RunConfig::default_max_relative_std")]
    pub max_relative_std: Option<f64>,
    /// Optional sweep the scheme is repeated over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepPlan>,
    /// Directory containing the config on disk.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl RunConfig {
    /// Config pointing at the three input files, with default outputs.
    pub fn new(
        scheme: impl Into<PathBuf>,
        templates: impl Into<PathBuf>,
        assumptions: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            templates: templates.into(),
            assumptions: assumptions.into(),
            data_root: Self::default_data_root(),
            log_dir: Self::default_log_dir(),
            report_dir: Self::default_report_dir(),
            duplicate_policy: DuplicatePolicy::default(),
            max_relative_std: Self::default_max_relative_std(),
            sweep: None,
            base_dir: PathBuf::from("."),
        }
    }

    fn default_data_root() -> PathBuf {
        PathBuf::from("data")
    }

    fn default_log_dir() -> PathBuf {
        PathBuf::from("logs")
    }

    fn default_report_dir() -> PathBuf {
        PathBuf::from("reports")
    }

    const fn default_max_relative_std() -> Option<f64> {
        Some(0.05)
    }

    /// Resolves `path` against the config directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Scheme path after resolution.
    pub fn scheme_path(&self) -> PathBuf {
        self.resolve(&self.scheme)
    }

    /// Template path after resolution.
    pub fn templates_path(&self) -> PathBuf {
        self.resolve(&self.templates)
    }

    /// Assumptions path after resolution.
    pub fn assumptions_path(&self) -> PathBuf {
        self.resolve(&self.assumptions)
    }

    /// Data root after resolution.
    pub fn data_root_path(&self) -> PathBuf {
        self.resolve(&self.data_root)
    }

    /// Log directory after resolution.
    pub fn log_dir_path(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    /// Report directory after resolution.
    pub fn report_dir_path(&self) -> PathBuf {
        self.resolve(&self.report_dir)
    }
}

/// Loads a run config (YAML, JSON or TOML by extension).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RunConfig, CalError> {
    let config_path = path.as_ref();
    let format = SourceFormat::from_path(config_path)?;
    let bytes = fs::read(config_path).map_err(|err| io_error("qcal.config.read", config_path, err))?;
    let mut config: RunConfig = format
        .parse(&bytes)
        .map_err(|err| err.with_context("path", config_path.display().to_string()))?;
    config.base_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    Ok(config)
}
