use std::error::Error;
use std::path::PathBuf;

use clap::Args;
use qcal_run::{load_config, RunConfig};
use qcal_scheme::DuplicatePolicy;

pub mod plan;
pub mod run;
pub mod sweep;
pub mod validate;

/// Config file plus per-invocation overrides.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Run configuration (YAML, JSON or TOML).
    #[arg(long, default_value = "qcal.yaml")]
    pub config: PathBuf,
    /// Override the scheme file.
    #[arg(long)]
    pub scheme: Option<PathBuf>,
    /// Override the template library.
    #[arg(long)]
    pub templates: Option<PathBuf>,
    /// Override the initial assumptions.
    #[arg(long)]
    pub assumptions: Option<PathBuf>,
    /// Override the measurement data root.
    #[arg(long)]
    pub data_root: Option<PathBuf>,
    /// Override the log directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Override the report directory.
    #[arg(long)]
    pub report_dir: Option<PathBuf>,
    /// Reject rewrites of assumptions that are already bound.
    #[arg(long)]
    pub reject_duplicates: bool,
    /// Override the default relative standard deviation bound.
    #[arg(long)]
    pub max_relative_std: Option<f64>,
}

impl ConfigArgs {
    /// Loads the config and applies the overrides. Override paths are taken
    /// relative to the working directory.
    pub fn load(&self) -> Result<RunConfig, Box<dyn Error>> {
        let mut config = load_config(&self.config)?;
        let cwd = std::env::current_dir()?;
        let absolute = |path: &PathBuf| cwd.join(path);
        if let Some(path) = &self.scheme {
            config.scheme = absolute(path);
        }
        if let Some(path) = &self.templates {
            config.templates = absolute(path);
        }
        if let Some(path) = &self.assumptions {
            config.assumptions = absolute(path);
        }
        if let Some(path) = &self.data_root {
            config.data_root = absolute(path);
        }
        if let Some(path) = &self.log_dir {
            config.log_dir = absolute(path);
        }
        if let Some(path) = &self.report_dir {
            config.report_dir = absolute(path);
        }
        if self.reject_duplicates {
            config.duplicate_policy = DuplicatePolicy::Reject;
        }
        if let Some(limit) = self.max_relative_std {
            config.max_relative_std = Some(limit);
        }
        Ok(config)
    }
}
