use std::error::Error;

use clap::Args;
use qcal_run::{run_configured, RunArtifacts, RunConfig, RunOptions};

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = args.config.load()?;
    execute(&config)
}

pub(crate) fn execute(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    let artifacts = run_configured(config, RunOptions::default())?;
    print_summary(&artifacts);
    match artifacts.halted {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn print_summary(artifacts: &RunArtifacts) {
    let summary = &artifacts.report.summary;
    println!(
        "{} attempted, {} recorded, {} failed, {} skipped steps",
        summary.attempted(),
        summary.recorded(),
        summary.failed(),
        summary.skipped()
    );
    for failure in summary.failures() {
        println!("  failed {} {}: {}", failure.step, failure.name, failure.message);
    }
    for (key, change) in &artifacts.report.diff.changed {
        println!("  {key}: {} -> {}", change.before, change.after);
    }
    for (key, value) in &artifacts.report.diff.added {
        println!("  {key}: {value} (new)");
    }
    if let Some(path) = &artifacts.report_path {
        println!("report: {}", path.display());
    }
    println!("log: {}", artifacts.log_path.display());
}
