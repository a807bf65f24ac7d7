use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Args;
use qcal_run::prepare;
use qcal_scheme::serde::to_yaml_string;

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Write the plan to a file instead of stdout.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn run(args: &PlanArgs) -> Result<(), Box<dyn Error>> {
    let config = args.config.load()?;
    let plan = prepare(&config)?.plan()?;
    let yaml = to_yaml_string(&plan)?;
    match &args.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, yaml)?;
            tracing::info!(path = %path.display(), "plan written");
        }
        None => print!("{yaml}"),
    }
    Ok(())
}
