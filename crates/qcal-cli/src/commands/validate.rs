use std::error::Error;

use clap::Args;
use qcal_run::prepare;

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub fn run(args: &ValidateArgs) -> Result<(), Box<dyn Error>> {
    let config = args.config.load()?;
    let prepared = prepare(&config)?;
    let plan = prepared.plan()?;
    println!(
        "ok: {} steps, {} variants, {} unresolvable",
        plan.steps.len(),
        plan.variant_count(),
        plan.unresolved_count()
    );
    Ok(())
}
