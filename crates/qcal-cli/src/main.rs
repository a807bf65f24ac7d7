use std::error::Error;

use clap::{Parser, Subcommand};
use commands::{
    plan::{self, PlanArgs},
    run::{self, RunArgs},
    sweep::{self, SweepArgs},
    validate::{self, ValidateArgs},
};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "qcal", about = "Calibration sequence orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the inputs and run the static plan without fitting anything.
    Validate(ValidateArgs),
    /// Print the execution plan as YAML.
    Plan(PlanArgs),
    /// Execute the scheme and write the run report.
    Run(RunArgs),
    /// Repeat the scheme over a list of values of one token.
    Sweep(SweepArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate(args) => validate::run(&args),
        Command::Plan(args) => plan::run(&args),
        Command::Run(args) => run::run(&args),
        Command::Sweep(args) => sweep::run(&args),
    }
}
