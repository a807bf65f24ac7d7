use std::error::Error;

use clap::Args;
use qcal_core::AssumptionValue;
use qcal_scheme::SweepPlan;

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Substitution token to sweep.
    #[arg(long)]
    pub token: String,
    /// Comma separated values of the token.
    #[arg(long, value_delimiter = ',', required = true)]
    pub values: Vec<String>,
}

fn parse_value(raw: &str) -> AssumptionValue {
    if let Ok(number) = raw.parse::<f64>() {
        return AssumptionValue::Number(number);
    }
    match raw {
        "true" => AssumptionValue::Flag(true),
        "false" => AssumptionValue::Flag(false),
        text => AssumptionValue::from(text),
    }
}

pub fn run(args: &SweepArgs) -> Result<(), Box<dyn Error>> {
    let mut config = args.config.load()?;
    let values = args.values.iter().map(|raw| parse_value(raw.trim())).collect();
    config.sweep = Some(SweepPlan::single(args.token.as_str(), values));
    super::run::execute(&config)
}

#[cfg(test)]
mod tests {
    use super::parse_value;
    use qcal_core::AssumptionValue;

    #[test]
    fn sweep_values_keep_their_type() {
        assert_eq!(parse_value("0.25"), AssumptionValue::Number(0.25));
        assert_eq!(parse_value("true"), AssumptionValue::Flag(true));
        assert_eq!(parse_value("pi_half"), AssumptionValue::from("pi_half"));
    }
}
