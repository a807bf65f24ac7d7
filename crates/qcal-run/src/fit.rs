use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::{FitBackend, FitParameters, FitRequest};

fn fit_error(request: &FitRequest<'_>, message: impl Into<String>) -> CalError {
    CalError::FitConvergence(
        ErrorInfo::new("qcal.fit.failed", message)
            .with_context("model", request.model)
            .with_context("name", request.name),
    )
}

/// Closed-form reference fits.
///
/// * `linear`: ordinary least squares `y = intercept + slope * x`
/// * `constant`: sample mean with its standard error
/// * `peak`: location and height of the largest `y` sample
///
/// Column names default to `x` and `y` and can be overridden with the `x`
/// and `y` step options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinFits;

impl BuiltinFits {
    /// Model names understood by the backend.
    pub const MODELS: [&'static str; 3] = ["linear", "constant", "peak"];
}

impl FitBackend for BuiltinFits {
    fn fit(&mut self, request: &FitRequest<'_>) -> Result<FitParameters, CalError> {
        match request.model {
            "linear" => fit_linear(request),
            "constant" => fit_constant(request),
            "peak" => fit_peak(request),
            other => Err(fit_error(request, format!("unknown fit model '{other}'"))
                .with_hint(format!("available models: {}", Self::MODELS.join(", ")))),
        }
    }
}

fn column<'a>(request: &FitRequest<'a>, axis: &str) -> Result<&'a [f64], CalError> {
    let name = request
        .options
        .get(axis)
        .and_then(|value| value.as_str())
        .unwrap_or(axis);
    let values = request
        .data
        .column(name)
        .ok_or_else(|| fit_error(request, format!("data has no column '{name}'")))?;
    if values.iter().any(|value| !value.is_finite()) {
        return Err(fit_error(request, format!("column '{name}' contains non-finite samples")));
    }
    Ok(values)
}

fn xy<'a>(request: &FitRequest<'a>) -> Result<(&'a [f64], &'a [f64]), CalError> {
    let x = column(request, "x")?;
    let y = column(request, "y")?;
    if x.len() != y.len() {
        return Err(fit_error(
            request,
            format!("x and y lengths differ ({} vs {})", x.len(), y.len()),
        ));
    }
    Ok((x, y))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn fit_linear(request: &FitRequest<'_>) -> Result<FitParameters, CalError> {
    let (x, y) = xy(request)?;
    let n = x.len();
    if n < 3 {
        return Err(fit_error(request, "linear fit needs at least three samples"));
    }
    let x_mean = mean(x);
    let y_mean = mean(y);
    let sxx: f64 = x.iter().map(|xi| (xi - x_mean).powi(2)).sum();
    if sxx == 0.0 {
        return Err(fit_error(request, "x samples are all equal"));
    }
    let sxy: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (xi - x_mean) * (yi - y_mean))
        .sum();
    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let rss: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (yi - intercept - slope * xi).powi(2))
        .sum();
    let sigma2 = rss / (n - 2) as f64;
    let var_slope = sigma2 / sxx;
    let var_intercept = sigma2 * (1.0 / n as f64 + x_mean * x_mean / sxx);
    let cov = -x_mean * sigma2 / sxx;

    let mut values = IndexMap::new();
    values.insert("intercept".to_string(), intercept);
    values.insert("slope".to_string(), slope);
    Ok(FitParameters {
        values,
        covariance: vec![vec![var_intercept, cov], vec![cov, var_slope]],
        residual: Some(rss.sqrt()),
    })
}

fn fit_constant(request: &FitRequest<'_>) -> Result<FitParameters, CalError> {
    let y = column(request, "y")?;
    let n = y.len();
    if n < 2 {
        return Err(fit_error(request, "constant fit needs at least two samples"));
    }
    let y_mean = mean(y);
    let rss: f64 = y.iter().map(|yi| (yi - y_mean).powi(2)).sum();
    let variance = rss / (n - 1) as f64;

    let mut values = IndexMap::new();
    values.insert("mean".to_string(), y_mean);
    Ok(FitParameters {
        values,
        covariance: vec![vec![variance / n as f64]],
        residual: Some(rss.sqrt()),
    })
}

fn fit_peak(request: &FitRequest<'_>) -> Result<FitParameters, CalError> {
    let (x, y) = xy(request)?;
    let Some((idx, height)) = y
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (idx, value)| match best {
            Some((_, top)) if top >= value => best,
            _ => Some((idx, value)),
        })
    else {
        return Err(fit_error(request, "peak fit needs at least one sample"));
    };
    // Half the local grid spacing bounds the location error.
    let spacing = match (idx.checked_sub(1).map(|prev| x[prev]), x.get(idx + 1)) {
        (Some(prev), Some(next)) => (next - prev).abs() / 2.0,
        (Some(prev), None) => (x[idx] - prev).abs(),
        (None, Some(next)) => (next - x[idx]).abs(),
        (None, None) => 0.0,
    };
    let center_std = spacing / 2.0;

    let mut values = IndexMap::new();
    values.insert("center".to_string(), x[idx]);
    values.insert("height".to_string(), height);
    Ok(FitParameters {
        values,
        covariance: vec![vec![center_std * center_std, 0.0], vec![0.0, 0.0]],
        residual: None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use indexmap::IndexMap;
    use qcal_core::{AssumptionValue, ErrorKind, FitBackend, FitRequest, MeasurementData};

    use super::BuiltinFits;

    fn request<'a>(
        model: &'a str,
        data: &'a MeasurementData,
        guess: &'a IndexMap<String, AssumptionValue>,
        options: &'a BTreeMap<String, AssumptionValue>,
    ) -> FitRequest<'a> {
        FitRequest {
            model,
            name: "test",
            data,
            guess,
            options,
        }
    }

    #[test]
    fn linear_fit_recovers_an_exact_line() {
        let data = MeasurementData::new("line")
            .with_column("x", vec![0.0, 1.0, 2.0, 3.0])
            .with_column("y", vec![1.0, 3.0, 5.0, 7.0]);
        let guess = IndexMap::new();
        let options = BTreeMap::new();
        let fit = BuiltinFits
            .fit(&request("linear", &data, &guess, &options))
            .unwrap();
        assert!((fit.values["intercept"] - 1.0).abs() < 1e-12);
        assert!((fit.values["slope"] - 2.0).abs() < 1e-12);
        assert!(fit.std_dev("slope").unwrap() < 1e-9);
    }

    #[test]
    fn options_rename_columns() {
        let data = MeasurementData::new("renamed")
            .with_column("power", vec![1.0, 2.0, 3.0])
            .with_column("signal", vec![2.0, 4.0, 6.0]);
        let guess = IndexMap::new();
        let options = BTreeMap::from([
            ("x".to_string(), AssumptionValue::from("power")),
            ("y".to_string(), AssumptionValue::from("signal")),
        ]);
        let fit = BuiltinFits
            .fit(&request("linear", &data, &guess, &options))
            .unwrap();
        assert!((fit.values["slope"] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn peak_and_constant_models() {
        let data = MeasurementData::new("qubit_spectroscopy")
            .with_column("x", vec![4.0, 4.1, 4.2, 4.3])
            .with_column("y", vec![0.1, 0.9, 0.4, 0.2]);
        let guess = IndexMap::new();
        let options = BTreeMap::new();
        let peak = BuiltinFits
            .fit(&request("peak", &data, &guess, &options))
            .unwrap();
        assert_eq!(peak.values["center"], 4.1);
        assert_eq!(peak.values["height"], 0.9);

        let flat = MeasurementData::new("flat").with_column("y", vec![2.0, 2.0, 2.0]);
        let constant = BuiltinFits
            .fit(&request("constant", &flat, &guess, &options))
            .unwrap();
        assert_eq!(constant.values["mean"], 2.0);
        assert_eq!(constant.std_dev("mean"), Some(0.0));
    }

    #[test]
    fn degenerate_inputs_fail_to_converge() {
        let data = MeasurementData::new("short")
            .with_column("x", vec![1.0, 1.0, 1.0])
            .with_column("y", vec![1.0, 2.0, 3.0]);
        let guess = IndexMap::new();
        let options = BTreeMap::new();
        let err = BuiltinFits
            .fit(&request("linear", &data, &guess, &options))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FitConvergence);

        let err = BuiltinFits
            .fit(&request("lorentzian", &data, &guess, &options))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FitConvergence);
        assert!(err.info().hint.is_some());
    }
}
