use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::{DataDescriptor, DataSource, MeasurementData};

fn data_error(descriptor: &DataDescriptor, message: impl Into<String>) -> CalError {
    CalError::DataAcquisition(
        ErrorInfo::new("qcal.data.fetch", message).with_context("descriptor", descriptor.as_str()),
    )
}

fn wrap_csv(descriptor: &DataDescriptor, path: &Path, err: csv::Error) -> CalError {
    data_error(descriptor, "CSV measurement file could not be read")
        .with_context("path", path.display().to_string())
        .with_hint(err.to_string())
}

/// Reads measurement files (`.csv` with a header row, or `.json` mapping
/// column names to arrays) below a root directory.
#[derive(Debug, Clone)]
pub struct FileDataSource {
    root: PathBuf,
}

impl FileDataSource {
    /// Creates a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the source.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, descriptor: &DataDescriptor) -> Option<PathBuf> {
        let base = self.root.join(descriptor.as_str());
        if matches!(
            base.extension().and_then(|ext| ext.to_str()),
            Some("csv") | Some("json")
        ) {
            return base.is_file().then_some(base);
        }
        ["csv", "json"]
            .iter()
            .map(|extension| {
                let mut candidate = base.clone().into_os_string();
                candidate.push(".");
                candidate.push(extension);
                PathBuf::from(candidate)
            })
            .find(|candidate| candidate.is_file())
    }
}

impl DataSource for FileDataSource {
    fn fetch(&mut self, descriptor: &DataDescriptor) -> Result<MeasurementData, CalError> {
        let Some(path) = self.locate(descriptor) else {
            return Err(data_error(descriptor, "no measurement file for descriptor")
                .with_context("root", self.root.display().to_string()));
        };
        tracing::debug!(descriptor = %descriptor, path = %path.display(), "reading measurement data");
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => read_json(descriptor, &path),
            _ => read_csv(descriptor, &path),
        }
    }
}

fn read_csv(descriptor: &DataDescriptor, path: &Path) -> Result<MeasurementData, CalError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| wrap_csv(descriptor, path, err))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| wrap_csv(descriptor, path, err))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|err| wrap_csv(descriptor, path, err))?;
        for (column, field) in record.iter().enumerate() {
            let value: f64 = field.parse().map_err(|_| {
                data_error(descriptor, format!("non-numeric value '{field}'"))
                    .with_context("path", path.display().to_string())
                    .with_context("line", (row + 2).to_string())
                    .with_context("column", headers.get(column).cloned().unwrap_or_default())
            })?;
            if let Some(values) = columns.get_mut(column) {
                values.push(value);
            }
        }
    }
    let mut data = MeasurementData::new(descriptor.as_str());
    for (name, values) in headers.into_iter().zip(columns) {
        data = data.with_column(name, values);
    }
    Ok(data)
}

fn read_json(descriptor: &DataDescriptor, path: &Path) -> Result<MeasurementData, CalError> {
    let bytes = fs::read(path).map_err(|err| {
        data_error(descriptor, err.to_string()).with_context("path", path.display().to_string())
    })?;
    let columns: IndexMap<String, Vec<f64>> = serde_json::from_slice(&bytes).map_err(|err| {
        data_error(descriptor, format!("malformed measurement file: {err}"))
            .with_context("path", path.display().to_string())
    })?;
    Ok(MeasurementData {
        descriptor: descriptor.to_string(),
        columns,
    })
}

/// In-memory data source keyed by descriptor, recording every fetch.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataSource {
    sets: IndexMap<String, MeasurementData>,
    fetched: Vec<String>,
}

impl MemoryDataSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers data for `descriptor`.
    pub fn insert(&mut self, descriptor: impl Into<String>, data: MeasurementData) {
        self.sets.insert(descriptor.into(), data);
    }

    /// Builder form of [`MemoryDataSource::insert`].
    pub fn with(mut self, descriptor: impl Into<String>, data: MeasurementData) -> Self {
        self.insert(descriptor, data);
        self
    }

    /// Descriptors fetched so far, in order.
    pub fn fetched(&self) -> &[String] {
        &self.fetched
    }
}

impl DataSource for MemoryDataSource {
    fn fetch(&mut self, descriptor: &DataDescriptor) -> Result<MeasurementData, CalError> {
        self.fetched.push(descriptor.to_string());
        self.sets
            .get(descriptor.as_str())
            .cloned()
            .ok_or_else(|| data_error(descriptor, "no measurement data registered"))
    }
}
