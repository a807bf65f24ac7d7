use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::AssumptionValue;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::scheme::CalibrationScheme;
use crate::serde::{from_json_slice, from_toml_str, from_yaml_slice};
use crate::template::{CalibrationTemplate, TemplateLibrary};

fn io_error(code: &str, path: &Path, err: impl ToString) -> CalError {
    CalError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Document format of a declarative source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.json`
    Json,
    /// `.toml`
    Toml,
}

impl SourceFormat {
    /// Picks the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, CalError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("yaml") | Some("yml") => Ok(SourceFormat::Yaml),
            Some("json") => Ok(SourceFormat::Json),
            Some("toml") => Ok(SourceFormat::Toml),
            _ => Err(CalError::Serde(
                ErrorInfo::new("qcal.loader.format", "unsupported source format")
                    .with_context("path", path.display().to_string())
                    .with_hint("use a .yaml, .yml, .json or .toml file"),
            )),
        }
    }

    /// Parses `bytes` in this format.
    pub fn parse<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CalError> {
        match self {
            SourceFormat::Yaml => from_yaml_slice(bytes),
            SourceFormat::Json => from_json_slice(bytes),
            SourceFormat::Toml => {
                let text = std::str::from_utf8(bytes).map_err(|err| {
                    CalError::Serde(ErrorInfo::new("qcal.loader.utf8", err.to_string()))
                })?;
                from_toml_str(text)
            }
        }
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, CalError> {
    let format = SourceFormat::from_path(path)?;
    let bytes = fs::read(path).map_err(|err| io_error("qcal.loader.read", path, err))?;
    format
        .parse(&bytes)
        .map_err(|err| err.with_context("path", path.display().to_string()))
}

/// Source of calibration schemes.
pub trait SchemeLoader {
    /// Loads and validates a scheme.
    fn load_scheme(&self, path: &Path) -> Result<CalibrationScheme, CalError>;
}

/// Source of template libraries.
pub trait TemplateLoader {
    /// Loads and validates a template library.
    fn load_templates(&self, path: &Path) -> Result<TemplateLibrary, CalError>;
}

/// Loads declarative sources from the local filesystem, relative paths being
/// resolved against `base_dir`.
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    /// Directory relative paths are resolved against.
    pub base_dir: PathBuf,
}

impl FileLoader {
    /// Creates a loader rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolves `path` against the base directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

impl SchemeLoader for FileLoader {
    fn load_scheme(&self, path: &Path) -> Result<CalibrationScheme, CalError> {
        load_scheme(self.resolve(path))
    }
}

impl TemplateLoader for FileLoader {
    fn load_templates(&self, path: &Path) -> Result<TemplateLibrary, CalError> {
        load_templates(self.resolve(path))
    }
}

/// Loads a scheme: either a bare list of steps or a mapping with `steps`.
pub fn load_scheme<P: AsRef<Path>>(path: P) -> Result<CalibrationScheme, CalError> {
    let path = path.as_ref();
    let scheme: CalibrationScheme = read_document(path)?;
    scheme
        .validate()
        .map_err(|err| err.with_context("path", path.display().to_string()))?;
    Ok(scheme)
}

/// Loads templates from a file holding a name-keyed mapping, or from a
/// directory holding one template per file (named by the file stem, loaded
/// in sorted order).
pub fn load_templates<P: AsRef<Path>>(path: P) -> Result<TemplateLibrary, CalError> {
    let path = path.as_ref();
    if !path.is_dir() {
        let map: IndexMap<String, CalibrationTemplate> = read_document(path)?;
        return TemplateLibrary::from_map(map)
            .map_err(|err| err.with_context("path", path.display().to_string()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| io_error("qcal.loader.read_dir", path, err))? {
        let entry = entry.map_err(|err| io_error("qcal.loader.read_dir", path, err))?;
        let file = entry.path();
        if file.is_file() && SourceFormat::from_path(&file).is_ok() {
            files.push(file);
        }
    }
    files.sort();

    let mut map = IndexMap::new();
    for file in files {
        let Some(stem) = file.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let template: CalibrationTemplate = read_document(&file)?;
        map.insert(stem.to_string(), template);
    }
    TemplateLibrary::from_map(map).map_err(|err| err.with_context("path", path.display().to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AssumptionTree {
    Leaf(AssumptionValue),
    Node(IndexMap<String, AssumptionTree>),
}

fn flatten_into(prefix: &str, tree: AssumptionTree, out: &mut IndexMap<String, AssumptionValue>) {
    match tree {
        AssumptionTree::Leaf(value) => {
            out.insert(prefix.to_string(), value);
        }
        AssumptionTree::Node(children) => {
            for (key, child) in children {
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}/{key}")
                };
                flatten_into(&path, child, out);
            }
        }
    }
}

/// Loads initial assumptions, flattening nested mappings.
pub fn load_assumptions<P: AsRef<Path>>(path: P) -> Result<IndexMap<String, AssumptionValue>, CalError> {
    let path = path.as_ref();
    let tree: IndexMap<String, AssumptionTree> = read_document(path)?;
    let mut out = IndexMap::new();
    for (key, child) in tree {
        flatten_into(&key, child, &mut out);
    }
    tracing::debug!(path = %path.display(), keys = out.len(), "loaded assumptions");
    Ok(out)
}
