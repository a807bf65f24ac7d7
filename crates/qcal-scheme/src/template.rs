//! Calibration templates and the named template library.

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use serde::{Deserialize, Serialize};

use crate::placeholder::{Pairing, Pattern, Requirement};

fn template_error(name: &str, message: impl Into<String>) -> CalError {
    CalError::SchemeValidation(
        ErrorInfo::new("qcal.template.invalid", message).with_context("template", name),
    )
}

const fn default_scale() -> f64 {
    1.0
}

/// Assumption key a fitted parameter is recorded under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    /// Plain key pattern; the parameter is stored as fitted.
    Key(Pattern),
    /// Key pattern with a multiplicative factor applied before storing.
    Scaled {
        /// Key pattern.
        key: Pattern,
        /// Factor applied to the fitted value.
        #[serde(default = "default_scale")]
        scale: f64,
    },
}

impl OutputSpec {
    /// Key pattern of the output.
    pub fn key(&self) -> &Pattern {
        match self {
            OutputSpec::Key(key) | OutputSpec::Scaled { key, .. } => key,
        }
    }

    /// Factor applied to the fitted value.
    pub fn scale(&self) -> f64 {
        match self {
            OutputSpec::Key(_) => default_scale(),
            OutputSpec::Scaled { scale, .. } => *scale,
        }
    }
}

/// Inclusive numeric sanity bounds for a fitted parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterBounds {
    /// Lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParameterBounds {
    /// Returns whether `value` lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Named calibration routine: a fit model plus placeholder patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationTemplate {
    /// Template name; filled from the library key when omitted.
    #[serde(default)]
    pub name: String,
    /// Name pattern of the resolved calibration; defaults to the literal name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
    /// Fit-model reference handed to the fit backend.
    pub model: String,
    /// How multi-token bindings combine into variants.
    #[serde(default)]
    pub pairing: Pairing,
    /// Requirement per token; undeclared tokens are required.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub placeholders: IndexMap<String, Requirement>,
    /// Fit parameter to assumption-key pattern used as the initial guess.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, Pattern>,
    /// Fit parameter to assumption-key pattern written on success.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, OutputSpec>,
    /// Sanity bounds per fitted parameter.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub bounds: IndexMap<String, ParameterBounds>,
    /// Upper bound on `std / |value|` for output parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_relative_std: Option<f64>,
    /// Data-source descriptor pattern; defaults to the resolved name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Pattern>,
}

impl CalibrationTemplate {
    /// Creates a template with no placeholders, inputs or outputs.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            model: model.into(),
            pairing: Pairing::default(),
            placeholders: IndexMap::new(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            bounds: IndexMap::new(),
            max_relative_std: None,
            data: None,
        }
    }

    /// Pattern the resolved calibration name is rendered from.
    pub fn name_pattern(&self) -> Pattern {
        self.pattern
            .clone()
            .unwrap_or_else(|| Pattern::literal(&self.name))
    }

    /// Every token referenced by the name, data, input and output patterns,
    /// in order of first appearance.
    pub fn tokens(&self, data_override: Option<&Pattern>) -> Vec<String> {
        let name = self.name_pattern();
        let data = data_override.or(self.data.as_ref());
        let patterns = std::iter::once(&name)
            .chain(data)
            .chain(self.inputs.values())
            .chain(self.outputs.values().map(OutputSpec::key));
        let mut tokens: Vec<String> = Vec::new();
        for pattern in patterns {
            for token in pattern.tokens() {
                if !tokens.iter().any(|known| known == token) {
                    tokens.push(token.to_string());
                }
            }
        }
        tokens
    }

    /// Requirement declared for `token`.
    pub fn requirement(&self, token: &str) -> Requirement {
        self.placeholders.get(token).copied().unwrap_or_default()
    }

    /// Checks the template for structural problems.
    pub fn validate(&self) -> Result<(), CalError> {
        if self.name.trim().is_empty() {
            return Err(template_error(&self.name, "template name must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(template_error(&self.name, "template model must not be empty"));
        }
        let used = self.tokens(None);
        for token in self.placeholders.keys() {
            if !used.iter().any(|known| known == token) {
                tracing::debug!(
                    template = %self.name,
                    token = %token,
                    "declared placeholder is not referenced by any template pattern"
                );
            }
        }
        for (parameter, bounds) in &self.bounds {
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min > max {
                    return Err(template_error(
                        &self.name,
                        format!("bounds for '{parameter}' are inverted ({min} > {max})"),
                    )
                    .with_context("parameter", parameter.as_str()));
                }
            }
        }
        for (parameter, output) in &self.outputs {
            let scale = output.scale();
            if !scale.is_finite() || scale == 0.0 {
                return Err(template_error(
                    &self.name,
                    format!("output scale for '{parameter}' must be finite and non-zero"),
                )
                .with_context("parameter", parameter.as_str()));
            }
        }
        if let Some(ratio) = self.max_relative_std {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(template_error(
                    &self.name,
                    "max_relative_std must be a positive number",
                ));
            }
        }
        Ok(())
    }
}

/// Templates addressable by name, in load order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct TemplateLibrary {
    templates: IndexMap<String, CalibrationTemplate>,
}

impl TemplateLibrary {
    /// Creates an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a library from a name-keyed map, filling omitted names and
    /// validating every template.
    pub fn from_map(map: IndexMap<String, CalibrationTemplate>) -> Result<Self, CalError> {
        let mut library = Self::new();
        for (key, mut template) in map {
            if template.name.is_empty() {
                template.name = key.clone();
            } else if template.name != key {
                return Err(template_error(
                    &key,
                    format!("template is registered as '{key}' but named '{}'", template.name),
                ));
            }
            library.insert(template)?;
        }
        Ok(library)
    }

    /// Validates and registers a template.
    pub fn insert(&mut self, template: CalibrationTemplate) -> Result<(), CalError> {
        template.validate()?;
        if self.templates.contains_key(&template.name) {
            return Err(template_error(&template.name, "template is defined twice"));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Looks up a template by name.
    pub fn get(&self, name: &str) -> Result<&CalibrationTemplate, CalError> {
        self.templates.get(name).ok_or_else(|| {
            CalError::SchemeValidation(
                ErrorInfo::new("qcal.template.unknown", format!("unknown template '{name}'"))
                    .with_context("template", name)
                    .with_hint("check the template library for the referenced name"),
            )
        })
    }

    /// Number of registered templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CalibrationTemplate> {
        self.templates.values()
    }
}
