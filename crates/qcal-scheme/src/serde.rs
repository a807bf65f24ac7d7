use std::collections::BTreeMap;
use std::iter::FromIterator;

use qcal_core::errors::{CalError, ErrorInfo};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

fn serde_error(code: &str, err: impl ToString) -> CalError {
    CalError::Serde(ErrorInfo::new(format!("qcal.serde.{code}"), err.to_string()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect::<BTreeMap<_, _>>();
            Value::Object(Map::from_iter(ordered))
        }
        Value::Array(values) => {
            let canonical_values = values.into_iter().map(canonicalize).collect();
            Value::Array(canonical_values)
        }
        other => other,
    }
}

/// Canonical JSON bytes: object keys sorted at every depth, no whitespace.
///
/// Used for report files and as the input of [`crate::stable_hash_string`].
pub fn to_canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CalError> {
    let value = serde_json::to_value(value).map_err(|err| serde_error("json_serialize", err))?;
    let canonical = canonicalize(value);
    let mut bytes = Vec::new();
    serde_json::to_writer(&mut bytes, &canonical).map_err(|err| serde_error("json_write", err))?;
    Ok(bytes)
}

/// Parses a JSON scheme, template or assumption file.
pub fn from_json_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, CalError> {
    serde_json::from_slice(data).map_err(|err| serde_error("json_deserialize", err))
}

/// Renders YAML in declaration order, as printed by `qcal plan`.
pub fn to_yaml_string<T: Serialize>(value: &T) -> Result<String, CalError> {
    serde_yaml::to_string(value).map_err(|err| serde_error("yaml_serialize", err))
}

/// Parses a YAML scheme, template, assumption or run config file.
pub fn from_yaml_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, CalError> {
    serde_yaml::from_slice(data).map_err(|err| serde_error("yaml_deserialize", err))
}

/// Parses a TOML input; TOML has no null, so optional fields must be omitted.
pub fn from_toml_str<T: DeserializeOwned>(data: &str) -> Result<T, CalError> {
    toml::from_str(data).map_err(|err| serde_error("toml_deserialize", err))
}
