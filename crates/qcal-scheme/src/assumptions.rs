//! Ordered assumption store with copy-on-write snapshots.

use std::fmt::{self, Display};
use std::sync::Arc;

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::AssumptionValue;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::placeholder::KeySource;

/// Behaviour when a key that is already bound is written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Replace the value and record an [`OverwriteWarning`].
    #[default]
    Overwrite,
    /// Fail with [`CalError::DuplicateAssumption`] and keep the original.
    Reject,
}

/// Writer of an assumption value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Origin {
    /// Loaded before the run started.
    Initial,
    /// Written by a calibration step.
    Step {
        /// Position of the step within the scheme.
        position: usize,
        /// Label of the step.
        label: String,
    },
}

impl Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Initial => f.write_str("initial"),
            Origin::Step { position, label } => write!(f, "#{position} {label}"),
        }
    }
}

/// Value stored under a key together with its writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssumptionEntry {
    /// Current value.
    pub value: AssumptionValue,
    /// Most recent writer.
    pub origin: Origin,
}

/// Record of a key replaced under [`DuplicatePolicy::Overwrite`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverwriteWarning {
    /// Key that was rewritten.
    pub key: String,
    /// Value before the write.
    pub previous: AssumptionValue,
    /// Value after the write.
    pub value: AssumptionValue,
    /// Writer responsible for the new value.
    pub origin: Origin,
}

type Entries = IndexMap<String, AssumptionEntry>;

/// Immutable view of the store at a point in time.
///
/// Snapshots share storage with the store; later writes never show through.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssumptionSnapshot {
    entries: Arc<Entries>,
}

impl AssumptionSnapshot {
    /// Builds a snapshot from plain values, all marked [`Origin::Initial`].
    pub fn from_values(values: IndexMap<String, AssumptionValue>) -> Self {
        Self {
            entries: Arc::new(initial_entries(values)),
        }
    }

    /// Value bound to `key`.
    pub fn get(&self, key: &str) -> Option<&AssumptionValue> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Value and writer bound to `key`.
    pub fn entry(&self, key: &str) -> Option<&AssumptionEntry> {
        self.entries.get(key)
    }

    /// Returns whether `key` is bound.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys and values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AssumptionValue)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.as_str(), &entry.value))
    }

    /// Snapshot as seen by the step at `position`: keys last written by
    /// that step or a later one are left out.
    pub fn visible_to(&self, position: usize) -> Self {
        let hidden = |entry: &AssumptionEntry| {
            matches!(entry.origin, Origin::Step { position: writer, .. } if writer >= position)
        };
        if !self.entries.values().any(|entry| hidden(entry)) {
            return self.clone();
        }
        let visible = self
            .entries
            .iter()
            .filter(|(_, entry)| !hidden(*entry))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        Self {
            entries: Arc::new(visible),
        }
    }

    /// Copies the values into a plain ordered map.
    pub fn values(&self) -> IndexMap<String, AssumptionValue> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

impl Serialize for AssumptionSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter())
    }
}

impl KeySource for AssumptionSnapshot {
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, Option<&AssumptionValue>)> + '_> {
        Box::new(
            self.entries
                .iter()
                .map(|(key, entry)| (key.as_str(), Some(&entry.value))),
        )
    }

    fn lookup(&self, key: &str) -> Option<Option<&AssumptionValue>> {
        self.get(key).map(Some)
    }
}

fn initial_entries(values: IndexMap<String, AssumptionValue>) -> Entries {
    values
        .into_iter()
        .map(|(key, value)| {
            (
                key,
                AssumptionEntry {
                    value,
                    origin: Origin::Initial,
                },
            )
        })
        .collect()
}

fn duplicate(key: &str, origin: &Origin) -> CalError {
    CalError::DuplicateAssumption(
        ErrorInfo::new(
            "qcal.assumptions.duplicate",
            format!("assumption '{key}' is already bound"),
        )
        .with_context("key", key)
        .with_context("writer", origin.to_string()),
    )
}

/// Mutable key/value store of calibration assumptions.
#[derive(Debug, Clone, Default)]
pub struct AssumptionStore {
    entries: Arc<Entries>,
    policy: DuplicatePolicy,
    warnings: Vec<OverwriteWarning>,
}

impl AssumptionStore {
    /// Creates an empty store.
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            entries: Arc::default(),
            policy,
            warnings: Vec::new(),
        }
    }

    /// Creates a store seeded with initial values.
    pub fn from_values(values: IndexMap<String, AssumptionValue>, policy: DuplicatePolicy) -> Self {
        Self {
            entries: Arc::new(initial_entries(values)),
            policy,
            warnings: Vec::new(),
        }
    }

    /// Duplicate-write policy of the store.
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Value bound to `key`, or [`CalError::UnknownAssumption`].
    pub fn get(&self, key: &str) -> Result<&AssumptionValue, CalError> {
        self.entries
            .get(key)
            .map(|entry| &entry.value)
            .ok_or_else(|| {
                CalError::UnknownAssumption(
                    ErrorInfo::new(
                        "qcal.assumptions.unknown",
                        format!("assumption '{key}' is not bound"),
                    )
                    .with_context("key", key),
                )
            })
    }

    /// Returns whether `key` is bound.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds `key` to `value`, applying the duplicate policy.
    pub fn put(
        &mut self,
        key: impl Into<String>,
        value: AssumptionValue,
        origin: Origin,
    ) -> Result<(), CalError> {
        let key = key.into();
        if self.policy == DuplicatePolicy::Reject && self.entries.contains_key(&key) {
            return Err(duplicate(&key, &origin));
        }
        self.apply(key, value, origin);
        Ok(())
    }

    /// Binds several keys at once. Under [`DuplicatePolicy::Reject`] either
    /// every write lands or none does.
    pub fn put_all(
        &mut self,
        writes: Vec<(String, AssumptionValue)>,
        origin: Origin,
    ) -> Result<(), CalError> {
        if self.policy == DuplicatePolicy::Reject {
            for (position, (key, _)) in writes.iter().enumerate() {
                let repeated = writes[..position].iter().any(|(other, _)| other == key);
                if repeated || self.entries.contains_key(key) {
                    return Err(duplicate(key, &origin));
                }
            }
        }
        for (key, value) in writes {
            self.apply(key, value, origin.clone());
        }
        Ok(())
    }

    fn apply(&mut self, key: String, value: AssumptionValue, origin: Origin) {
        let entries = Arc::make_mut(&mut self.entries);
        if let Some(previous) = entries.get(&key) {
            tracing::warn!(
                key = %key,
                previous = %previous.value,
                value = %value,
                writer = %origin,
                "overwriting assumption"
            );
            self.warnings.push(OverwriteWarning {
                key: key.clone(),
                previous: previous.value.clone(),
                value: value.clone(),
                origin: origin.clone(),
            });
        }
        entries.insert(key, AssumptionEntry { value, origin });
    }

    /// Cheap immutable view of the current contents.
    pub fn snapshot(&self) -> AssumptionSnapshot {
        AssumptionSnapshot {
            entries: Arc::clone(&self.entries),
        }
    }

    /// Overwrites recorded so far.
    pub fn warnings(&self) -> &[OverwriteWarning] {
        &self.warnings
    }
}
