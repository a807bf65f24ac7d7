//! Placeholder parsing, binding enumeration and variant expansion.
//!
//! A [`Pattern`] is a string with embedded `{token}` placeholders. Candidate
//! values for a token come from two layers, consulted through a
//! [`BindingScope`]:
//!
//! * step substitution sets: set `i` binds each of its keys at index `i`, and
//!   a token bound by any set is bound by the sets only;
//! * assumptions: key `token` is an unindexed candidate, keys `token_<n>` are
//!   candidates at index `n`. Candidates keep the store's insertion order.
//!
//! [`expand`] enumerates every variant, either as a cartesian product
//! ([`Pairing::Cross`]) or aligned by index ([`Pairing::Zip`]).

use std::fmt::{self, Display};

use indexmap::IndexMap;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::AssumptionValue;
use serde::{Deserialize, Serialize};

fn pattern_error(source: &str, message: impl Into<String>) -> CalError {
    CalError::SchemeValidation(
        ErrorInfo::new("qcal.pattern.invalid", message).with_context("pattern", source),
    )
}

fn unresolved(token: &str) -> CalError {
    CalError::UnresolvedPlaceholder(
        ErrorInfo::new(
            "qcal.placeholder.unresolved",
            format!("no binding for placeholder '{token}'"),
        )
        .with_context("token", token),
    )
}

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '/' | '.' | '-')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(String),
}

/// Name or value pattern with embedded `{token}` placeholders.
///
/// `{{` and `}}` escape literal braces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a pattern, rejecting unbalanced braces and empty tokens.
    pub fn parse(source: &str) -> Result<Self, CalError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut token = String::new();
                    let mut closed = false;
                    for next in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        token.push(next);
                    }
                    if !closed {
                        return Err(pattern_error(source, "unclosed placeholder"));
                    }
                    if token.is_empty() {
                        return Err(pattern_error(source, "empty placeholder"));
                    }
                    if let Some(bad) = token.chars().find(|c| !is_token_char(*c)) {
                        return Err(pattern_error(
                            source,
                            format!("invalid character '{bad}' in placeholder '{token}'"),
                        ));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Token(token));
                }
                '}' => return Err(pattern_error(source, "unmatched '}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Builds a pattern that renders to `text` verbatim.
    pub fn literal(text: &str) -> Self {
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Literal(text.to_string())]
        };
        Self {
            source: text.replace('{', "{{").replace('}', "}}"),
            segments,
        }
    }

    /// Returns the source text of the pattern.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns whether the pattern contains no placeholder.
    pub fn is_literal(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|segment| matches!(segment, Segment::Token(_)))
    }

    /// Distinct tokens in order of first appearance.
    pub fn tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Token(token) = segment {
                if !tokens.contains(&token.as_str()) {
                    tokens.push(token);
                }
            }
        }
        tokens
    }

    /// Renders the pattern with a lookup function, returning the text and
    /// whether every token was substituted. Unsubstituted tokens are kept as
    /// `{token}`.
    pub fn render_with<F>(&self, lookup: F) -> (String, bool)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut out = String::new();
        let mut complete = true;
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(token) => match lookup(token) {
                    Some(value) => out.push_str(&value),
                    None => {
                        complete = false;
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                },
            }
        }
        (out, complete)
    }

    /// Renders the pattern with variant bindings. Deferred bindings render as
    /// `{key}` of the assumption they wait for.
    pub fn render(&self, bindings: &IndexMap<String, Binding>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(token) => match bindings.get(token) {
                    Some(binding) => match &binding.value {
                        Some(value) => out.push_str(&value.to_string()),
                        None => {
                            out.push('{');
                            out.push_str(binding.key().unwrap_or(token));
                            out.push('}');
                        }
                    },
                    None => {
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                },
            }
        }
        out
    }

    /// Renders the pattern only when every token has a known value.
    pub fn try_render(&self, bindings: &IndexMap<String, Binding>) -> Option<String> {
        let (text, complete) = self.render_with(|token| {
            bindings
                .get(token)
                .and_then(|binding| binding.value.as_ref())
                .map(ToString::to_string)
        });
        complete.then_some(text)
    }
}

impl TryFrom<String> for Pattern {
    type Error = CalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::parse(&value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// How the bindings of several placeholders are combined into variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Pairing {
    /// Cartesian product; the first placeholder varies slowest.
    #[default]
    Cross,
    /// One variant per index; unindexed bindings apply to every index.
    Zip,
}

/// Whether a placeholder must be bound for the step to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    /// Missing bindings are errors.
    #[default]
    Required,
    /// Missing bindings skip the step (or the index under zip pairing).
    Optional,
}

/// Where a binding came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BindingSource {
    /// A step substitution set.
    Substitution {
        /// Position of the set within the step.
        set: usize,
    },
    /// An assumption key.
    Assumption {
        /// Key the value was read from.
        key: String,
    },
}

/// Concrete candidate for a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Placeholder the binding applies to.
    pub token: String,
    /// Index of the binding, `None` for unindexed keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Origin of the binding.
    pub source: BindingSource,
    /// Bound value; `None` while the producing step has not run (planning).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AssumptionValue>,
}

impl Binding {
    /// Assumption key backing the binding, if any.
    pub fn key(&self) -> Option<&str> {
        match &self.source {
            BindingSource::Assumption { key } => Some(key),
            BindingSource::Substitution { .. } => None,
        }
    }
}

/// Read access to a set of assumption keys for placeholder resolution.
pub trait KeySource {
    /// Every key in insertion order, with `None` for values not known yet.
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, Option<&AssumptionValue>)> + '_>;

    /// `None` if the key is unknown, `Some(None)` if its value is deferred.
    fn lookup(&self, key: &str) -> Option<Option<&AssumptionValue>>;
}

impl KeySource for IndexMap<String, AssumptionValue> {
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, Option<&AssumptionValue>)> + '_> {
        Box::new(self.iter().map(|(key, value)| (key.as_str(), Some(value))))
    }

    fn lookup(&self, key: &str) -> Option<Option<&AssumptionValue>> {
        self.get(key).map(Some)
    }
}

/// Matches `key` against `token`: `Some(None)` for the plain key,
/// `Some(Some(n))` for `token_<n>`.
pub(crate) fn match_key(token: &str, key: &str) -> Option<Option<usize>> {
    if key == token {
        return Some(None);
    }
    let suffix = key.strip_prefix(token)?.strip_prefix('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().map(Some)
}

/// Key an indexed binding for `token` would be stored under.
pub fn indexed_key(token: &str, index: Option<usize>) -> String {
    match index {
        Some(index) => format!("{token}_{index}"),
        None => token.to_string(),
    }
}

/// Step substitution sets layered over an assumption key source.
pub struct BindingScope<'a> {
    substitutions: &'a [IndexMap<String, AssumptionValue>],
    assumptions: &'a dyn KeySource,
}

impl<'a> BindingScope<'a> {
    /// Scope reading only from `assumptions`.
    pub fn new(assumptions: &'a dyn KeySource) -> Self {
        Self {
            substitutions: &[],
            assumptions,
        }
    }

    /// Layers step substitution sets over the assumptions.
    pub fn with_substitutions(mut self, sets: &'a [IndexMap<String, AssumptionValue>]) -> Self {
        self.substitutions = sets;
        self
    }

    /// Returns whether any substitution set binds `token`.
    pub fn is_substituted(&self, token: &str) -> bool {
        self.substitutions.iter().any(|set| set.contains_key(token))
    }

    /// Candidate bindings for `token` in registration order.
    pub fn candidates(&self, token: &str) -> Vec<Binding> {
        if self.is_substituted(token) {
            return self
                .substitutions
                .iter()
                .enumerate()
                .filter_map(|(set, values)| {
                    values.get(token).map(|value| Binding {
                        token: token.to_string(),
                        index: Some(set),
                        source: BindingSource::Substitution { set },
                        value: Some(value.clone()),
                    })
                })
                .collect();
        }
        self.assumptions
            .entries()
            .filter_map(|(key, value)| {
                let index = match_key(token, key)?;
                Some(Binding {
                    token: token.to_string(),
                    index,
                    source: BindingSource::Assumption {
                        key: key.to_string(),
                    },
                    value: value.cloned(),
                })
            })
            .collect()
    }

    /// Looks up an assumption key in the underlying source.
    pub fn lookup(&self, key: &str) -> Option<Option<&AssumptionValue>> {
        self.assumptions.lookup(key)
    }
}

/// Fully bound placeholder set for one variant.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantBindings {
    /// Substitution set or zip index of the variant.
    pub index: Option<usize>,
    /// Bindings in template token order.
    pub bindings: IndexMap<String, Binding>,
}

/// Variant that could not be bound because a required token lacks a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingBinding {
    /// Index of the variant that could not be bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Placeholder (or template input) lacking a binding.
    pub token: String,
    /// Key that would have provided the binding.
    pub key: String,
}

/// Single entry of an [`Expansion`], kept in enumeration order.
#[derive(Debug, Clone, PartialEq)]
pub enum Expanded {
    /// Every token is bound.
    Bound(VariantBindings),
    /// A required token is missing for this index.
    Missing(MissingBinding),
}

/// Ordered outcome of [`expand`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expansion {
    /// Variants in deterministic enumeration order.
    pub entries: Vec<Expanded>,
    /// Optional token whose absence skipped the whole expansion.
    pub skipped: Option<String>,
}

impl Expansion {
    fn skipped(token: &str) -> Self {
        Self {
            entries: Vec::new(),
            skipped: Some(token.to_string()),
        }
    }

    /// Fully bound variants.
    pub fn bound(&self) -> impl Iterator<Item = &VariantBindings> {
        self.entries.iter().filter_map(|entry| match entry {
            Expanded::Bound(bindings) => Some(bindings),
            Expanded::Missing(_) => None,
        })
    }

    /// Variants lacking a required binding.
    pub fn missing(&self) -> impl Iterator<Item = &MissingBinding> {
        self.entries.iter().filter_map(|entry| match entry {
            Expanded::Missing(missing) => Some(missing),
            Expanded::Bound(_) => None,
        })
    }
}

enum Row {
    Bound(Option<usize>, IndexMap<String, Binding>),
    Missing(MissingBinding),
    Dropped,
}

fn substitution_rows<F>(sub_tokens: &[&String], requirement: &F, scope: &BindingScope<'_>) -> Vec<Row>
where
    F: Fn(&str) -> Requirement,
{
    if sub_tokens.is_empty() {
        return vec![Row::Bound(None, IndexMap::new())];
    }
    scope
        .substitutions
        .iter()
        .enumerate()
        .map(|(set, values)| {
            let mut bound = IndexMap::new();
            for token in sub_tokens {
                match values.get(token.as_str()) {
                    Some(value) => {
                        bound.insert(
                            token.to_string(),
                            Binding {
                                token: token.to_string(),
                                index: Some(set),
                                source: BindingSource::Substitution { set },
                                value: Some(value.clone()),
                            },
                        );
                    }
                    None => {
                        return match requirement(token) {
                            Requirement::Required => Row::Missing(MissingBinding {
                                index: Some(set),
                                token: token.to_string(),
                                key: token.to_string(),
                            }),
                            Requirement::Optional => Row::Dropped,
                        };
                    }
                }
            }
            Row::Bound(Some(set), bound)
        })
        .collect()
}

fn cartesian<'b>(candidates: &'b [(&str, Vec<Binding>)]) -> Vec<Vec<&'b Binding>> {
    let mut combos: Vec<Vec<&Binding>> = vec![Vec::new()];
    for (_, options) in candidates {
        let mut next = Vec::with_capacity(combos.len() * options.len());
        for combo in &combos {
            for option in options {
                let mut extended = combo.clone();
                extended.push(option);
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

fn assemble<'b>(
    tokens: &[String],
    base: &IndexMap<String, Binding>,
    picked: impl IntoIterator<Item = &'b Binding>,
) -> IndexMap<String, Binding> {
    let mut all: IndexMap<&str, &Binding> = base
        .iter()
        .map(|(token, binding)| (token.as_str(), binding))
        .collect();
    for binding in picked {
        all.insert(binding.token.as_str(), binding);
    }
    tokens
        .iter()
        .filter_map(|token| {
            all.get(token.as_str())
                .map(|binding| (token.clone(), (*binding).clone()))
        })
        .collect()
}

/// Enumerates every variant of `tokens` against `scope`.
///
/// Fails with [`CalError::UnresolvedPlaceholder`] naming the token when a
/// required assumption-backed token has no candidate at all. An optional
/// token without candidates yields an empty, skipped expansion. Substitution
/// sets only form the row axis when they bind one of `tokens`, so an empty
/// token list yields exactly one variant.
pub fn expand<F>(
    tokens: &[String],
    requirement: F,
    pairing: Pairing,
    scope: &BindingScope<'_>,
) -> Result<Expansion, CalError>
where
    F: Fn(&str) -> Requirement,
{
    let (sub_tokens, assumption_tokens): (Vec<&String>, Vec<&String>) =
        tokens.iter().partition(|token| scope.is_substituted(token));

    let mut candidates: Vec<(&str, Vec<Binding>)> = Vec::with_capacity(assumption_tokens.len());
    for token in &assumption_tokens {
        let found = scope.candidates(token);
        if found.is_empty() {
            return match requirement(token) {
                Requirement::Required => Err(unresolved(token)),
                Requirement::Optional => Ok(Expansion::skipped(token)),
            };
        }
        candidates.push((token.as_str(), found));
    }

    let rows = substitution_rows(&sub_tokens, &requirement, scope);
    let mut entries = Vec::new();
    match pairing {
        Pairing::Cross => {
            let combos = cartesian(&candidates);
            for row in rows {
                match row {
                    Row::Dropped => {}
                    Row::Missing(missing) => entries.push(Expanded::Missing(missing)),
                    Row::Bound(index, base) => {
                        for combo in &combos {
                            entries.push(Expanded::Bound(VariantBindings {
                                index,
                                bindings: assemble(tokens, &base, combo.iter().copied()),
                            }));
                        }
                    }
                }
            }
        }
        Pairing::Zip => {
            let universe: Vec<Option<usize>> = if sub_tokens.is_empty() {
                let mut indices: Vec<Option<usize>> = Vec::new();
                for (_, options) in &candidates {
                    for binding in options {
                        if binding.index.is_some() && !indices.contains(&binding.index) {
                            indices.push(binding.index);
                        }
                    }
                }
                if indices.is_empty() {
                    indices.push(None);
                }
                indices
            } else {
                (0..scope.substitutions.len()).map(Some).collect()
            };

            let empty = IndexMap::new();
            'indices: for (position, index) in universe.into_iter().enumerate() {
                let base = if sub_tokens.is_empty() {
                    &empty
                } else {
                    match &rows[position] {
                        Row::Dropped => continue 'indices,
                        Row::Missing(missing) => {
                            entries.push(Expanded::Missing(missing.clone()));
                            continue 'indices;
                        }
                        Row::Bound(_, base) => base,
                    }
                };
                let mut picked = Vec::with_capacity(candidates.len());
                for (token, options) in &candidates {
                    let choice = index
                        .and_then(|i| options.iter().find(|binding| binding.index == Some(i)))
                        .or_else(|| options.iter().find(|binding| binding.index.is_none()));
                    match choice {
                        Some(binding) => picked.push(binding),
                        None => {
                            if requirement(token) == Requirement::Required {
                                entries.push(Expanded::Missing(MissingBinding {
                                    index,
                                    token: token.to_string(),
                                    key: indexed_key(token, index),
                                }));
                            }
                            continue 'indices;
                        }
                    }
                }
                entries.push(Expanded::Bound(VariantBindings {
                    index,
                    bindings: assemble(tokens, base, picked),
                }));
            }
        }
    }
    Ok(Expansion {
        entries,
        skipped: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assumptions(pairs: &[(&str, f64)]) -> IndexMap<String, AssumptionValue> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), AssumptionValue::Number(*value)))
            .collect()
    }

    #[test]
    fn parse_splits_literals_and_tokens() {
        let pattern = Pattern::parse("rabi_{pulse}_{qubit/freq}").unwrap();
        assert_eq!(pattern.tokens(), vec!["pulse", "qubit/freq"]);
        assert!(!pattern.is_literal());
        assert_eq!(pattern.as_str(), "rabi_{pulse}_{qubit/freq}");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let pattern = Pattern::parse("{{raw}}_{x}").unwrap();
        assert_eq!(pattern.tokens(), vec!["x"]);
        let (text, complete) = pattern.render_with(|_| Some("1".into()));
        assert!(complete);
        assert_eq!(text, "{raw}_1");
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for source in ["open_{x", "{}", "a}b", "{bad token}"] {
            let err = Pattern::parse(source).unwrap_err();
            assert_eq!(err.info().code, "qcal.pattern.invalid", "{source}");
        }
    }

    #[test]
    fn literal_round_trips_through_source() {
        let pattern = Pattern::literal("odd{name}");
        assert!(pattern.is_literal());
        let reparsed = Pattern::parse(pattern.as_str()).unwrap();
        assert_eq!(reparsed.render_with(|_| None).0, "odd{name}");
    }

    #[test]
    fn indexed_keys_match_only_numeric_suffixes() {
        assert_eq!(match_key("value_a", "value_a"), Some(None));
        assert_eq!(match_key("value_a", "value_a_3"), Some(Some(3)));
        assert_eq!(match_key("value_a", "value_a_b"), None);
        assert_eq!(match_key("value_a", "value_ab_1"), None);
        assert_eq!(match_key("value_a", "value_a_"), None);
    }

    #[test]
    fn render_marks_deferred_bindings_with_their_key() {
        let pattern = Pattern::parse("drive_{amp}").unwrap();
        let mut bindings = IndexMap::new();
        bindings.insert(
            "amp".to_string(),
            Binding {
                token: "amp".into(),
                index: Some(0),
                source: BindingSource::Assumption {
                    key: "amp_0".into(),
                },
                value: None,
            },
        );
        assert_eq!(pattern.render(&bindings), "drive_{amp_0}");
        assert_eq!(pattern.try_render(&bindings), None);
    }

    #[test]
    fn substitution_sets_shadow_assumptions() {
        let store = assumptions(&[("pulse", 1.0)]);
        let sets = vec![
            IndexMap::from([("pulse".to_string(), AssumptionValue::from("pi"))]),
            IndexMap::from([("pulse".to_string(), AssumptionValue::from("pi2"))]),
        ];
        let scope = BindingScope::new(&store).with_substitutions(&sets);
        let found = scope.candidates("pulse");
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].value, Some(AssumptionValue::from("pi2")));
        assert_eq!(found[1].source, BindingSource::Substitution { set: 1 });
    }

    #[test]
    fn zip_broadcasts_unindexed_bindings() {
        let store = assumptions(&[("gain", 2.0), ("amp_0", 0.1), ("amp_1", 0.2)]);
        let scope = BindingScope::new(&store);
        let tokens = vec!["amp".to_string(), "gain".to_string()];
        let expansion = expand(&tokens, |_| Requirement::Required, Pairing::Zip, &scope).unwrap();
        let bound: Vec<_> = expansion.bound().collect();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[1].index, Some(1));
        assert_eq!(bound[1].bindings["gain"].value, Some(AssumptionValue::Number(2.0)));
    }
}
