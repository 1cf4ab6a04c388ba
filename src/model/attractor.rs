//! Attractor rules: the fingerprints a live request is scored against.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::exchange::RequestData;

/// One matchable rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttractorBit {
    /// Regex pattern searched for in the relevant input.
    #[serde(default)]
    pub value: String,
    /// Absence does not disqualify the set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    /// Satisfied only when the pattern is NOT found.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub except: bool,
    /// Wildcard: satisfies its whole category.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_all_inputs: bool,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl PartialEq for AttractorBit {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.optional == other.optional
            && self.except == other.except
            && self.allow_all_inputs == other.allow_all_inputs
    }
}

impl Eq for AttractorBit {}

impl AttractorBit {
    /// A required bit with the given pattern.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// A bit that must match the literal text exactly (anchored, escaped).
    #[must_use]
    pub fn exact(literal: &str) -> Self {
        Self::new(format!("^{}$", regex::escape(literal)))
    }

    /// A wildcard bit.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            allow_all_inputs: true,
            ..Self::default()
        }
    }

    /// Builder: mark optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Builder: mark except.
    #[must_use]
    pub fn except(mut self) -> Self {
        self.except = true;
        self
    }

    /// Compiled pattern; `None` when the pattern is malformed.
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| {
                regex::RegexBuilder::new(&self.value)
                    .size_limit(1 << 20)
                    .build()
                    .ok()
            })
            .as_ref()
    }

    /// Returns `true` if the pattern is found in `input`.
    ///
    /// Malformed patterns are never found.
    #[must_use]
    pub fn found_in(&self, input: &str) -> bool {
        self.regex().is_some_and(|re| re.is_match(input))
    }
}

/// The set of attractor bits describing one chapter or tape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attractors {
    /// Pattern tested against the request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<AttractorBit>,
    /// Patterns tested against each `key=value` query pair.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<AttractorBit>,
    /// Patterns tested against each header.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<AttractorBit>,
    /// Patterns tested against the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<AttractorBit>,
}

impl Attractors {
    /// Attractors with only a routing path bit.
    #[must_use]
    pub const fn routing(bit: AttractorBit) -> Self {
        Self {
            routing: Some(bit),
            queries: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Derives attractors for a freshly recorded request: the exact path plus
    /// one exact bit per query pair.
    #[must_use]
    pub fn from_request(request: &RequestData) -> Self {
        let queries = request
            .query_pairs()
            .into_iter()
            .map(|(k, v)| AttractorBit::exact(&format!("{k}={v}")))
            .collect();
        Self {
            routing: Some(AttractorBit::exact(request.path())),
            queries,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Returns `true` if no bit is configured at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routing.is_none()
            && self.queries.is_empty()
            && self.headers.is_empty()
            && self.body.is_empty()
    }
}
