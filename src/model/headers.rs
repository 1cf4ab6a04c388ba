//! Ordered, case-insensitive, multi-valued HTTP header list.

use serde::{Deserialize, Serialize};

/// A single header entry as stored and serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    /// Header name, original casing preserved.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// Ordered header list.
///
/// Lookups ignore ASCII case; duplicate names are kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<HeaderEntry>);

impl Headers {
    /// Creates an empty header list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a header, keeping any existing entry with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(HeaderEntry {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces every value of `name` with a single `value`.
    ///
    /// The replacement takes the position of the first existing entry;
    /// when the name is absent the header is appended.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|e| e.name.eq_ignore_ascii_case(name)) {
            Some(first) => {
                self.0[first].value = value;
                let mut idx = 0;
                self.0.retain(|e| {
                    let keep = idx <= first || !e.name.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    /// Removes every entry named `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|e| !e.name.eq_ignore_ascii_case(name));
    }

    /// Returns the first value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    /// Returns every value of `name` in order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
            .collect()
    }

    /// Returns `true` if at least one entry is named `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Iterates entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }

    /// Iterates entries mutably in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HeaderEntry> {
        self.0.iter_mut()
    }

    /// Number of entries (duplicates counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}
