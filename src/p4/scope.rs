//! Three-level variable scopes used by the interpreter.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An insertion-ordered string map.
pub type VarMap = IndexMap<String, String>;

/// Variable scope level, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    /// Reset on every sequence run.
    #[default]
    Sequence,
    /// Stored on the chapter.
    Chapter,
    /// Stored on the active test bounds (or the process default).
    Bounds,
}

impl ScopeLevel {
    /// DSL prefix character for this level (`&` chapter, `%` bounds).
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Sequence => "",
            Self::Chapter => "&",
            Self::Bounds => "%",
        }
    }

    /// Parses a DSL prefix character.
    #[must_use]
    pub const fn from_prefix(c: char) -> Option<Self> {
        match c {
            '&' => Some(Self::Chapter),
            '%' => Some(Self::Bounds),
            _ => None,
        }
    }

    /// This level and every enclosing level, innermost first.
    #[must_use]
    pub const fn upward(self) -> &'static [Self] {
        match self {
            Self::Sequence => &[Self::Sequence, Self::Chapter, Self::Bounds],
            Self::Chapter => &[Self::Chapter, Self::Bounds],
            Self::Bounds => &[Self::Bounds],
        }
    }
}

/// Borrowed view of all three scope maps for one interpreter run.
#[derive(Debug)]
pub struct Scopes<'a> {
    sequence: VarMap,
    chapter: &'a mut VarMap,
    bounds: &'a mut VarMap,
}

impl<'a> Scopes<'a> {
    /// Creates scopes with an empty sequence map.
    pub fn new(chapter: &'a mut VarMap, bounds: &'a mut VarMap) -> Self {
        Self {
            sequence: VarMap::new(),
            chapter,
            bounds,
        }
    }

    /// Clears the sequence level.
    pub fn reset_sequence(&mut self) {
        self.sequence.clear();
    }

    /// The map stored at `level`.
    #[must_use]
    pub fn map(&self, level: ScopeLevel) -> &VarMap {
        match level {
            ScopeLevel::Sequence => &self.sequence,
            ScopeLevel::Chapter => self.chapter,
            ScopeLevel::Bounds => self.bounds,
        }
    }

    /// Mutable access to the map stored at `level`.
    pub fn map_mut(&mut self, level: ScopeLevel) -> &mut VarMap {
        match level {
            ScopeLevel::Sequence => &mut self.sequence,
            ScopeLevel::Chapter => self.chapter,
            ScopeLevel::Bounds => self.bounds,
        }
    }

    /// Looks up `name`, optionally walking outward from `level`.
    ///
    /// Returns the level the value was found at alongside the value.
    #[must_use]
    pub fn lookup(&self, level: ScopeLevel, name: &str, search_up: bool) -> Option<(ScopeLevel, &str)> {
        let levels: &[ScopeLevel] = if search_up {
            level.upward()
        } else {
            std::slice::from_ref(&level)
        };
        levels
            .iter()
            .find_map(|&l| self.map(l).get(name).map(|v| (l, v.as_str())))
    }

    /// Sets `name` at `level`.
    pub fn set(&mut self, level: ScopeLevel, name: impl Into<String>, value: impl Into<String>) {
        self.map_mut(level).insert(name.into(), value.into());
    }
}
