//! Use counters: where a chapter's `MockUse` state is read and written.
//!
//! Outside a test session the chapter's own field is authoritative
//! ([`ChapterUses`]). A bounded session keeps its own counters seeded from
//! the chapters ([`BoundsUses`]), leaving the shared tapes untouched.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::model::MockUse;
use crate::p4::UseStateAccess;
use crate::tape::Chapter;

/// Source of truth for chapter use state.
pub trait UseCounter: Send + Sync {
    /// Current state of `chapter`.
    fn get(&self, chapter: &Chapter) -> MockUse;

    /// Replaces the state of `chapter`.
    fn set(&self, chapter: &mut Chapter, uses: MockUse);

    /// Returns `true` if writes land on the chapter itself, so the tape
    /// needs saving afterwards.
    fn writes_chapter(&self) -> bool;

    /// Consumes one use. Returns `true` if the state changed.
    fn consume(&self, chapter: &mut Chapter) -> bool {
        let before = self.get(chapter);
        let after = before.consumed();
        if before == after {
            return false;
        }
        self.set(chapter, after);
        true
    }
}

/// Reads and writes `Chapter::mock_uses`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChapterUses;

impl UseCounter for ChapterUses {
    fn get(&self, chapter: &Chapter) -> MockUse {
        chapter.mock_uses
    }

    fn set(&self, chapter: &mut Chapter, uses: MockUse) {
        chapter.mock_uses = uses;
    }

    fn writes_chapter(&self) -> bool {
        true
    }
}

/// Session-local counters keyed by chapter uid.
#[derive(Debug, Default)]
pub struct BoundsUses {
    overrides: Mutex<HashMap<Uuid, MockUse>>,
}

impl BoundsUses {
    /// Creates an empty counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn overrides(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, MockUse>> {
        self.overrides.lock().expect("bounds uses lock poisoned")
    }
}

impl UseCounter for BoundsUses {
    fn get(&self, chapter: &Chapter) -> MockUse {
        self.overrides()
            .get(&chapter.uid)
            .copied()
            .unwrap_or(chapter.mock_uses)
    }

    fn set(&self, chapter: &mut Chapter, uses: MockUse) {
        self.overrides().insert(chapter.uid, uses);
    }

    fn writes_chapter(&self) -> bool {
        false
    }
}

/// [`UseStateAccess`] over one tape's chapters for a running script.
pub struct TapeUses<'a> {
    chapters: &'a mut [Chapter],
    current: usize,
    counter: &'a dyn UseCounter,
    changed: bool,
}

impl<'a> TapeUses<'a> {
    /// Access for the script of `chapters[current]`.
    pub fn new(chapters: &'a mut [Chapter], current: usize, counter: &'a dyn UseCounter) -> Self {
        Self {
            chapters,
            current,
            counter,
            changed: false,
        }
    }

    /// Returns `true` if the script wrote any use state.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.changed
    }
}

impl UseStateAccess for TapeUses<'_> {
    fn uses(&self, chapter: Option<&str>) -> Option<MockUse> {
        let chapter = match chapter {
            None => self.chapters.get(self.current)?,
            Some(name) => self.chapters.iter().find(|c| c.name == name)?,
        };
        Some(self.counter.get(chapter))
    }

    fn set_uses(&mut self, chapter: &str, uses: MockUse) -> bool {
        let Some(target) = self.chapters.iter_mut().find(|c| c.name == chapter) else {
            return false;
        };
        self.counter.set(target, uses);
        self.changed = true;
        true
    }
}
