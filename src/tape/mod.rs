//! Tapes: named, file-backed collections of recorded chapters.

pub mod catalog;
pub mod chapter;
pub mod persist;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use catalog::{ChapterRef, TapeCatalog, TapeHandle};
pub use chapter::Chapter;
pub use persist::TapeWriter;

use crate::matcher::{self, MatchInput, MatchOutcome};
use crate::model::Attractors;

/// Whether new chapters may be recorded into a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    /// Unmatched calls are recorded.
    #[default]
    ReadWrite,
    /// The tape is served as-is.
    ReadOnly,
}

/// A named set of chapters with an optional live backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tape {
    /// Unique tape name.
    pub name: String,
    /// Base URL of the live backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_url: Option<String>,
    /// Forward every routed call to the backend.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_live: bool,
    /// Recording mode.
    #[serde(default)]
    pub mode: WriteMode,
    /// Routing filter; a tape without one never matches by routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attractors: Option<Attractors>,
    /// Chapters in recording order.
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    /// Backing file.
    #[serde(skip)]
    pub file: Option<PathBuf>,
}

impl Tape {
    /// Creates an empty writable tape.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_url: None,
            always_live: false,
            mode: WriteMode::ReadWrite,
            attractors: None,
            chapters: Vec::new(),
            file: None,
        }
    }

    /// Builder: set the live backend URL.
    #[must_use]
    pub fn with_routing_url(mut self, url: impl Into<String>) -> Self {
        self.routing_url = Some(url.into());
        self
    }

    /// Builder: set the routing attractors.
    #[must_use]
    pub fn with_attractors(mut self, attractors: Attractors) -> Self {
        self.attractors = Some(attractors);
        self
    }

    /// Builder: set the mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder: append a chapter.
    #[must_use]
    pub fn with_chapter(mut self, chapter: Chapter) -> Self {
        self.chapters.push(chapter);
        self
    }

    /// Index of the chapter with `uid`.
    #[must_use]
    pub fn chapter_index(&self, uid: Uuid) -> Option<usize> {
        self.chapters.iter().position(|c| c.uid == uid)
    }

    /// The chapter with `uid`.
    #[must_use]
    pub fn chapter(&self, uid: Uuid) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.uid == uid)
    }

    /// Matches `input` against the chapters accepted by `eligible`.
    ///
    /// A single eligible chapter whose cache holds `hash` wins outright.
    /// Otherwise the matcher scores every eligible chapter and a unique
    /// winner gets `hash` added to its cache.
    pub fn find_chapter(
        &mut self,
        input: &MatchInput,
        hash: &str,
        eligible: impl Fn(&Chapter) -> bool,
    ) -> MatchOutcome<usize> {
        let mut cached = self
            .chapters
            .iter()
            .enumerate()
            .filter(|(_, c)| eligible(c) && c.cached_calls.contains(hash))
            .map(|(i, _)| i);
        if let (Some(only), None) = (cached.next(), cached.next()) {
            return MatchOutcome::Found(only);
        }

        let outcome = matcher::find_best_with(
            self.chapters
                .iter()
                .enumerate()
                .filter(|(_, c)| eligible(c))
                .map(|(i, c)| (i, &c.attractors)),
            input,
        );
        if let MatchOutcome::Found(i) = outcome {
            self.chapters[i].cached_calls.insert(hash.to_string());
        }
        outcome
    }

    /// Returns `true` if any chapter's attractors match `input`, whatever
    /// its use state.
    #[must_use]
    pub fn has_matching_chapter(&self, input: &MatchInput) -> bool {
        self.chapters
            .iter()
            .any(|c| matcher::score(&c.attractors, input).is_some())
    }

    /// Copy of this tape holding only the chapters written to disk.
    #[must_use]
    pub fn persistable(&self) -> Self {
        Self {
            chapters: self
                .chapters
                .iter()
                .filter(|c| c.mock_uses.is_persisted())
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    /// `base`, or `base #N` for the first free `N`.
    #[must_use]
    pub fn unique_chapter_name(&self, base: &str) -> String {
        let taken = |name: &str| self.chapters.iter().any(|c| c.name == name);
        if !taken(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base} #{n}"))
            .find(|name| !taken(name))
            .unwrap_or_else(|| base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttractorBit, MockUse, RequestData};

    fn chapter(path: &str) -> Chapter {
        Chapter::record(path, RequestData::new("GET", path), None)
    }

    #[test]
    fn persistable_drops_limited_chapters() {
        let tape = Tape::new("t")
            .with_chapter(chapter("/a"))
            .with_chapter(chapter("/b").with_uses(MockUse::Limited(2)))
            .with_chapter(chapter("/c").with_uses(MockUse::Disabled))
            .with_chapter(chapter("/d").with_uses(MockUse::DisabledLimited(1)));
        let names: Vec<_> = tape.persistable().chapters.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["/a", "/c"]);
    }

    #[test]
    fn cached_hash_short_circuits_scoring() {
        let mut tape = Tape::new("t").with_chapter(
            chapter("/a").with_attractors(Attractors::routing(AttractorBit::new("^/never$"))),
        );
        let req = RequestData::new("GET", "/a");
        let input = MatchInput::from_request(&req);
        let outcome = tape.find_chapter(&input, &req.content_hash(), |_| true);
        assert_eq!(outcome, MatchOutcome::Found(0));
    }

    #[test]
    fn scoring_winner_is_cached() {
        let mut tape = Tape::new("t").with_chapter(chapter("/a"));
        let req = RequestData::new("GET", "/a").with_header("X-Run", "2");
        let hash = req.content_hash();
        assert!(!tape.chapters[0].cached_calls.contains(&hash));

        let input = MatchInput::from_request(&req);
        assert_eq!(tape.find_chapter(&input, &hash, |_| true), MatchOutcome::Found(0));
        assert!(tape.chapters[0].cached_calls.contains(&hash));
    }

    #[test]
    fn ineligible_chapters_are_ignored() {
        let mut tape = Tape::new("t").with_chapter(chapter("/a").with_uses(MockUse::Disabled));
        let req = RequestData::new("GET", "/a");
        let input = MatchInput::from_request(&req);
        let outcome = tape.find_chapter(&input, &req.content_hash(), |c| c.mock_uses.is_active());
        assert_eq!(outcome, MatchOutcome::NotFound);
        assert!(tape.has_matching_chapter(&input));
    }

    #[test]
    fn unique_names() {
        let tape = Tape::new("t").with_chapter(chapter("GET /a"));
        assert_eq!(tape.unique_chapter_name("GET /b"), "GET /b");
        assert_eq!(tape.unique_chapter_name("GET /a"), "GET /a #2");
    }

    #[test]
    fn tape_json_shape() {
        let tape = Tape::new("orders")
            .with_routing_url("http://localhost:9000")
            .with_mode(WriteMode::ReadOnly);
        let json = serde_json::to_value(&tape).unwrap();
        assert_eq!(json["routingUrl"], "http://localhost:9000");
        assert_eq!(json["mode"], "readOnly");
        assert!(json.get("file").is_none());
    }
}
