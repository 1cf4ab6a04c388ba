//! Replay engine: picks how a call is answered from one tape.
//!
//! Search preferences are tried in a fixed order ([`SearchPreference::ORDER`]).
//! The first preference with a uniquely matching chapter fires and the pass
//! ends there. Chapter state is mutated only under the tape lock and the
//! lock is never held across a live call.

pub mod live;
pub mod uses;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

pub use live::{HttpUpstream, Upstream};
pub use uses::{BoundsUses, ChapterUses, TapeUses, UseCounter};

use crate::error::LiveCallError;
use crate::matcher::{MatchInput, MatchOutcome};
use crate::model::{MockUse, RequestData, ResponseData, status};
use crate::observability::metrics;
use crate::p4::{P4Action, VarMap};
use crate::tape::{Chapter, Tape, TapeCatalog, TapeHandle};

/// Strategy used to answer a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPreference {
    /// Forward to the backend.
    AlwaysLive,
    /// Record the backend's response into an awaiting chapter.
    AwaitOnly,
    /// Serve a chapter with uses left.
    LimitedOnly,
    /// Serve a chapter without a use limit.
    MockOnly,
}

impl SearchPreference {
    /// Evaluation order.
    pub const ORDER: [Self; 4] = [Self::AlwaysLive, Self::AwaitOnly, Self::LimitedOnly, Self::MockOnly];

    /// Stable lower-case name, used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysLive => "always_live",
            Self::AwaitOnly => "await_only",
            Self::LimitedOnly => "limited_only",
            Self::MockOnly => "mock_only",
        }
    }

    /// Returns `true` if `uses` and `chapter` qualify for this preference.
    fn accepts(self, chapter: &Chapter, uses: MockUse, writable: bool) -> bool {
        if !uses.is_active() {
            return false;
        }
        match self {
            Self::AlwaysLive => chapter.always_live,
            Self::AwaitOnly => writable && chapter.await_response,
            Self::LimitedOnly => matches!(uses, MockUse::Limited(n) if n >= 1),
            Self::MockOnly => uses == MockUse::Always,
        }
    }
}

impl std::fmt::Display for SearchPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one replay pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Response to send.
    pub response: ResponseData,
    /// Preference that fired, `None` when nothing matched.
    pub preference: Option<SearchPreference>,
    /// Name of the chapter that answered.
    pub chapter: Option<String>,
}

impl ReplayOutcome {
    fn gone() -> Self {
        Self {
            response: ResponseData::status(status::GONE),
            preference: None,
            chapter: None,
        }
    }

    fn answered(response: ResponseData, preference: SearchPreference, chapter: Option<String>) -> Self {
        Self {
            response,
            preference: Some(preference),
            chapter,
        }
    }
}

enum Selection {
    Chapter(SearchPreference, Uuid),
    TapeLive,
    Ambiguous(SearchPreference, usize),
    Nothing,
}

fn select(tape: &mut Tape, input: &MatchInput, hash: &str, uses: &dyn UseCounter, writable: bool) -> Selection {
    for preference in SearchPreference::ORDER {
        let outcome = tape.find_chapter(input, hash, |c| preference.accepts(c, uses.get(c), writable));
        match outcome {
            MatchOutcome::Found(i) => return Selection::Chapter(preference, tape.chapters[i].uid),
            MatchOutcome::Conflict(tied) => return Selection::Ambiguous(preference, tied.len()),
            MatchOutcome::NotFound => {}
        }
        if preference == SearchPreference::AlwaysLive && tape.always_live {
            let any = tape.find_chapter(input, hash, |c| uses.get(c).is_active());
            return match any {
                MatchOutcome::Found(i) => Selection::Chapter(preference, tape.chapters[i].uid),
                _ => Selection::TapeLive,
            };
        }
    }
    Selection::Nothing
}

/// The call being answered and the state it runs against.
struct ReplayContext<'a> {
    handle: &'a Arc<TapeHandle>,
    request: &'a RequestData,
    uses: &'a dyn UseCounter,
    bounds_scope: &'a Mutex<VarMap>,
}

/// Answers calls from tapes, live backends and chapter scripts.
pub struct ReplayEngine {
    catalog: Arc<TapeCatalog>,
    upstream: Arc<dyn Upstream>,
}

impl ReplayEngine {
    /// Creates an engine over `catalog` using `upstream` for live calls.
    #[must_use]
    pub fn new(catalog: Arc<TapeCatalog>, upstream: Arc<dyn Upstream>) -> Self {
        Self { catalog, upstream }
    }

    /// The catalog this engine serves from.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<TapeCatalog> {
        &self.catalog
    }

    /// Runs one replay pass for `request` against `handle`'s tape.
    ///
    /// `uses` decides the use state of every chapter and `bounds_scope` is
    /// the outermost script scope.
    pub async fn replay(
        &self,
        handle: &Arc<TapeHandle>,
        request: &RequestData,
        uses: &dyn UseCounter,
        bounds_scope: &Mutex<VarMap>,
    ) -> ReplayOutcome {
        let ctx = ReplayContext {
            handle,
            request,
            uses,
            bounds_scope,
        };
        let input = MatchInput::from_request(request);
        let hash = request.content_hash();
        let (selection, routing_url) = {
            let mut tape = handle.lock();
            // Session-local counters never write to the tape, so a bounded
            // call cannot fill an awaiting chapter either.
            let writable = self.catalog.is_writable(&tape) && uses.writes_chapter();
            let routing_url = tape.routing_url.clone();
            (select(&mut tape, &input, &hash, uses, writable), routing_url)
        };

        match selection {
            Selection::Nothing => ReplayOutcome::gone(),
            Selection::Ambiguous(preference, tied) => {
                warn!(
                    tape = %handle.name(),
                    preference = %preference,
                    candidates = tied,
                    "ambiguous chapter match"
                );
                ReplayOutcome::gone()
            }
            Selection::TapeLive => {
                let response = match self.call_live(routing_url.as_deref(), request).await {
                    Ok(response) => response,
                    Err(e) => ResponseData::status(e.status_code()),
                };
                ReplayOutcome::answered(response, SearchPreference::AlwaysLive, None)
            }
            Selection::Chapter(SearchPreference::AlwaysLive, uid) => {
                match self.call_live(routing_url.as_deref(), request).await {
                    Ok(response) => {
                        self.serve(&ctx, uid, Some(response), true, false)
                            .map_or_else(ReplayOutcome::gone, |(response, name)| {
                                ReplayOutcome::answered(response, SearchPreference::AlwaysLive, Some(name))
                            })
                    }
                    Err(e) => ReplayOutcome::answered(
                        ResponseData::status(e.status_code()),
                        SearchPreference::AlwaysLive,
                        chapter_name(handle, uid),
                    ),
                }
            }
            Selection::Chapter(SearchPreference::AwaitOnly, uid) => {
                let live = match routing_url.as_deref() {
                    None => Err(LiveCallError::NoRoute),
                    Some(url) => self.call_live(Some(url), request).await,
                };
                match live {
                    Ok(response) => self
                        .serve(&ctx, uid, Some(response), true, true)
                        .map_or_else(ReplayOutcome::gone, |(response, name)| {
                            ReplayOutcome::answered(response, SearchPreference::AwaitOnly, Some(name))
                        }),
                    Err(LiveCallError::NoRoute) => ReplayOutcome::answered(
                        ResponseData::status(status::NO_CONTENT),
                        SearchPreference::AwaitOnly,
                        chapter_name(handle, uid),
                    ),
                    Err(e) => ReplayOutcome::answered(
                        ResponseData::status(e.status_code()),
                        SearchPreference::AwaitOnly,
                        chapter_name(handle, uid),
                    ),
                }
            }
            Selection::Chapter(preference, uid) => {
                let consume = preference == SearchPreference::LimitedOnly;
                self.serve(&ctx, uid, None, consume, false)
                    .map_or_else(ReplayOutcome::gone, |(response, name)| {
                        ReplayOutcome::answered(response, preference, Some(name))
                    })
            }
        }
    }

    /// Applies the chosen chapter: consumes a use, records a live response
    /// when `fill` is set, runs the chapter script and returns the response
    /// with the chapter name.
    ///
    /// `live` replaces the stored response when given. A chapter with no
    /// response at all answers `204 No Content`.
    fn serve(
        &self,
        ctx: &ReplayContext<'_>,
        uid: Uuid,
        live: Option<ResponseData>,
        consume: bool,
        fill: bool,
    ) -> Option<(ResponseData, String)> {
        let ReplayContext {
            handle,
            request,
            uses,
            bounds_scope,
        } = *ctx;
        let (response, name, save, new_file) = {
            let mut tape = handle.lock();
            let index = tape.chapter_index(uid)?;
            let mut save = false;

            let chapter = &mut tape.chapters[index];
            if fill && let Some(response) = &live {
                chapter.fill(response.clone());
                save = true;
            }
            if consume && uses.consume(chapter) {
                save |= uses.writes_chapter();
            }
            chapter.used = Some(Utc::now());
            let name = chapter.name.clone();

            let mut response = live
                .or_else(|| chapter.response.clone())
                .unwrap_or_else(|| ResponseData::status(status::NO_CONTENT));

            if !chapter.sequences.is_empty() {
                let sequences = chapter.sequences.clone();
                let mut chapter_scope = std::mem::take(&mut chapter.scope);
                let scope_before = chapter_scope.clone();
                let mut bounds = bounds_scope.lock().expect("bounds scope lock poisoned");
                let mut access = TapeUses::new(&mut tape.chapters, index, uses);
                {
                    let mut action =
                        P4Action::new(request, &mut response, &mut chapter_scope, &mut bounds, &mut access);
                    let reports = action.run(&sequences);
                    debug!(
                        chapter = %name,
                        sequences = reports.len(),
                        aborted = reports.iter().filter(|r| r.aborted).count(),
                        "chapter script ran"
                    );
                }
                save |= access.changed() && uses.writes_chapter();
                save |= chapter_scope != scope_before;
                tape.chapters[index].scope = chapter_scope;
            }
            (response, name, save, tape.file.is_none())
        };

        if save {
            if fill && new_file {
                self.catalog.save(handle);
            } else {
                self.catalog.save_if_exists(handle);
            }
        }
        Some((response, name))
    }

    /// Forwards `request` to `routing_url`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveCallError::NoRoute`] without a URL, otherwise whatever
    /// the upstream reports.
    pub async fn call_live(
        &self,
        routing_url: Option<&str>,
        request: &RequestData,
    ) -> Result<ResponseData, LiveCallError> {
        let Some(url) = routing_url else {
            metrics::record_live_call("no_route");
            return Err(LiveCallError::NoRoute);
        };
        let result = self.upstream.call(url, request).await;
        match &result {
            Ok(response) => {
                debug!(url, status = response.code, "live call answered");
                metrics::record_live_call("ok");
            }
            Err(LiveCallError::Timeout) => {
                warn!(url, "live call timed out");
                metrics::record_live_call("timeout");
            }
            Err(e) => {
                warn!(url, error = %e, "live call failed");
                metrics::record_live_call("error");
            }
        }
        result
    }

    /// Records `request` into `handle`'s tape.
    ///
    /// With a routing URL the backend is called first and its response is
    /// stored and returned. Without one an awaiting chapter is stored and
    /// `201 Created` is returned.
    pub async fn record_live(&self, handle: &Arc<TapeHandle>, request: &RequestData) -> (ResponseData, Option<String>) {
        let routing_url = handle.lock().routing_url.clone();
        let Some(url) = routing_url else {
            let chapter = self.catalog.record(handle, request, None);
            return (ResponseData::status(status::CREATED), Some(chapter.name));
        };
        match self.call_live(Some(&url), request).await {
            Ok(response) => {
                let chapter = self.catalog.record(handle, request, Some(response.clone()));
                (response, Some(chapter.name))
            }
            Err(e) => (ResponseData::status(e.status_code()), None),
        }
    }
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("tapes", &self.catalog.tape_names())
            .finish_non_exhaustive()
    }
}

fn chapter_name(handle: &TapeHandle, uid: Uuid) -> Option<String> {
    handle.lock().chapter(uid).map(|c| c.name.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::{AttractorBit, Attractors};
    use crate::p4::Sequence;
    use crate::tape::Tape;

    struct Echo {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Upstream for Echo {
        async fn call(&self, _base: &str, request: &RequestData) -> Result<ResponseData, LiveCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LiveCallError::Network("refused".into()));
            }
            Ok(ResponseData::status(200).with_body(format!("live {}", request.url)))
        }
    }

    fn engine(fail: bool) -> (ReplayEngine, Arc<Echo>) {
        let upstream = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            fail,
        });
        let catalog = Arc::new(TapeCatalog::in_memory());
        (ReplayEngine::new(catalog, upstream.clone()), upstream)
    }

    fn stored(path: &str, body: &str) -> Chapter {
        Chapter::record(
            format!("GET {path}"),
            RequestData::new("GET", path),
            Some(ResponseData::status(200).with_body(body)),
        )
    }

    async fn run(engine: &ReplayEngine, tape: &Arc<TapeHandle>, path: &str) -> ReplayOutcome {
        let scope = Mutex::new(VarMap::new());
        engine
            .replay(tape, &RequestData::new("GET", path), &ChapterUses, &scope)
            .await
    }

    #[tokio::test]
    async fn mock_chapter_is_served_unchanged() {
        let (engine, upstream) = engine(false);
        let tape = engine.catalog().add_tape(Tape::new("t").with_chapter(stored("/a", "A"))).unwrap();
        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.preference, Some(SearchPreference::MockOnly));
        assert_eq!(outcome.response.body, "A");
        assert_eq!(outcome.chapter.as_deref(), Some("GET /a"));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn limited_chapter_serves_exactly_n_times() {
        let (engine, _) = engine(false);
        let tape = engine
            .catalog()
            .add_tape(Tape::new("t").with_chapter(stored("/a", "A").with_uses(MockUse::Limited(2))))
            .unwrap();
        for _ in 0..2 {
            let outcome = run(&engine, &tape, "/a").await;
            assert_eq!(outcome.preference, Some(SearchPreference::LimitedOnly));
        }
        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.response.code, status::GONE);
        assert_eq!(tape.lock().chapters[0].mock_uses, MockUse::Disabled);
    }

    #[tokio::test]
    async fn limited_wins_over_mock() {
        let (engine, _) = engine(false);
        let tape = engine
            .catalog()
            .add_tape(
                Tape::new("t")
                    .with_chapter(stored("/a", "mock"))
                    .with_chapter(stored("/a", "limited").with_uses(MockUse::Limited(1))),
            )
            .unwrap();
        assert_eq!(run(&engine, &tape, "/a").await.response.body, "limited");
        assert_eq!(run(&engine, &tape, "/a").await.response.body, "mock");
    }

    #[tokio::test]
    async fn tied_chapters_are_gone() {
        let (engine, _) = engine(false);
        let mut a = stored("/a", "1");
        let mut b = stored("/a", "2");
        a.cached_calls.clear();
        b.cached_calls.clear();
        let tape = engine.catalog().add_tape(Tape::new("t").with_chapter(a).with_chapter(b)).unwrap();
        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.response.code, status::GONE);
        assert_eq!(outcome.preference, None);
    }

    #[tokio::test]
    async fn always_live_tape_needs_no_chapter() {
        let (engine, upstream) = engine(false);
        let mut tape = Tape::new("live").with_routing_url("http://backend");
        tape.always_live = true;
        let tape = engine.catalog().add_tape(tape).unwrap();
        let outcome = run(&engine, &tape, "/anything").await;
        assert_eq!(outcome.preference, Some(SearchPreference::AlwaysLive));
        assert_eq!(outcome.response.body, "live /anything");
        assert_eq!(outcome.chapter, None);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn always_live_without_route_is_unavailable() {
        let (engine, _) = engine(false);
        let mut tape = Tape::new("live");
        tape.always_live = true;
        let tape = engine.catalog().add_tape(tape).unwrap();
        assert_eq!(run(&engine, &tape, "/x").await.response.code, status::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn failed_live_call_is_bad_gateway() {
        let (engine, _) = engine(true);
        let mut chapter = stored("/a", "A");
        chapter.always_live = true;
        let tape = engine
            .catalog()
            .add_tape(Tape::new("t").with_routing_url("http://backend").with_chapter(chapter))
            .unwrap();
        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.response.code, status::BAD_GATEWAY);
        assert_eq!(outcome.chapter.as_deref(), Some("GET /a"));
    }

    #[tokio::test]
    async fn await_chapter_records_and_decrements() {
        let (engine, upstream) = engine(false);
        let chapter = Chapter::record("GET /a", RequestData::new("GET", "/a"), None).with_uses(MockUse::Limited(3));
        let tape = engine
            .catalog()
            .add_tape(Tape::new("t").with_routing_url("http://backend").with_chapter(chapter))
            .unwrap();

        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.preference, Some(SearchPreference::AwaitOnly));
        assert_eq!(outcome.response.body, "live /a");
        {
            let tape = tape.lock();
            assert!(!tape.chapters[0].await_response);
            assert_eq!(tape.chapters[0].mock_uses, MockUse::Limited(2));
            assert_eq!(tape.chapters[0].response.as_ref().map(|r| r.body.as_str()), Some("live /a"));
        }

        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.preference, Some(SearchPreference::LimitedOnly));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn await_without_route_is_no_content() {
        let (engine, _) = engine(false);
        let chapter = Chapter::record("GET /a", RequestData::new("GET", "/a"), None);
        let tape = engine.catalog().add_tape(Tape::new("t").with_chapter(chapter)).unwrap();
        let outcome = run(&engine, &tape, "/a").await;
        assert_eq!(outcome.response.code, status::NO_CONTENT);
        assert!(tape.lock().chapters[0].await_response);
    }

    #[tokio::test]
    async fn script_rewrites_served_response() {
        let (engine, _) = engine(false);
        let chapter = stored("/users/42", r#"{"id":"0"}"#)
            .with_attractors(Attractors::routing(AttractorBit::new(r"^/users/\d+$")))
            .with_sequence(Sequence::from_script(
                None,
                "request:head[X-Id]->id\nresponse:body:{\"id\":\"(\\d+)\"}->{@{id}}",
            ));
        let tape = engine.catalog().add_tape(Tape::new("t").with_chapter(chapter)).unwrap();
        let scope = Mutex::new(VarMap::new());
        let request = RequestData::new("GET", "/users/42").with_header("X-Id", "42");
        let outcome = engine.replay(&tape, &request, &ChapterUses, &scope).await;
        assert_eq!(outcome.response.body, r#"{"id":"42"}"#);
        assert_eq!(
            tape.lock().chapters[0].response.as_ref().map(|r| r.body.as_str()),
            Some(r#"{"id":"0"}"#)
        );
    }

    #[tokio::test]
    async fn bounds_counters_leave_tape_untouched() {
        let (engine, _) = engine(false);
        let tape = engine
            .catalog()
            .add_tape(Tape::new("t").with_chapter(stored("/a", "A").with_uses(MockUse::Limited(1))))
            .unwrap();
        let counter = BoundsUses::new();
        let scope = Mutex::new(VarMap::new());
        let req = RequestData::new("GET", "/a");
        assert_eq!(
            engine.replay(&tape, &req, &counter, &scope).await.preference,
            Some(SearchPreference::LimitedOnly)
        );
        assert_eq!(engine.replay(&tape, &req, &counter, &scope).await.response.code, status::GONE);
        assert_eq!(tape.lock().chapters[0].mock_uses, MockUse::Limited(1));
    }

    #[tokio::test]
    async fn record_without_backend_creates_await_chapter() {
        let (engine, _) = engine(false);
        let tape = engine.catalog().add_tape(Tape::new("t")).unwrap();
        let (response, name) = engine.record_live(&tape, &RequestData::new("GET", "/new")).await;
        assert_eq!(response.code, status::CREATED);
        assert_eq!(name.as_deref(), Some("GET /new"));
        assert!(tape.lock().chapters[0].await_response);
    }
}
