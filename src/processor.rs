//! Call processor: the path from an inbound call to its response.
//!
//! Every call takes the gate permit for its canonical key first and holds
//! it until the response is built. Calls carrying the bounds header are
//! confined to the session's tapes and never record.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::bounds::{BOUNDS_HEADER, BoundsRegistry, TestBounds};
use crate::gate::{ConcurrencyGate, gate_key};
use crate::matcher::MatchOutcome;
use crate::model::{RequestData, ResponseData, status};
use crate::observability::metrics;
use crate::replay::{ChapterUses, ReplayEngine, ReplayOutcome, SearchPreference, Upstream};
use crate::tape::{ChapterRef, TapeCatalog, TapeHandle};

/// What happened to one call, for logging and metrics.
#[derive(Debug, Clone)]
pub struct Handled {
    /// Response to send.
    pub response: ResponseData,
    /// Metrics outcome label.
    pub outcome: &'static str,
    /// Tape that answered.
    pub tape: Option<String>,
    /// Chapter that answered.
    pub chapter: Option<String>,
    /// Replay preference that fired.
    pub preference: Option<SearchPreference>,
}

impl Handled {
    fn status(code: u16, outcome: &'static str) -> Self {
        Self {
            response: ResponseData::status(code),
            outcome,
            tape: None,
            chapter: None,
            preference: None,
        }
    }

    fn gone() -> Self {
        Self::status(status::GONE, "gone")
    }

    fn with_tape(mut self, tape: &TapeHandle) -> Self {
        self.tape = Some(tape.name().to_string());
        self
    }

    fn replayed(tape: &TapeHandle, outcome: ReplayOutcome) -> Self {
        let label = match outcome.preference {
            _ if matches!(outcome.response.code, status::BAD_GATEWAY | status::SERVICE_UNAVAILABLE) => "live_error",
            Some(preference) => preference.as_str(),
            None => "gone",
        };
        Self {
            response: outcome.response,
            outcome: label,
            tape: Some(tape.name().to_string()),
            chapter: outcome.chapter,
            preference: outcome.preference,
        }
    }
}

/// Resolves and answers virtualized calls.
#[derive(Debug)]
pub struct CallProcessor {
    catalog: Arc<TapeCatalog>,
    engine: ReplayEngine,
    gate: ConcurrencyGate,
    bounds: Arc<BoundsRegistry>,
}

impl CallProcessor {
    /// Creates a processor over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<TapeCatalog>, upstream: Arc<dyn Upstream>, bounds: Arc<BoundsRegistry>) -> Self {
        Self {
            engine: ReplayEngine::new(Arc::clone(&catalog), upstream),
            catalog,
            gate: ConcurrencyGate::new(),
            bounds,
        }
    }

    /// Tape catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<TapeCatalog> {
        &self.catalog
    }

    /// Bounds sessions.
    #[must_use]
    pub const fn bounds(&self) -> &Arc<BoundsRegistry> {
        &self.bounds
    }

    /// Answers one call.
    pub async fn handle(&self, request: &RequestData) -> ResponseData {
        self.process(request).await.response
    }

    /// Answers one call, reporting how it was handled.
    pub async fn process(&self, request: &RequestData) -> Handled {
        let started = Instant::now();
        let key = gate_key(request);
        let handled = match self.gate.acquire(&key).await {
            Ok(permit) => {
                debug!(key = permit.key(), "gate acquired");
                match request.headers.get(BOUNDS_HEADER) {
                    Some(handle) => self.bounded(handle.trim(), request).await,
                    None => self.unbounded(request).await,
                }
            }
            Err(e) => {
                error!(key = %key, error = %e, "gate closed");
                Handled::status(status::SERVICE_UNAVAILABLE, "busy")
            }
        };

        metrics::record_call(handled.outcome, started.elapsed());
        info!(
            method = %request.method,
            path = %request.path(),
            tape = handled.tape.as_deref().unwrap_or("-"),
            chapter = handled.chapter.as_deref().unwrap_or("-"),
            preference = handled.preference.map_or("-", SearchPreference::as_str),
            status = handled.response.code,
            "call handled"
        );
        handled
    }

    async fn unbounded(&self, request: &RequestData) -> Handled {
        let scope = self.bounds.default_scope();
        match self.catalog.find_chapter_by_query(request, None, &ChapterUses) {
            MatchOutcome::Found(found) => {
                let outcome = self.engine.replay(&found.tape, request, &ChapterUses, scope).await;
                Handled::replayed(&found.tape, outcome)
            }
            MatchOutcome::Conflict(refs) => match single_tape(&refs) {
                Some(tape) => {
                    let outcome = self.engine.replay(tape, request, &ChapterUses, scope).await;
                    Handled::replayed(tape, outcome)
                }
                None => {
                    warn!(
                        method = %request.method,
                        path = %request.path(),
                        candidates = refs.len(),
                        "chapters on several tapes match equally"
                    );
                    Handled::gone()
                }
            },
            MatchOutcome::NotFound => self.route(request).await,
        }
    }

    async fn route(&self, request: &RequestData) -> Handled {
        match self.catalog.find_tape_by_query(request) {
            MatchOutcome::Found(tape) => {
                let (always_live, writable) = {
                    let t = tape.lock();
                    (t.always_live, self.catalog.is_writable(&t))
                };
                if always_live {
                    let outcome = self
                        .engine
                        .replay(&tape, request, &ChapterUses, self.bounds.default_scope())
                        .await;
                    Handled::replayed(&tape, outcome)
                } else if let Some(spent) = self.spent(request) {
                    Handled::gone().with_tape(&spent)
                } else if writable {
                    self.record(&tape, request).await
                } else {
                    debug!(tape = %tape.name(), "read-only tape, not recording");
                    Handled::gone().with_tape(&tape)
                }
            }
            MatchOutcome::Conflict(tapes) => {
                warn!(path = %request.path(), candidates = tapes.len(), "several tapes route this call");
                Handled::gone()
            }
            MatchOutcome::NotFound => {
                if let Some(spent) = self.spent(request) {
                    return Handled::gone().with_tape(&spent);
                }
                if self.catalog.is_read_only() {
                    debug!(path = %request.path(), "catalog is read-only, not creating a tape");
                    return Handled::gone();
                }
                let tape = self.catalog.find_or_create_tape_for(request);
                let writable = self.catalog.is_writable(&tape.lock());
                if writable {
                    self.record(&tape, request).await
                } else {
                    Handled::gone().with_tape(&tape)
                }
            }
        }
    }

    /// A tape whose matching chapter has no uses left. Such calls are gone,
    /// never recorded again.
    fn spent(&self, request: &RequestData) -> Option<Arc<TapeHandle>> {
        let tape = self.catalog.find_spent_chapter_tape(request)?;
        debug!(tape = %tape.name(), "matching chapter has no uses left");
        Some(tape)
    }

    async fn record(&self, tape: &Arc<TapeHandle>, request: &RequestData) -> Handled {
        let (response, chapter) = self.engine.record_live(tape, request).await;
        let outcome = if chapter.is_some() { "recorded" } else { "live_error" };
        Handled {
            response,
            outcome,
            tape: Some(tape.name().to_string()),
            chapter,
            preference: None,
        }
    }

    async fn bounded(&self, handle: &str, request: &RequestData) -> Handled {
        let bounds = match self.bounds.resolve(handle) {
            Ok(bounds) => bounds,
            Err(reason) => {
                debug!(handle, reason = ?reason, "bounds refused");
                return Handled::status(status::FORBIDDEN, "forbidden");
            }
        };
        match self
            .catalog
            .find_chapter_by_query(request, Some(bounds.tapes()), bounds.uses())
        {
            MatchOutcome::Found(found) => self.replay_bounded(&bounds, &found.tape, request).await,
            MatchOutcome::Conflict(refs) => match single_tape(&refs) {
                Some(tape) => self.replay_bounded(&bounds, tape, request).await,
                None => {
                    warn!(handle, candidates = refs.len(), "chapters on several bound tapes match equally");
                    Handled::gone()
                }
            },
            MatchOutcome::NotFound => match self.catalog.find_tape_within(request, bounds.tapes()) {
                MatchOutcome::Found(tape) => {
                    let always_live = tape.lock().always_live;
                    if always_live {
                        self.replay_bounded(&bounds, &tape, request).await
                    } else {
                        Handled::status(status::PRECONDITION_FAILED, "precondition_failed").with_tape(&tape)
                    }
                }
                MatchOutcome::Conflict(_) | MatchOutcome::NotFound => Handled::gone(),
            },
        }
    }

    async fn replay_bounded(&self, bounds: &TestBounds, tape: &Arc<TapeHandle>, request: &RequestData) -> Handled {
        let outcome = self.engine.replay(tape, request, bounds.uses(), bounds.scope()).await;
        if outcome.preference.is_none() {
            return Handled::status(status::PRECONDITION_FAILED, "precondition_failed").with_tape(tape);
        }
        Handled::replayed(tape, outcome)
    }
}

/// The tape shared by every candidate, if there is exactly one.
fn single_tape(refs: &[ChapterRef]) -> Option<&Arc<TapeHandle>> {
    let (first, rest) = refs.split_first()?;
    rest.iter()
        .all(|r| Arc::ptr_eq(&r.tape, &first.tape))
        .then_some(&first.tape)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::LiveCallError;
    use crate::model::{AttractorBit, Attractors, MockUse};
    use crate::tape::{Chapter, Tape, WriteMode};

    #[derive(Default)]
    struct Backend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for Backend {
        async fn call(&self, _base: &str, request: &RequestData) -> Result<ResponseData, LiveCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResponseData::status(200).with_body(format!("live {}", request.path())))
        }
    }

    fn processor(catalog: TapeCatalog) -> (CallProcessor, Arc<Backend>) {
        let backend = Arc::new(Backend::default());
        let processor = CallProcessor::new(
            Arc::new(catalog),
            backend.clone(),
            Arc::new(BoundsRegistry::new()),
        );
        (processor, backend)
    }

    fn stored(path: &str, body: &str) -> Chapter {
        Chapter::record(
            format!("GET {path}"),
            RequestData::new("GET", path),
            Some(ResponseData::status(200).with_body(body)),
        )
    }

    fn routed(name: &str, prefix: &str) -> Tape {
        Tape::new(name).with_attractors(Attractors::routing(AttractorBit::new(format!("^{prefix}"))))
    }

    #[tokio::test]
    async fn unknown_call_creates_tape_and_await_chapter() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        let handled = processor.process(&RequestData::new("GET", "/new/thing")).await;
        assert_eq!(handled.response.code, status::CREATED);
        assert_eq!(handled.outcome, "recorded");
        assert_eq!(handled.tape.as_deref(), Some("new_thing"));
        assert_eq!(processor.catalog().tape_names(), vec!["new_thing"]);
    }

    #[tokio::test]
    async fn routed_tape_with_backend_records_live_response() {
        let (processor, backend) = processor(TapeCatalog::in_memory());
        processor
            .catalog()
            .add_tape(routed("api", "/api").with_routing_url("http://backend"))
            .unwrap();
        let req = RequestData::new("GET", "/api/x");
        let first = processor.handle(&req).await;
        assert_eq!(first.body, "live /api/x");
        let second = processor.process(&req).await;
        assert_eq!(second.preference, Some(SearchPreference::MockOnly));
        assert_eq!(second.response.body, "live /api/x");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_chapter_is_gone_not_rerecorded() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        let tape = processor
            .catalog()
            .add_tape(routed("api", "/api").with_chapter(stored("/api/x", "x").with_uses(MockUse::Limited(1))))
            .unwrap();
        let req = RequestData::new("GET", "/api/x");
        assert_eq!(processor.handle(&req).await.body, "x");
        assert_eq!(processor.handle(&req).await.code, status::GONE);
        assert_eq!(tape.lock().chapters.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_chapter_on_unrouted_tape_is_gone() {
        let (processor, backend) = processor(TapeCatalog::in_memory());
        processor
            .catalog()
            .add_tape(Tape::new("hand").with_chapter(stored("/c", "counted").with_uses(MockUse::Limited(1))))
            .unwrap();
        let req = RequestData::new("GET", "/c");
        assert_eq!(processor.handle(&req).await.body, "counted");

        let second = processor.process(&req).await;
        assert_eq!(second.response.code, status::GONE);
        assert_eq!(second.tape.as_deref(), Some("hand"));
        assert_eq!(processor.catalog().tape_names(), vec!["hand"]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn read_only_tape_is_gone() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        processor
            .catalog()
            .add_tape(routed("api", "/api").with_mode(WriteMode::ReadOnly))
            .unwrap();
        assert_eq!(processor.handle(&RequestData::new("GET", "/api/y")).await.code, status::GONE);
    }

    #[tokio::test]
    async fn read_only_catalog_creates_nothing() {
        let (processor, _) = processor(TapeCatalog::in_memory().with_read_only(true));
        assert_eq!(processor.handle(&RequestData::new("GET", "/z")).await.code, status::GONE);
        assert!(processor.catalog().tape_names().is_empty());
    }

    #[tokio::test]
    async fn cross_tape_conflict_is_gone() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        for name in ["a", "b"] {
            let mut chapter = stored("/dup", name);
            chapter.cached_calls.clear();
            processor.catalog().add_tape(Tape::new(name).with_chapter(chapter)).unwrap();
        }
        let handled = processor.process(&RequestData::new("GET", "/dup")).await;
        assert_eq!(handled.response.code, status::GONE);
    }

    #[tokio::test]
    async fn unknown_bounds_are_forbidden() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        let req = RequestData::new("GET", "/x").with_header(BOUNDS_HEADER, "missing");
        assert_eq!(processor.handle(&req).await.code, status::FORBIDDEN);
        assert!(processor.catalog().tape_names().is_empty());
    }

    #[tokio::test]
    async fn bounded_tape_without_chapter_fails_precondition() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        processor.catalog().add_tape(routed("api", "/api")).unwrap();
        processor.bounds().start("run", vec!["api".into()], None);
        let req = RequestData::new("GET", "/api/x").with_header(BOUNDS_HEADER, "run");
        assert_eq!(processor.handle(&req).await.code, status::PRECONDITION_FAILED);

        let elsewhere = RequestData::new("GET", "/other").with_header(BOUNDS_HEADER, "run");
        assert_eq!(processor.handle(&elsewhere).await.code, status::GONE);
        assert_eq!(processor.catalog().tape_names(), vec!["api"]);
    }

    #[tokio::test]
    async fn bounded_session_keeps_its_own_counters() {
        let (processor, _) = processor(TapeCatalog::in_memory());
        let tape = processor
            .catalog()
            .add_tape(routed("api", "/api").with_chapter(stored("/api/x", "x").with_uses(MockUse::Limited(1))))
            .unwrap();
        processor.bounds().start("run", vec!["api".into()], None);
        let req = RequestData::new("GET", "/api/x").with_header(BOUNDS_HEADER, "run");
        assert_eq!(processor.handle(&req).await.body, "x");
        assert_eq!(processor.handle(&req).await.code, status::PRECONDITION_FAILED);
        assert_eq!(tape.lock().chapters[0].mock_uses, MockUse::Limited(1));

        processor.bounds().start("run", vec!["api".into()], None);
        assert_eq!(processor.handle(&req).await.body, "x");
    }
}
