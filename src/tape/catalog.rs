//! In-memory tape registry.
//!
//! The catalog owns every loaded tape behind an [`Arc<TapeHandle>`]. Each
//! tape sits behind its own `std::sync::Mutex`, held only for synchronous
//! sections. Operations locking several tapes take them in catalog order.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::persist::{self, TapeWriter};
use super::{Chapter, Tape, WriteMode};
use crate::error::StoreError;
use crate::matcher::{self, MatchInput, MatchOutcome};
use crate::model::{AttractorBit, Attractors, RequestData, ResponseData};
use crate::observability::metrics;
use crate::replay::UseCounter;

/// Per-tape background save bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct SaveState {
    pub(crate) saving: AtomicBool,
    pub(crate) dirty: AtomicBool,
    pub(crate) file_lock: tokio::sync::Mutex<()>,
}

/// Shared handle to one tape.
#[derive(Debug)]
pub struct TapeHandle {
    name: String,
    tape: Mutex<Tape>,
    pub(crate) save: SaveState,
}

impl TapeHandle {
    fn new(tape: Tape) -> Self {
        Self {
            name: tape.name.clone(),
            tape: Mutex::new(tape),
            save: SaveState::default(),
        }
    }

    /// Tape name, fixed at registration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks the tape.
    ///
    /// # Panics
    ///
    /// Panics if the tape lock is poisoned.
    pub fn lock(&self) -> MutexGuard<'_, Tape> {
        self.tape.lock().expect("tape lock poisoned")
    }
}

/// A chapter located by the catalog.
#[derive(Debug, Clone)]
pub struct ChapterRef {
    /// Owning tape.
    pub tape: Arc<TapeHandle>,
    /// Chapter identifier.
    pub uid: Uuid,
}

/// Registry of all tapes.
#[derive(Debug)]
pub struct TapeCatalog {
    tapes: RwLock<Vec<Arc<TapeHandle>>>,
    dir: Option<PathBuf>,
    read_only: bool,
    writer: TapeWriter,
}

impl TapeCatalog {
    /// Creates an empty catalog saving into `dir`, if any.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            tapes: RwLock::new(Vec::new()),
            dir,
            read_only: false,
            writer: TapeWriter::new(),
        }
    }

    /// An unbacked catalog; nothing is ever written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Builder: disable recording, tape creation and saves.
    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Tape directory.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Returns `true` when the catalog-wide read-only switch is on.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns `true` if new chapters may be recorded into `tape`.
    #[must_use]
    pub fn is_writable(&self, tape: &Tape) -> bool {
        !self.read_only && tape.mode == WriteMode::ReadWrite
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<TapeHandle>>> {
        self.tapes.read().expect("catalog lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<TapeHandle>>> {
        self.tapes.write().expect("catalog lock poisoned")
    }

    /// Loads every `*.json` tape file from the tape directory.
    ///
    /// Unreadable or duplicate tapes are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn load_dir(&self) -> Result<usize, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        if !dir.exists() {
            debug!(dir = %dir.display(), "tape directory does not exist yet");
            return Ok(0);
        }
        let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match persist::read_tape(&path) {
                Ok(tape) => match self.add_tape(tape) {
                    Ok(_) => loaded += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping tape"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable tape"),
            }
        }
        info!(count = loaded, dir = %dir.display(), "tapes loaded");
        Ok(loaded)
    }

    /// Registers a tape.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateTape`] if the name is taken.
    pub fn add_tape(&self, tape: Tape) -> Result<Arc<TapeHandle>, StoreError> {
        let mut tapes = self.write();
        if tapes.iter().any(|t| t.name() == tape.name) {
            return Err(StoreError::DuplicateTape(tape.name));
        }
        let handle = Arc::new(TapeHandle::new(tape));
        tapes.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Looks up a tape by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TapeHandle>> {
        self.read().iter().find(|t| t.name() == name).cloned()
    }

    /// Names of all tapes in registration order.
    #[must_use]
    pub fn tape_names(&self) -> Vec<String> {
        self.read().iter().map(|t| t.name().to_string()).collect()
    }

    /// Every tape handle in registration order.
    #[must_use]
    pub fn tapes(&self) -> Vec<Arc<TapeHandle>> {
        self.read().clone()
    }

    /// Unregisters a tape. Its file is left on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TapeNotFound`] if no tape has this name.
    pub fn remove_tape(&self, name: &str) -> Result<Arc<TapeHandle>, StoreError> {
        let mut tapes = self.write();
        let index = tapes
            .iter()
            .position(|t| t.name() == name)
            .ok_or_else(|| StoreError::TapeNotFound(name.to_string()))?;
        Ok(tapes.remove(index))
    }

    /// Routing-only match over tape-level attractors.
    #[must_use]
    pub fn find_tape_by_query(&self, request: &RequestData) -> MatchOutcome<Arc<TapeHandle>> {
        route(&self.read(), &MatchInput::from_request(request))
    }

    /// [`Self::find_tape_by_query`] restricted to the tapes named in `tape_limit`.
    #[must_use]
    pub fn find_tape_within(&self, request: &RequestData, tape_limit: &[String]) -> MatchOutcome<Arc<TapeHandle>> {
        let allowed: Vec<Arc<TapeHandle>> = self
            .read()
            .iter()
            .filter(|t| tape_limit.iter().any(|n| n == t.name()))
            .cloned()
            .collect();
        route(&allowed, &MatchInput::from_request(request))
    }

    /// Full attractor match over the chapters of the allowed tapes.
    ///
    /// Only chapters active according to `uses` are eligible.
    pub fn find_chapter_by_query(
        &self,
        request: &RequestData,
        tape_limit: Option<&[String]>,
        uses: &dyn UseCounter,
    ) -> MatchOutcome<ChapterRef> {
        let handles: Vec<Arc<TapeHandle>> = self
            .read()
            .iter()
            .filter(|t| tape_limit.is_none_or(|names| names.iter().any(|n| n == t.name())))
            .cloned()
            .collect();
        let mut guards: Vec<MutexGuard<'_, Tape>> = handles.iter().map(|h| h.lock()).collect();
        let input = MatchInput::from_request(request);
        let hash = request.content_hash();
        let key = hash.as_str();
        let eligible = &|c: &Chapter| uses.get(c).is_active();

        let cached: Vec<(usize, usize)> = guards
            .iter()
            .enumerate()
            .flat_map(|(t, tape)| {
                tape.chapters
                    .iter()
                    .enumerate()
                    .filter(move |(_, c)| eligible(c) && c.cached_calls.contains(key))
                    .map(move |(i, _)| (t, i))
            })
            .collect();

        let outcome = if let [only] = cached.as_slice() {
            MatchOutcome::Found(*only)
        } else {
            let outcome = matcher::find_best_with(
                guards.iter().enumerate().flat_map(|(t, tape)| {
                    tape.chapters
                        .iter()
                        .enumerate()
                        .filter(move |(_, c)| eligible(c))
                        .map(move |(i, c)| ((t, i), &c.attractors))
                }),
                &input,
            );
            if let MatchOutcome::Found((t, i)) = outcome {
                guards[t].chapters[i].cached_calls.insert(hash.clone());
            }
            outcome
        };

        outcome.map(|(t, i)| ChapterRef {
            tape: Arc::clone(&handles[t]),
            uid: guards[t].chapters[i].uid,
        })
    }

    /// First tape, in catalog order, holding a chapter that matches
    /// `request` whatever its use state.
    ///
    /// Called after [`Self::find_chapter_by_query`] found nothing active,
    /// so a hit means the matching chapter is spent or disabled.
    #[must_use]
    pub fn find_spent_chapter_tape(&self, request: &RequestData) -> Option<Arc<TapeHandle>> {
        let input = MatchInput::from_request(request);
        self.read()
            .iter()
            .find(|t| t.lock().has_matching_chapter(&input))
            .cloned()
    }

    /// Creates and registers a writable tape routing `request`'s path.
    pub fn create_tape_for(&self, request: &RequestData) -> Arc<TapeHandle> {
        let mut tapes = self.write();
        let handle = Arc::new(TapeHandle::new(self.new_tape_for(&tapes, request)));
        tapes.push(Arc::clone(&handle));
        info!(tape = %handle.name(), "tape created");
        handle
    }

    /// Returns the tape routing `request`, creating one if none does.
    ///
    /// The routing check is repeated under the catalog write lock, so
    /// concurrent callers racing on the same path share one tape.
    pub fn find_or_create_tape_for(&self, request: &RequestData) -> Arc<TapeHandle> {
        let mut tapes = self.write();
        if let MatchOutcome::Found(handle) = route(&tapes, &MatchInput::from_request(request)) {
            return handle;
        }
        let handle = Arc::new(TapeHandle::new(self.new_tape_for(&tapes, request)));
        tapes.push(Arc::clone(&handle));
        info!(tape = %handle.name(), "tape created");
        handle
    }

    fn new_tape_for(&self, tapes: &[Arc<TapeHandle>], request: &RequestData) -> Tape {
        let base = tape_name_for(request.path());
        let taken = |name: &str| tapes.iter().any(|t| t.name() == name);
        let name = if taken(&base) {
            let free = (2..).map(|n| format!("{base}-{n}")).find(|n| !taken(n));
            free.unwrap_or(base)
        } else {
            base
        };
        let mut tape = Tape::new(name)
            .with_attractors(Attractors::routing(AttractorBit::exact(request.path())));
        tape.file = self.dir.as_ref().map(|d| d.join(persist::tape_file_name(&tape.name)));
        tape
    }

    /// Appends a chapter recorded from `request` and saves the tape.
    pub fn record(
        &self,
        handle: &Arc<TapeHandle>,
        request: &RequestData,
        response: Option<ResponseData>,
    ) -> Chapter {
        let chapter = {
            let mut tape = handle.lock();
            let name = tape.unique_chapter_name(&format!("{} {}", request.method, request.path()));
            let chapter = Chapter::record(name, request.clone(), response);
            tape.chapters.push(chapter.clone());
            chapter
        };
        metrics::record_chapter_recorded();
        debug!(tape = %handle.name(), chapter = %chapter.name, "chapter recorded");
        self.save(handle);
        chapter
    }

    /// Saves the tape, assigning it a file in the tape directory if it has
    /// none.
    pub fn save(&self, handle: &Arc<TapeHandle>) {
        if self.read_only {
            return;
        }
        {
            let mut tape = handle.lock();
            if tape.file.is_none() {
                let Some(dir) = &self.dir else {
                    debug!(tape = %handle.name(), "unbacked tape, not saved");
                    return;
                };
                tape.file = Some(dir.join(persist::tape_file_name(&tape.name)));
            }
        }
        self.writer.save(handle);
    }

    /// Saves the tape only if it already has a backing file.
    pub fn save_if_exists(&self, handle: &Arc<TapeHandle>) {
        if !self.read_only && handle.lock().file.is_some() {
            self.writer.save(handle);
        }
    }

    /// Waits for all pending saves.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

fn route(tapes: &[Arc<TapeHandle>], input: &MatchInput) -> MatchOutcome<Arc<TapeHandle>> {
    let routes: Vec<(usize, Attractors)> = tapes
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.lock().attractors.clone().map(|a| (i, a)))
        .collect();
    matcher::find_best_with(routes.iter().map(|(i, a)| (*i, a)), input)
        .map(|i| Arc::clone(&tapes[i]))
}

/// Tape name derived from a request path: `/api/v1/users` becomes
/// `api_v1_users`, the root path becomes `root`.
#[must_use]
pub fn tape_name_for(path: &str) -> String {
    let name: String = path
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() { "root".to_string() } else { name }
}
