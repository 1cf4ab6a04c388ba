//! Tape files on disk and the background writer.
//!
//! A save is a read-modify-write of the JSON tree: keys tapedeck owns are
//! replaced, any other top-level key already in the file is kept. Only
//! persisted chapters (see [`crate::model::MockUse::is_persisted`]) are
//! written.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::Tape;
use super::catalog::TapeHandle;
use crate::error::StoreError;
use crate::observability::metrics;

/// Maximum tape file size accepted on load (64 MiB).
pub const MAX_TAPE_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Top-level keys written from [`Tape`].
const OWNED_KEYS: &[&str] = &[
    "name",
    "routingUrl",
    "alwaysLive",
    "mode",
    "attractors",
    "chapters",
];

/// File name for a tape: unsafe path characters become `_`.
#[must_use]
pub fn tape_file_name(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.json", stem.trim_start_matches('.'))
}

/// Reads one tape file.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the file cannot be read and
/// [`StoreError::Malformed`] if it is too large or not a tape.
pub fn read_tape(path: &Path) -> Result<Tape, StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > MAX_TAPE_FILE_SIZE {
        return Err(StoreError::Malformed {
            path: path.to_path_buf(),
            message: format!("file is {size} bytes, limit is {MAX_TAPE_FILE_SIZE}"),
        });
    }
    let content = std::fs::read_to_string(path).map_err(io_err)?;
    parse_tape(&content, path)
}

/// Parses tape JSON. `path` is used for error messages and becomes the
/// tape's backing file.
///
/// # Errors
///
/// Returns [`StoreError::Malformed`] if the text is not a tape.
pub fn parse_tape(content: &str, path: &Path) -> Result<Tape, StoreError> {
    let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
    let mut tape: Tape = serde_json::from_str(content).map_err(|e| StoreError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tape.file = Some(path.to_path_buf());
    Ok(tape)
}

/// Writes `tape` to `path`, keeping foreign top-level keys.
///
/// The file is replaced through a temporary sibling and a rename.
///
/// # Errors
///
/// Returns [`StoreError::Io`] on any file system failure.
pub fn write_tape(path: &Path, tape: &Tape) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut root = match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => {
                debug!(path = %path.display(), "existing tape file unreadable, overwriting");
                Map::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(e) => return Err(io_err(e)),
    };

    let fresh = match serde_json::to_value(tape.persistable()) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            return Err(StoreError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    };
    for key in OWNED_KEYS {
        root.remove(*key);
    }
    root.extend(fresh);

    let text = serde_json::to_string_pretty(&Value::Object(root)).map_err(|e| StoreError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

/// Background tape writer.
///
/// Saves run as detached tasks. A save requested while one is running for
/// the same tape marks it dirty and the running task writes once more.
#[derive(Debug, Default)]
pub struct TapeWriter {
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl TapeWriter {
    /// Creates a writer with no pending saves.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a save of `handle`'s tape to its backing file.
    ///
    /// Outside a Tokio runtime the save runs inline.
    pub fn save(&self, handle: &Arc<TapeHandle>) {
        handle.save.dirty.store(true, Ordering::SeqCst);
        if handle.save.saving.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            handle.save.dirty.store(false, Ordering::SeqCst);
            write_snapshot(handle);
            handle.save.saving.store(false, Ordering::SeqCst);
            return;
        };
        let task = runtime.spawn(save_loop(Arc::clone(handle)));
        let mut pending = self.pending.lock().expect("writer lock poisoned");
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    /// Waits until every queued save has completed.
    pub async fn flush(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.pending.lock().expect("writer lock poisoned"));
            if tasks.is_empty() {
                return;
            }
            for result in futures_util::future::join_all(tasks).await {
                if let Err(e) = result {
                    error!(error = %e, "tape save task failed");
                }
            }
        }
    }
}

async fn save_loop(handle: Arc<TapeHandle>) {
    loop {
        handle.save.dirty.store(false, Ordering::SeqCst);
        {
            let _file = handle.save.file_lock.lock().await;
            let (path, snapshot) = {
                let tape = handle.lock();
                (tape.file.clone(), tape.clone())
            };
            if let Some(path) = path {
                let name = handle.name().to_string();
                match tokio::task::spawn_blocking(move || write_tape(&path, &snapshot)).await {
                    Ok(result) => report(&name, &result),
                    Err(e) => error!(tape = %name, error = %e, "tape save task panicked"),
                }
            }
        }
        if handle.save.dirty.load(Ordering::SeqCst) {
            continue;
        }
        handle.save.saving.store(false, Ordering::SeqCst);
        // A save requested between the dirty check and the release saw
        // `saving` still set and returned; pick it up here.
        if !handle.save.dirty.load(Ordering::SeqCst) || handle.save.saving.swap(true, Ordering::SeqCst) {
            return;
        }
    }
}

fn write_snapshot(handle: &TapeHandle) {
    let (path, snapshot) = {
        let tape = handle.lock();
        (tape.file.clone(), tape.clone())
    };
    if let Some(path) = path {
        report(handle.name(), &write_tape(&path, &snapshot));
    }
}

fn report(tape: &str, result: &Result<(), StoreError>) {
    match result {
        Ok(()) => {
            debug!(tape, "tape saved");
            metrics::record_tape_save(true);
        }
        Err(e) => {
            error!(tape, error = %e, "tape save failed");
            metrics::record_tape_save(false);
        }
    }
}
