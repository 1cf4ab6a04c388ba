//! Test bounds: short-lived sessions restricting replay to a set of tapes.
//!
//! A session is addressed by the `x-tapedeck-bounds` request header. It owns
//! the outermost script scope and its own use counters, so a test run can
//! consume limited chapters without touching the shared tapes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use crate::p4::VarMap;
use crate::replay::BoundsUses;

/// Request header naming the active bounds.
pub const BOUNDS_HEADER: &str = "x-tapedeck-bounds";

/// Why a bounds handle cannot serve a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsStatus {
    /// Usable.
    Active,
    /// No session with this handle.
    Unknown,
    /// Past its expiry time.
    Expired,
    /// Disabled through the admin API.
    Disabled,
    /// Started with an empty tape list.
    NoTapes,
}

impl BoundsStatus {
    /// Returns `true` for [`BoundsStatus::Active`].
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// One bounded test session.
#[derive(Debug)]
pub struct TestBounds {
    handle: String,
    tapes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
    disabled: AtomicBool,
    scope: Mutex<VarMap>,
    uses: BoundsUses,
}

impl TestBounds {
    /// Creates a session over `tapes`, expiring after `duration` if given.
    #[must_use]
    pub fn new(handle: impl Into<String>, tapes: Vec<String>, duration: Option<Duration>) -> Self {
        let expires_at = duration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| Utc::now().checked_add_signed(d));
        Self {
            handle: handle.into(),
            tapes,
            expires_at,
            disabled: AtomicBool::new(false),
            scope: Mutex::new(VarMap::new()),
            uses: BoundsUses::new(),
        }
    }

    /// Session handle.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Tapes this session may match against.
    #[must_use]
    pub fn tapes(&self) -> &[String] {
        &self.tapes
    }

    /// Expiry time, if any.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Session variables, the outermost script scope.
    #[must_use]
    pub const fn scope(&self) -> &Mutex<VarMap> {
        &self.scope
    }

    /// Session use counters.
    #[must_use]
    pub const fn uses(&self) -> &BoundsUses {
        &self.uses
    }

    /// Marks the session disabled.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    /// Whether the session can serve a call at `now`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> BoundsStatus {
        if self.disabled.load(Ordering::SeqCst) {
            BoundsStatus::Disabled
        } else if self.expires_at.is_some_and(|at| now >= at) {
            BoundsStatus::Expired
        } else if self.tapes.is_empty() {
            BoundsStatus::NoTapes
        } else {
            BoundsStatus::Active
        }
    }

    /// [`Self::status_at`] for the current time.
    #[must_use]
    pub fn status(&self) -> BoundsStatus {
        self.status_at(Utc::now())
    }
}

/// All known sessions plus the default scope used outside any session.
#[derive(Debug, Default)]
pub struct BoundsRegistry {
    sessions: DashMap<String, Arc<TestBounds>>,
    default_scope: Mutex<VarMap>,
}

impl BoundsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the session `handle`.
    ///
    /// Restarting replaces the previous session, discarding its scope and
    /// counters.
    pub fn start(&self, handle: &str, tapes: Vec<String>, duration: Option<Duration>) -> Arc<TestBounds> {
        let bounds = Arc::new(TestBounds::new(handle, tapes, duration));
        info!(
            handle,
            tapes = bounds.tapes().len(),
            expires_at = ?bounds.expires_at(),
            "bounds started"
        );
        self.sessions.insert(handle.to_string(), Arc::clone(&bounds));
        bounds
    }

    /// Disables `handle`. Returns `false` if it is unknown.
    pub fn disable(&self, handle: &str) -> bool {
        self.sessions.get(handle).is_some_and(|bounds| {
            bounds.disable();
            info!(handle, "bounds disabled");
            true
        })
    }

    /// Looks up a session.
    #[must_use]
    pub fn get(&self, handle: &str) -> Option<Arc<TestBounds>> {
        self.sessions.get(handle).map(|b| Arc::clone(b.value()))
    }

    /// Resolves `handle` to a usable session or the reason it is unusable.
    ///
    /// # Errors
    ///
    /// Returns the session's non-active [`BoundsStatus`].
    pub fn resolve(&self, handle: &str) -> Result<Arc<TestBounds>, BoundsStatus> {
        let bounds = self.get(handle).ok_or(BoundsStatus::Unknown)?;
        match bounds.status() {
            BoundsStatus::Active => Ok(bounds),
            other => Err(other),
        }
    }

    /// Scope shared by every call made outside a session.
    #[must_use]
    pub const fn default_scope(&self) -> &Mutex<VarMap> {
        &self.default_scope
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no session was ever started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Parses an admin-supplied duration such as `90s` or `5m`.
///
/// # Errors
///
/// Returns the `humantime` message if the text is not a duration.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    humantime::parse_duration(text.trim()).map_err(|e| e.to_string())
}
