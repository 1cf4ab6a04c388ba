//! Chapters: one recorded exchange plus its matching rules and script.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Attractors, MockUse, RequestData, ResponseData};
use crate::p4::{Sequence, VarMap};

/// One recorded request/response pair within a tape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    /// Display name; unique within its tape by convention only.
    pub name: String,
    /// Stable identifier.
    #[serde(default = "Uuid::new_v4")]
    pub uid: Uuid,
    /// Rules a request must satisfy to select this chapter.
    #[serde(default)]
    pub attractors: Attractors,
    /// The request that created this chapter.
    #[serde(default)]
    pub request: RequestData,
    /// Stored response; `None` while awaiting one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseData>,
    /// Remaining-uses state.
    #[serde(default)]
    pub mock_uses: MockUse,
    /// Always forward to the live backend.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_live: bool,
    /// Waiting for the next live response to be recorded.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub await_response: bool,
    /// Content hashes of requests already resolved to this chapter.
    #[serde(skip)]
    pub cached_calls: HashSet<String>,
    /// Chapter-level script variables.
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub scope: VarMap,
    /// Last modification time.
    #[serde(default = "Utc::now")]
    pub modified: DateTime<Utc>,
    /// Last time the chapter served a call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<DateTime<Utc>>,
    /// Script run against every response served from this chapter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<Sequence>,
}

impl Chapter {
    /// Creates a chapter for a freshly recorded request.
    ///
    /// Attractors are derived from the request and its content hash is
    /// seeded into the cache. Without a response the chapter awaits one.
    #[must_use]
    pub fn record(name: impl Into<String>, request: RequestData, response: Option<ResponseData>) -> Self {
        let mut cached_calls = HashSet::new();
        cached_calls.insert(request.content_hash());
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
            attractors: Attractors::from_request(&request),
            await_response: response.is_none(),
            request,
            response,
            mock_uses: MockUse::Always,
            always_live: false,
            cached_calls,
            scope: VarMap::new(),
            modified: Utc::now(),
            used: None,
            sequences: Vec::new(),
        }
    }

    /// Builder: set the use state.
    #[must_use]
    pub const fn with_uses(mut self, uses: MockUse) -> Self {
        self.mock_uses = uses;
        self
    }

    /// Builder: set the attractors.
    #[must_use]
    pub fn with_attractors(mut self, attractors: Attractors) -> Self {
        self.attractors = attractors;
        self
    }

    /// Builder: append a script sequence.
    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequences.push(sequence);
        self
    }

    /// Records a live response into an awaiting chapter.
    pub fn fill(&mut self, response: ResponseData) {
        self.response = Some(response);
        self.await_response = false;
        self.touch();
    }

    /// Bumps the modification time.
    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }
}
