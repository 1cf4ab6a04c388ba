//! Configuration schema.
//!
//! Every section and field is optional in the file; missing values take
//! the defaults below.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Severity, ValidationIssue};

/// Largest accepted `server.max_body_size` (1 GiB).
pub const MAX_BODY_SIZE_LIMIT: usize = 1024 * 1024 * 1024;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TapedeckConfig {
    /// Listener settings.
    pub server: ServerSection,
    /// Tape storage settings.
    pub tapes: TapesConfig,
    /// Live backend settings.
    pub live: LiveConfig,
}

/// `server:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Listen address.
    pub bind: String,
    /// Largest accepted request body in bytes.
    pub max_body_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// `tapes:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TapesConfig {
    /// Directory holding one JSON file per tape.
    pub dir: PathBuf,
    /// Never record, create or save tapes.
    pub read_only: bool,
}

impl Default for TapesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tapes"),
            read_only: false,
        }
    }
}

/// `live:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveConfig {
    /// Per-call timeout, as a humantime string (`30s`, `2m`).
    pub timeout: String,
    /// `User-Agent` sent to backends when the caller set none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            timeout: "30s".to_string(),
            user_agent: None,
        }
    }
}

impl LiveConfig {
    /// Parsed timeout, falling back to 30 seconds when unparsable.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(30))
    }
}

impl TapedeckConfig {
    /// Checks field values that serde cannot.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut push = |path: &str, message: String, severity: Severity| {
            issues.push(ValidationIssue {
                path: path.to_string(),
                message,
                severity,
            });
        };

        if self.server.bind.parse::<SocketAddr>().is_err() {
            push(
                "server.bind",
                format!("'{}' is not a socket address", self.server.bind),
                Severity::Error,
            );
        }
        if self.server.max_body_size == 0 {
            push("server.max_body_size", "must be greater than zero".to_string(), Severity::Error);
        } else if self.server.max_body_size > MAX_BODY_SIZE_LIMIT {
            push(
                "server.max_body_size",
                format!("must be at most {MAX_BODY_SIZE_LIMIT} bytes"),
                Severity::Error,
            );
        }
        match humantime::parse_duration(&self.live.timeout) {
            Err(e) => push("live.timeout", format!("invalid duration: {e}"), Severity::Error),
            Ok(d) if d.is_zero() => push("live.timeout", "must be greater than zero".to_string(), Severity::Error),
            Ok(d) if d > Duration::from_secs(600) => {
                push("live.timeout", "longer than 10 minutes".to_string(), Severity::Warning);
            }
            Ok(_) => {}
        }
        if self.tapes.dir.as_os_str().is_empty() {
            push("tapes.dir", "must not be empty".to_string(), Severity::Error);
        }
        issues
    }
}
