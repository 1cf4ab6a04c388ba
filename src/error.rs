//! Error types for `Tapedeck`
//!
//! One top-level error aggregates the domain errors and maps each of them
//! to a process exit code. Matching ambiguity and DSL parse failures are not
//! errors at all; they surface as values (`MatchOutcome::Conflict`, no-op
//! commands).

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `Tapedeck` CLI operations.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// General error
    pub const ERROR: i32 = 1;

    /// Configuration error (invalid YAML, validation failure)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, permission denied)
    pub const IO_ERROR: i32 = 3;

    /// Tape store error (unreadable tape, bad tape JSON)
    pub const STORE_ERROR: i32 = 4;

    /// Live call error surfaced outside a request (e.g. bad client setup)
    pub const LIVE_ERROR: i32 = 5;

    /// Usage error (invalid arguments, missing required options)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `Tapedeck` operations.
#[derive(Debug, Error)]
pub enum TapedeckError {
    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Tape store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Live upstream call error
    #[error(transparent)]
    Live(#[from] LiveCallError),

    /// Invalid command-line usage
    #[error("usage error: {0}")]
    Usage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TapedeckError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Yaml(_) => ExitCode::CONFIG_ERROR,
            Self::Store(_) | Self::Json(_) => ExitCode::STORE_ERROR,
            Self::Live(_) => ExitCode::LIVE_ERROR,
            Self::Usage(_) => ExitCode::USAGE_ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed
    #[error("parse error in {path}: {message}")]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Configuration validation failed
    #[error("validation failed for {path}")]
    ValidationError {
        /// Path to the configuration file
        path: String,
        /// List of validation issues found
        errors: Vec<ValidationIssue>,
    },

    /// Referenced configuration file not found
    #[error("file not found: {path}")]
    MissingFile {
        /// Path to the missing file
        path: PathBuf,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// Environment variable referenced in configuration is not set
    #[error("environment variable '{var}' not set (referenced at {location})")]
    EnvVarNotSet {
        /// Name of the environment variable
        var: String,
        /// Location in the configuration where it was referenced
        location: String,
    },
}

// ============================================================================
// Validation Types
// ============================================================================

/// A single validation issue found during configuration validation.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the problematic field (e.g., "live.timeout")
    pub path: String,
    /// Description of the validation issue
    pub message: String,
    /// Severity level of the issue
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Error - validation failure that prevents configuration from being used
    Error,
    /// Warning - potential issue that does not prevent configuration loading
    Warning,
}

// ============================================================================
// Store Errors
// ============================================================================

/// Tape catalog and tape file errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Tape file could not be read or written
    #[error("tape file {path}: {source}")]
    Io {
        /// Path of the tape file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Tape file contents are not a valid tape
    #[error("malformed tape {path}: {message}")]
    Malformed {
        /// Path of the tape file
        path: PathBuf,
        /// Decoder message
        message: String,
    },

    /// A tape with this name already exists
    #[error("tape already exists: {0}")]
    DuplicateTape(String),

    /// No tape with this name exists
    #[error("tape not found: {0}")]
    TapeNotFound(String),

    /// Tape has no backing directory or file to save into
    #[error("tape '{0}' has no backing file")]
    Unbacked(String),
}

// ============================================================================
// Live Call Errors
// ============================================================================

/// Errors raised while proxying a call to a tape's live backend.
///
/// These never propagate past the replay engine: each variant maps to a
/// synthetic HTTP status via [`LiveCallError::status_code`].
#[derive(Debug, Error)]
pub enum LiveCallError {
    /// Tape has no routing URL, so no call could be attempted
    #[error("tape has no routing URL")]
    NoRoute,

    /// Routing URL plus request path did not form a valid URL
    #[error("invalid upstream URL '{url}': {message}")]
    InvalidUrl {
        /// The URL that failed to parse
        url: String,
        /// Parser message
        message: String,
    },

    /// Network-level failure talking to the upstream
    #[error("upstream request failed: {0}")]
    Network(String),

    /// Upstream did not answer within the configured timeout
    #[error("upstream timed out")]
    Timeout,

    /// Upstream response body is larger than the accepted limit
    #[error("upstream response body exceeds {limit} byte limit")]
    BodyTooLarge {
        /// Limit in bytes
        limit: usize,
    },
}

impl LiveCallError {
    /// HTTP status code returned to the caller for this failure.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NoRoute => 503,
            Self::InvalidUrl { .. } | Self::Network(_) | Self::Timeout | Self::BodyTooLarge { .. } => 502,
        }
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for `Tapedeck` operations.
pub type Result<T> = std::result::Result<T, TapedeckError>;

// ============================================================================
// Tests
// ============================================================================
