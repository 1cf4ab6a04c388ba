//! Configuration loader.
//!
//! Pipeline:
//! 1. Size check and BOM strip
//! 2. Environment variable expansion on the raw text
//! 3. YAML parsing into [`TapedeckConfig`]
//! 4. Validation

use std::path::{Path, PathBuf};

use crate::config::schema::TapedeckConfig;
use crate::error::{ConfigError, Severity};

/// Default maximum configuration file size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Result of loading a configuration file.
#[derive(Debug)]
pub struct LoadResult {
    /// The loaded and validated configuration.
    pub config: TapedeckConfig,
    /// Warnings encountered during loading.
    pub warnings: Vec<LoadWarning>,
}

/// Warning during configuration loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    /// Warning message.
    pub message: String,
    /// Location where the warning occurred.
    pub location: Option<String>,
}

/// Loads YAML configuration files.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    max_config_size: usize,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            max_config_size: env_or("TAPEDECK_MAX_CONFIG_SIZE", MAX_CONFIG_SIZE),
        }
    }
}

impl ConfigLoader {
    /// Loader with the default size limit (overridable through
    /// `TAPEDECK_MAX_CONFIG_SIZE`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the size limit.
    #[must_use]
    pub const fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_config_size = bytes;
        self
    }

    /// Loads and validates `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file is missing or larger than the limit
    /// - A required environment variable is unset
    /// - YAML parsing fails
    /// - Validation reports an error
    pub fn load(&self, path: &Path) -> Result<LoadResult, ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|_| ConfigError::MissingFile {
            path: path.to_path_buf(),
        })?;
        let file_size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if file_size > self.max_config_size {
            return Err(ConfigError::InvalidValue {
                field: "file_size".to_string(),
                value: format!("{file_size} bytes"),
                expected: format!("at most {} bytes", self.max_config_size),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::MissingFile {
            path: path.to_path_buf(),
        })?;
        self.load_str(&raw, path)
    }

    /// Loads configuration text; `path` is used in messages only.
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn load_str(&self, raw: &str, path: &Path) -> Result<LoadResult, ConfigError> {
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);

        let mut env_sub = EnvSubstitution::new();
        let substituted = env_sub.substitute(raw, path)?;
        let mut warnings = env_sub.warnings;

        let config: TapedeckConfig = if substituted.trim().is_empty() {
            TapedeckConfig::default()
        } else {
            serde_yaml::from_str(&substituted).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                line: e.location().map(|l| l.line()),
                message: e.to_string(),
            })?
        };

        let (errors, rest): (Vec<_>, Vec<_>) = config
            .validate()
            .into_iter()
            .partition(|issue| issue.severity == Severity::Error);
        if !errors.is_empty() {
            return Err(ConfigError::ValidationError {
                path: path.display().to_string(),
                errors,
            });
        }
        warnings.extend(rest.into_iter().map(|issue| LoadWarning {
            message: issue.message,
            location: Some(issue.path),
        }));

        Ok(LoadResult { config, warnings })
    }
}

/// Pre-parse environment variable substitution.
///
/// Runs on the raw text so substituted values still go through YAML type
/// inference.
struct EnvSubstitution {
    warnings: Vec<LoadWarning>,
}

impl EnvSubstitution {
    const fn new() -> Self {
        Self { warnings: Vec::new() }
    }

    /// Supports:
    /// - `${VAR}`: the value, or empty with a warning when unset
    /// - `${VAR:-default}`: `default` when unset
    /// - `${VAR:?message}`: an error when unset
    /// - `$$`: a literal `$`
    fn substitute(&mut self, raw: &str, source_path: &Path) -> Result<String, ConfigError> {
        let mut result = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                result.push(c);
                continue;
            }
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next();
                    let spec = Self::parse_var_spec(&mut chars, source_path)?;
                    match std::env::var(&spec.name) {
                        Ok(value) => result.push_str(&value),
                        Err(_) => match spec.fallback {
                            Fallback::Default(value) => result.push_str(&value),
                            Fallback::Required(message) => {
                                return Err(ConfigError::EnvVarNotSet {
                                    var: spec.name,
                                    location: message,
                                });
                            }
                            Fallback::Empty => self.warnings.push(LoadWarning {
                                message: format!(
                                    "Environment variable '{}' is not set, using empty string",
                                    spec.name
                                ),
                                location: Some(source_path.display().to_string()),
                            }),
                        },
                    }
                }
                _ => result.push(c),
            }
        }
        Ok(result)
    }

    fn parse_var_spec(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        source_path: &Path,
    ) -> Result<VarSpec, ConfigError> {
        let mut name = String::new();
        while let Some(c) = chars.next() {
            match c {
                '}' => {
                    return Ok(VarSpec {
                        name,
                        fallback: Fallback::Empty,
                    });
                }
                ':' if chars.peek() == Some(&'-') => {
                    chars.next();
                    let value = Self::read_until_close(chars, source_path)?;
                    return Ok(VarSpec {
                        name,
                        fallback: Fallback::Default(value),
                    });
                }
                ':' if chars.peek() == Some(&'?') => {
                    chars.next();
                    let message = Self::read_until_close(chars, source_path)?;
                    return Ok(VarSpec {
                        name,
                        fallback: Fallback::Required(message),
                    });
                }
                _ => name.push(c),
            }
        }
        Err(unclosed(source_path, &name))
    }

    /// Reads up to the matching `}`, keeping nested braces.
    fn read_until_close(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        source_path: &Path,
    ) -> Result<String, ConfigError> {
        let mut value = String::new();
        let mut depth = 1;
        for c in chars.by_ref() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(value);
                    }
                }
                _ => {}
            }
            value.push(c);
        }
        Err(unclosed(source_path, &value))
    }
}

struct VarSpec {
    name: String,
    fallback: Fallback,
}

enum Fallback {
    Empty,
    Default(String),
    Required(String),
}

fn unclosed(path: &Path, fragment: &str) -> ConfigError {
    ConfigError::ParseError {
        path: PathBuf::from(path),
        line: None,
        message: format!("Unclosed environment variable reference: ${{{fragment}"),
    }
}

/// Parses an environment variable, or returns `default`.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn substitute(text: &str) -> Result<String, ConfigError> {
        EnvSubstitution::new().substitute(text, Path::new("test.yaml"))
    }

    #[test]
    fn env_substitution_simple() {
        let result = substitute("path: ${PATH}").unwrap();
        assert!(!result.contains("${PATH}"));
        assert!(result.len() > "path: ".len());
    }

    #[test]
    fn env_substitution_default() {
        let result = substitute("dir: ${TAPEDECK_TEST_UNSET_XYZ123:-./fixtures}").unwrap();
        assert_eq!(result, "dir: ./fixtures");
    }

    #[test]
    fn env_substitution_nested_default_braces() {
        let result = substitute("v: ${TAPEDECK_TEST_UNSET_XYZ123:-{a}}").unwrap();
        assert_eq!(result, "v: {a}");
    }

    #[test]
    fn env_substitution_required_missing() {
        match substitute("v: ${TAPEDECK_TEST_REQUIRED_XYZ123:?must be set}") {
            Err(ConfigError::EnvVarNotSet { var, location }) => {
                assert_eq!(var, "TAPEDECK_TEST_REQUIRED_XYZ123");
                assert_eq!(location, "must be set");
            }
            other => panic!("expected EnvVarNotSet, got {other:?}"),
        }
    }

    #[test]
    fn env_substitution_escaped_dollar() {
        assert_eq!(substitute("price: $$100").unwrap(), "price: $100");
        assert_eq!(substitute("lone $ sign").unwrap(), "lone $ sign");
    }

    #[test]
    fn env_substitution_missing_warns() {
        let mut sub = EnvSubstitution::new();
        let result = sub
            .substitute("v: ${TAPEDECK_TEST_WARN_XYZ123}", Path::new("test.yaml"))
            .unwrap();
        assert_eq!(result, "v: ");
        assert_eq!(sub.warnings.len(), 1);
        assert!(sub.warnings[0].message.contains("TAPEDECK_TEST_WARN_XYZ123"));
    }

    #[test]
    fn unclosed_reference_is_an_error() {
        assert!(matches!(substitute("v: ${OOPS"), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn loads_file_with_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapedeck.yaml");
        std::fs::write(&path, "\u{feff}server:\n  bind: 0.0.0.0:9090\nlive:\n  timeout: 5s\n").unwrap();
        let result = ConfigLoader::new().load(&path).unwrap();
        assert_eq!(result.config.server.bind, "0.0.0.0:9090");
        assert_eq!(result.config.live.timeout(), std::time::Duration::from_secs(5));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let result = ConfigLoader::new().load_str("", Path::new("empty.yaml")).unwrap();
        assert_eq!(result.config, TapedeckConfig::default());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.yaml");
        std::fs::write(&path, "server: {}\n".repeat(10)).unwrap();
        let err = ConfigLoader::new().with_max_size(8).load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "file_size"));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ConfigLoader::new().load(Path::new("/nonexistent/tapedeck.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile { .. }));
    }

    #[test]
    fn validation_errors_fail_the_load() {
        let err = ConfigLoader::new()
            .load_str("server:\n  bind: nowhere\n", Path::new("bad.yaml"))
            .unwrap_err();
        match err {
            ConfigError::ValidationError { errors, .. } => assert_eq!(errors[0].path, "server.bind"),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_warnings_are_returned() {
        let result = ConfigLoader::new()
            .load_str("live:\n  timeout: 2h\n", Path::new("slow.yaml"))
            .unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].location.as_deref(), Some("live.timeout"));
    }

    #[test]
    fn yaml_errors_carry_a_line() {
        let err = ConfigLoader::new()
            .load_str("server:\n  bind: [unclosed\n", Path::new("broken.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
