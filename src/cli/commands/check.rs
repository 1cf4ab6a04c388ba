//! `check`: validates P4 scripts and the scripts stored in tape files.
//!
//! A `.json` file is read as a tape and every command of every chapter
//! sequence is checked. Any other file is a P4 script, one command per
//! line; blank lines and `//` comments are skipped.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::cli::args::{CheckArgs, OutputFormat};
use crate::error::{ConfigError, Severity, TapedeckError, ValidationIssue};
use crate::p4::{Command, parse};
use crate::tape::persist::read_tape;

/// What is wrong with one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    /// Does not parse; runs as a no-op.
    Invalid,
    /// Parses, but prints back differently.
    Drift,
}

/// One flagged command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandIssue {
    /// `line N` for scripts, `chapter / sequence #N` for tapes.
    pub location: String,
    /// Issue kind.
    pub kind: IssueKind,
    /// Command text as written.
    pub text: String,
    /// Canonical form, for drift.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printed: Option<String>,
}

/// Result of checking one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    /// File path as given.
    pub file: String,
    /// Number of commands checked.
    pub commands: usize,
    /// Flagged commands.
    pub issues: Vec<CommandIssue>,
}

impl FileReport {
    fn new(path: &Path) -> Self {
        Self {
            file: path.display().to_string(),
            commands: 0,
            issues: Vec::new(),
        }
    }

    fn inspect(&mut self, location: String, cmd: &Command) {
        self.commands += 1;
        let text = cmd.raw().to_string();
        if !cmd.is_valid() {
            self.issues.push(CommandIssue {
                location,
                kind: IssueKind::Invalid,
                text,
                printed: None,
            });
            return;
        }
        let printed = cmd.to_string();
        if printed != text {
            self.issues.push(CommandIssue {
                location,
                kind: IssueKind::Drift,
                text,
                printed: Some(printed),
            });
        }
    }

    /// Issues that fail the check. Drift only counts when `strict`.
    fn failures(&self, strict: bool) -> Vec<ValidationIssue> {
        self.issues
            .iter()
            .filter_map(|issue| {
                let (message, severity) = match issue.kind {
                    IssueKind::Invalid => (format!("invalid command: {}", issue.text), Severity::Error),
                    IssueKind::Drift if strict => (
                        format!(
                            "command prints as {}",
                            issue.printed.as_deref().unwrap_or_default()
                        ),
                        Severity::Error,
                    ),
                    IssueKind::Drift => return None,
                };
                Some(ValidationIssue {
                    path: issue.location.clone(),
                    message,
                    severity,
                })
            })
            .collect()
    }
}

/// Checks the commands of a P4 script.
#[must_use]
pub fn check_script(path: &Path, content: &str) -> FileReport {
    let mut report = FileReport::new(path);
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        report.inspect(format!("line {}", index + 1), &parse(line));
    }
    report
}

/// Checks every sequence stored in a tape file.
///
/// # Errors
///
/// Returns a store error if the tape cannot be read.
pub fn check_tape(path: &Path) -> Result<FileReport, TapedeckError> {
    let tape = read_tape(path)?;
    let mut report = FileReport::new(path);
    for chapter in &tape.chapters {
        for (seq_index, sequence) in chapter.sequences.iter().enumerate() {
            let seq_name = sequence
                .name
                .clone()
                .unwrap_or_else(|| format!("sequence {}", seq_index + 1));
            for (index, cmd) in sequence.commands.iter().enumerate() {
                report.inspect(format!("{} / {seq_name} #{}", chapter.name, index + 1), cmd);
            }
        }
    }
    Ok(report)
}

fn check_file(path: &Path) -> Result<FileReport, TapedeckError> {
    if !path.exists() {
        return Err(TapedeckError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        )));
    }
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
        check_tape(path)
    } else {
        let content = std::fs::read_to_string(path)?;
        Ok(check_script(path, &content))
    }
}

fn render_human(reports: &[FileReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let _ = writeln!(
            out,
            "{}: {} commands, {} issues",
            report.file,
            report.commands,
            report.issues.len()
        );
        for issue in &report.issues {
            let _ = match (issue.kind, &issue.printed) {
                (IssueKind::Drift, Some(printed)) => {
                    writeln!(out, "  {}: drift: {} -> {printed}", issue.location, issue.text)
                }
                _ => writeln!(out, "  {}: invalid: {}", issue.location, issue.text),
            };
        }
    }
    out
}

/// Runs the check and prints a report.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] for the first file with failing
/// commands, or an I/O or store error if a file cannot be read.
pub fn run(args: &CheckArgs) -> Result<(), TapedeckError> {
    let mut reports = Vec::with_capacity(args.files.len());
    for path in &args.files {
        tracing::info!(file = %path.display(), "checking");
        reports.push(check_file(path)?);
    }

    match args.format {
        OutputFormat::Human => print!("{}", render_human(&reports)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
    }

    for report in &reports {
        let errors = report.failures(args.strict);
        if !errors.is_empty() {
            return Err(ConfigError::ValidationError {
                path: report.file.clone(),
                errors,
            }
            .into());
        }
    }
    Ok(())
}
