//! Compiled P4 commands and their canonical printer.
//!
//! A [`Command`] is the structured form of one DSL line. Printing a valid
//! command with [`std::fmt::Display`] yields the canonical DSL text, which
//! the parser accepts back unchanged.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::scope::ScopeLevel;

/// Prefix marking a persisted command whose raw text is base64-encoded.
pub const LEGACY_PREFIX: &str = "b64:";

/// Condition prefix of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    /// No prefix: never aborts.
    #[default]
    None,
    /// `~`: records its result for the following conditional steps.
    Optional,
    /// `?`: the source must produce data.
    RequireTrue,
    /// `!`: the source must produce no data.
    RequireFalse,
}

impl Condition {
    const fn symbol(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Optional => "~",
            Self::RequireTrue => "?",
            Self::RequireFalse => "!",
        }
    }

    /// Returns `true` for `?` and `!`.
    #[must_use]
    pub const fn is_conditional(self) -> bool {
        matches!(self, Self::RequireTrue | Self::RequireFalse)
    }
}

/// Request or response side of an I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound request.
    Request,
    /// Outgoing response.
    Response,
}

/// Part of an HTTP message addressed by an I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    /// Headers.
    Head,
    /// Body text.
    Body,
}

/// Where a command reads its data from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `request:head`, `response:body[...]` and friends.
    Io {
        /// Request or response.
        direction: Direction,
        /// Head or body.
        part: Part,
        /// Header name for `head[name]`.
        name: Option<String>,
    },
    /// `var`, `^&var[name]` and friends.
    Var {
        /// Starting scope level.
        level: ScopeLevel,
        /// `^`: search enclosing levels too.
        search_up: bool,
        /// Variable name; `None` fans out over the whole level.
        name: Option<String>,
    },
    /// `use` or `use[chapter]`.
    Use {
        /// Other chapter's name; `None` means the current chapter.
        chapter: Option<String>,
    },
}

/// A `{...}` match pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// Pattern text without delimiters.
    pub text: String,
    /// Written as `{"..."}`.
    pub quoted: bool,
}

/// Variable-action suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suffix {
    /// `?`: `name?` = whether the source had data.
    Exists,
    /// `#`: `name#` = match count.
    Count,
    /// `@`: `name@` = raw result.
    Raw,
    /// `_#`: `name_0`..`name_k` = every spread item.
    SpreadAll,
    /// `_?`: `name_last` = last spread item.
    SpreadLast,
    /// `_N`: `name_N` = spread item N.
    SpreadIndex(usize),
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists => f.write_str("?"),
            Self::Count => f.write_str("#"),
            Self::Raw => f.write_str("@"),
            Self::SpreadAll => f.write_str("_#"),
            Self::SpreadLast => f.write_str("_?"),
            Self::SpreadIndex(n) => write!(f, "_{n}"),
        }
    }
}

/// What a command does with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `->{template}`: write the templated value back into the source.
    WriteBack {
        /// Template text without delimiters.
        template: String,
    },
    /// `->name`: store the result in a variable.
    Variable {
        /// Target level.
        level: ScopeLevel,
        /// Variable name.
        name: String,
        /// Extra keys to write, in written order.
        suffixes: Vec<Suffix>,
    },
}

/// One compiled DSL command.
///
/// An invalid command is a no-op: it has no source and keeps only its raw
/// text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Condition prefix.
    pub condition: Condition,
    /// Data source; `None` marks an invalid command.
    pub source: Option<Source>,
    /// Match pattern.
    pub pattern: Option<Pattern>,
    /// Action.
    pub action: Option<Action>,
    raw: String,
}

impl Command {
    /// Builds a valid command. The raw text is the printed form.
    #[must_use]
    pub fn new(
        condition: Condition,
        source: Source,
        pattern: Option<Pattern>,
        action: Option<Action>,
    ) -> Self {
        let mut cmd = Self {
            condition,
            source: Some(source),
            pattern,
            action,
            raw: String::new(),
        };
        cmd.raw = cmd.to_string();
        cmd
    }

    /// A no-op command preserving `raw`.
    #[must_use]
    pub fn noop(raw: impl Into<String>) -> Self {
        Self {
            condition: Condition::None,
            source: None,
            pattern: None,
            action: None,
            raw: raw.into(),
        }
    }

    /// Returns `true` unless this command is a no-op.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.source.is_some()
    }

    /// The text this command was parsed from.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Form stored in tape files: the printed command when valid, else
    /// [`LEGACY_PREFIX`] plus the base64 of the raw text.
    #[must_use]
    pub fn persisted(&self) -> String {
        if self.is_valid() {
            self.to_string()
        } else {
            format!("{LEGACY_PREFIX}{}", STANDARD.encode(self.raw.as_bytes()))
        }
    }

    /// Decodes a persisted command string.
    ///
    /// Legacy `b64:` entries are decoded before parsing. An undecodable
    /// entry becomes a no-op keeping the stored text.
    #[must_use]
    pub fn from_persisted(stored: &str) -> Self {
        let Some(encoded) = stored.strip_prefix(LEGACY_PREFIX) else {
            return super::parser::parse(stored);
        };
        match STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(text) => super::parser::parse(&text),
            None => Self::noop(stored),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(source) = &self.source else {
            return f.write_str(&self.raw);
        };
        f.write_str(self.condition.symbol())?;
        match source {
            Source::Io {
                direction,
                part,
                name,
            } => {
                let direction = match direction {
                    Direction::Request => "request",
                    Direction::Response => "response",
                };
                let part = match part {
                    Part::Head => "head",
                    Part::Body => "body",
                };
                write!(f, "{direction}:{part}")?;
                if let Some(name) = name {
                    write!(f, "[{name}]")?;
                }
            }
            Source::Var {
                level,
                search_up,
                name,
            } => {
                if *search_up {
                    f.write_str("^")?;
                }
                write!(f, "{}var", level.prefix())?;
                if let Some(name) = name {
                    write!(f, "[{name}]")?;
                }
            }
            Source::Use { chapter } => {
                f.write_str("use")?;
                if let Some(chapter) = chapter {
                    write!(f, "[{chapter}]")?;
                }
            }
        }
        if let Some(pattern) = &self.pattern {
            if pattern.quoted {
                write!(f, ":{{\"{}\"}}", pattern.text)?;
            } else {
                write!(f, ":{{{}}}", pattern.text)?;
            }
        }
        match &self.action {
            None => Ok(()),
            Some(Action::WriteBack { template }) => write!(f, "->{{{template}}}"),
            Some(Action::Variable {
                level,
                name,
                suffixes,
            }) => {
                write!(f, "->{}{name}", level.prefix())?;
                suffixes.iter().try_for_each(|s| write!(f, "{s}"))
            }
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.persisted())
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| Self::from_persisted(&s))
    }
}

/// An ordered, optionally named list of commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Commands, executed in order.
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Sequence {
    /// Parses a multi-line script, one command per non-blank line.
    ///
    /// Lines are trimmed; lines starting with `//` are comments.
    #[must_use]
    pub fn from_script(name: Option<String>, script: &str) -> Self {
        let commands = script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("//"))
            .map(super::parser::parse)
            .collect();
        Self { name, commands }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_canonical_form() {
        let cmd = Command::new(
            Condition::RequireTrue,
            Source::Io {
                direction: Direction::Response,
                part: Part::Body,
                name: None,
            },
            Some(Pattern {
                text: r"code: (\d+)".into(),
                quoted: true,
            }),
            Some(Action::Variable {
                level: ScopeLevel::Sequence,
                name: "code".into(),
                suffixes: vec![Suffix::Exists, Suffix::SpreadIndex(2)],
            }),
        );
        assert_eq!(cmd.to_string(), r#"?response:body:{"code: (\d+)"}->code?_2"#);
        assert_eq!(cmd.raw(), cmd.to_string());
    }

    #[test]
    fn invalid_command_persists_as_base64() {
        let cmd = Command::noop("request:head->{nope}");
        let stored = cmd.persisted();
        assert!(stored.starts_with(LEGACY_PREFIX));
        let restored = Command::from_persisted(&stored);
        assert!(!restored.is_valid());
        assert_eq!(restored.raw(), "request:head->{nope}");
    }

    #[test]
    fn legacy_entry_holding_valid_command_decodes() {
        let stored = format!("{LEGACY_PREFIX}{}", STANDARD.encode("var[x]->y"));
        let cmd = Command::from_persisted(&stored);
        assert!(cmd.is_valid());
        assert_eq!(cmd.to_string(), "var[x]->y");
    }

    #[test]
    fn undecodable_legacy_entry_is_noop() {
        let cmd = Command::from_persisted("b64:!!!");
        assert!(!cmd.is_valid());
        assert_eq!(cmd.raw(), "b64:!!!");
    }

    #[test]
    fn script_skips_blank_and_comment_lines() {
        let seq = Sequence::from_script(None, "\n  // setup\n  var[a]->b\n\nuse\n");
        assert_eq!(seq.commands.len(), 2);
        assert!(seq.commands.iter().all(Command::is_valid));
    }

    #[test]
    fn sequence_serde_uses_command_strings() {
        let seq = Sequence::from_script(Some("main".into()), "var[a]->b\nbogus");
        let json = serde_json::to_value(&seq).unwrap();
        assert_eq!(json["commands"][0], "var[a]->b");
        assert!(json["commands"][1].as_str().unwrap().starts_with(LEGACY_PREFIX));
        let back: Sequence = serde_json::from_value(json).unwrap();
        assert_eq!(back, seq);
    }
}
