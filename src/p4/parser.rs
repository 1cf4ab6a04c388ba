//! Recursive-descent parser for P4 command lines.
//!
//! Parsing never fails: anything outside the grammar becomes a no-op
//! [`Command`] that keeps its raw text.

use std::collections::HashSet;

use tracing::debug;

use super::command::{Action, Command, Condition, Direction, Part, Pattern, Source, Suffix};
use super::scope::ScopeLevel;

/// Parses one command line.
#[must_use]
pub fn parse(line: &str) -> Command {
    let Some(cmd) = Cursor::new(line).command() else {
        debug!(line, "invalid command, treating as no-op");
        return Command::noop(line);
    };
    let printed = cmd.to_string();
    if printed != line {
        debug!(line, printed = %printed, "command round-trip drift");
    }
    cmd.with_raw(line)
}

/// Returns `true` if `line` parses to a valid command.
#[must_use]
pub fn is_valid(line: &str) -> bool {
    Cursor::new(line).command().is_some()
}

/// Byte cursor over one line.
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn command(mut self) -> Option<Command> {
        let condition = self.condition();
        let source = self.source()?;
        let pattern = if self.eat(":") {
            Some(self.pattern()?)
        } else {
            None
        };
        let action = if self.eat("->") {
            Some(self.action()?)
        } else {
            None
        };
        if !self.at_end() {
            return None;
        }
        if matches!(action, Some(Action::WriteBack { .. }))
            && !is_addressable(&source, pattern.as_ref())
        {
            return None;
        }
        Some(Command::new(condition, source, pattern, action))
    }

    fn condition(&mut self) -> Condition {
        if self.eat("~") {
            Condition::Optional
        } else if self.eat("?") {
            Condition::RequireTrue
        } else if self.eat("!") {
            Condition::RequireFalse
        } else {
            Condition::None
        }
    }

    fn source(&mut self) -> Option<Source> {
        if self.eat("request:") {
            return self.io(Direction::Request);
        }
        if self.eat("response:") {
            return self.io(Direction::Response);
        }
        if self.eat("use") {
            let chapter = self.opt_bracket()?;
            return Some(Source::Use { chapter });
        }
        let search_up = self.eat("^");
        let level = self.level_prefix();
        if !self.eat("var") {
            return None;
        }
        let name = self.opt_bracket()?;
        Some(Source::Var {
            level,
            search_up,
            name,
        })
    }

    fn io(&mut self, direction: Direction) -> Option<Source> {
        let part = if self.eat("head") {
            Part::Head
        } else if self.eat("body") {
            Part::Body
        } else {
            return None;
        };
        let name = match part {
            Part::Head => self.opt_bracket()?,
            Part::Body if self.peek() == Some('[') => return None,
            Part::Body => None,
        };
        Some(Source::Io {
            direction,
            part,
            name,
        })
    }

    fn level_prefix(&mut self) -> ScopeLevel {
        match self.peek().and_then(ScopeLevel::from_prefix) {
            Some(level) => {
                self.pos += 1;
                level
            }
            None => ScopeLevel::Sequence,
        }
    }

    /// `[name]` if present. `None` means a malformed bracket.
    fn opt_bracket(&mut self) -> Option<Option<String>> {
        if !self.eat("[") {
            return Some(None);
        }
        let rest = self.rest();
        let end = rest.find(']')?;
        if end == 0 {
            return None;
        }
        self.pos += end + 1;
        Some(Some(rest[..end].to_string()))
    }

    fn pattern(&mut self) -> Option<Pattern> {
        if self.rest().starts_with("{\"") {
            let body = &self.rest()[2..];
            if let Some(end) = body.find("\"}") {
                self.pos += 2 + end + 2;
                return Some(Pattern {
                    text: body[..end].to_string(),
                    quoted: true,
                });
            }
        }
        let text = self.balanced()?;
        Some(Pattern {
            text: text.to_string(),
            quoted: false,
        })
    }

    /// `{...}` with nested braces; a backslash escapes the next character.
    fn balanced(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        if chars.next()?.1 != '{' {
            return None;
        }
        let mut depth = 1usize;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += i + 1;
                        return Some(&rest[1..i]);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn action(&mut self) -> Option<Action> {
        if self.peek() == Some('{') {
            let template = self.balanced()?.to_string();
            return Some(Action::WriteBack { template });
        }
        let level = self.level_prefix();
        let name = self.action_name()?.to_string();
        let suffixes = self.suffixes()?;
        Some(Action::Variable {
            level,
            name,
            suffixes,
        })
    }

    /// Variable name; a `_` that starts a suffix ends the name.
    fn action_name(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|&(i, c)| !is_name_char(c) || (c == '_' && starts_suffix(&rest[i..])))
            .map_or(rest.len(), |(i, _)| i);
        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }

    fn suffixes(&mut self) -> Option<Vec<Suffix>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while !self.at_end() {
            let suffix = if self.eat("_#") {
                Suffix::SpreadAll
            } else if self.eat("_?") {
                Suffix::SpreadLast
            } else if self.eat("_") {
                Suffix::SpreadIndex(self.index()?)
            } else if self.eat("?") {
                Suffix::Exists
            } else if self.eat("#") {
                Suffix::Count
            } else if self.eat("@") {
                Suffix::Raw
            } else {
                return None;
            };
            if !seen.insert(suffix) {
                return None;
            }
            out.push(suffix);
        }
        Some(out)
    }

    /// Decimal index without leading zeros.
    fn index(&mut self) -> Option<usize> {
        let rest = self.rest();
        let len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let digits = &rest[..len];
        if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
            return None;
        }
        let n = digits.parse().ok()?;
        self.pos += len;
        Some(n)
    }
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// `s` starts with `_`. Decides whether it opens a suffix rather than
/// continuing a variable name.
fn starts_suffix(s: &str) -> bool {
    let tail = &s[1..];
    if tail.starts_with('#') || tail.starts_with('?') {
        return true;
    }
    let digits = tail.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0
        && tail[digits..]
            .chars()
            .next()
            .is_none_or(|c| matches!(c, '?' | '#' | '@' | '_'))
}

fn is_addressable(source: &Source, pattern: Option<&Pattern>) -> bool {
    match source {
        Source::Io {
            direction: Direction::Request,
            ..
        } => false,
        Source::Io {
            part: Part::Head,
            name,
            ..
        }
        | Source::Var { name, .. } => name.is_some() || pattern.is_some(),
        Source::Io {
            part: Part::Body, ..
        } => true,
        Source::Use { chapter } => chapter.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VALID: &[&str] = &[
        "request:head",
        "request:head[Content-Type]",
        "response:body",
        r#"?response:body:{"code: (\d+)"}->code"#,
        r"~request:body:{id=(\d+)}->&id?#",
        "!response:head[X-Trace]",
        r"response:head[Location]:{^(https?)://}->{https}",
        "response:head:{secret}->{redacted}",
        "response:body->{@{body}}",
        "var[code]->{@{code}}",
        "^%var[token]->tok@",
        "&var:{^a}->%list_#",
        "use",
        "use:{>=2,5..7}->hits?",
        "use[login]->{0}",
        "response:body:{a{2}b}->x_3_?",
        "request:head[Accept]->accept_0",
    ];

    #[test]
    fn valid_commands_round_trip() {
        for line in VALID {
            let cmd = parse(line);
            assert!(cmd.is_valid(), "{line} should be valid");
            assert_eq!(cmd.to_string(), *line);
            assert_eq!(cmd.raw(), *line);
        }
    }

    #[test]
    fn invalid_commands_become_noops() {
        for line in [
            "",
            "   ",
            "response",
            "response:tail",
            "request:body->{x}",
            "request:head[Accept]->{x}",
            "response:head->{x}",
            "var->{x}",
            "use->{3}",
            "response:body[x]",
            "response:body:{unclosed",
            "response:body->",
            "var[]",
            "var[x]->a??",
            "var[x]->a_01",
            "var[x]->a!",
            "response:body trailing",
        ] {
            let cmd = parse(line);
            assert!(!cmd.is_valid(), "{line:?} should be invalid");
            assert_eq!(cmd.raw(), line);
            assert_eq!(cmd.condition, Condition::None);
            assert!(cmd.action.is_none());
        }
    }

    #[test]
    fn scenario_command_fields() {
        let cmd = parse(r#"?response:body:{"code: (\d+)"}->code"#);
        assert_eq!(cmd.condition, Condition::RequireTrue);
        assert_eq!(
            cmd.source,
            Some(Source::Io {
                direction: Direction::Response,
                part: Part::Body,
                name: None
            })
        );
        assert_eq!(
            cmd.pattern,
            Some(Pattern {
                text: r"code: (\d+)".into(),
                quoted: true
            })
        );
        assert_eq!(
            cmd.action,
            Some(Action::Variable {
                level: ScopeLevel::Sequence,
                name: "code".into(),
                suffixes: vec![]
            })
        );
    }

    #[test]
    fn underscore_digits_split_name_and_suffix() {
        let cmd = parse("var[x]->user_id_2#");
        assert_eq!(
            cmd.action,
            Some(Action::Variable {
                level: ScopeLevel::Sequence,
                name: "user_id".into(),
                suffixes: vec![Suffix::SpreadIndex(2), Suffix::Count]
            })
        );
    }

    #[test]
    fn escaped_brace_does_not_close_pattern() {
        let cmd = parse(r"response:body:{\}x}->v");
        assert!(cmd.is_valid());
        assert_eq!(cmd.pattern.unwrap().text, r"\}x");
    }

    #[test]
    fn search_up_var_source() {
        let cmd = parse("^&var[k]");
        assert_eq!(
            cmd.source,
            Some(Source::Var {
                level: ScopeLevel::Chapter,
                search_up: true,
                name: Some("k".into())
            })
        );
    }

    fn name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,6}"
    }

    fn suffixes() -> impl Strategy<Value = String> {
        proptest::sample::subsequence(vec!["?", "#", "@", "_#", "_?", "_4"], 0..4)
            .prop_shuffle()
            .prop_map(|s| s.concat())
    }

    fn source() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("response:body".to_string()),
            Just("request:body".to_string()),
            name().prop_map(|n| format!("response:head[{n}]")),
            name().prop_map(|n| format!("request:head[{n}]")),
            (any::<bool>(), prop_oneof![Just(""), Just("&"), Just("%")], name())
                .prop_map(|(up, lvl, n)| format!("{}{lvl}var[{n}]", if up { "^" } else { "" })),
            name().prop_map(|n| format!("use[{n}]")),
            Just("use".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn generated_commands_round_trip(
            cond in prop_oneof![Just(""), Just("~"), Just("?"), Just("!")],
            src in source(),
            pat in proptest::option::of(prop_oneof![
                "[a-z0-9 ]{0,8}".prop_map(|p| format!(":{{\"{p}\"}}")),
                "[a-z0-9()+]{1,8}".prop_map(|p| format!(":{{{p}}}")),
            ]),
            var in proptest::option::of((prop_oneof![Just(""), Just("&"), Just("%")], name(), suffixes())
                .prop_map(|(lvl, n, s)| format!("->{lvl}{n}{s}"))),
        ) {
            let line = format!("{cond}{src}{}{}", pat.unwrap_or_default(), var.unwrap_or_default());
            let cmd = parse(&line);
            prop_assert!(cmd.is_valid(), "{} should be valid", line);
            prop_assert_eq!(cmd.to_string(), line);
        }

        #[test]
        fn arbitrary_input_never_panics(line in ".{0,64}") {
            let cmd = parse(&line);
            prop_assert_eq!(cmd.raw(), line.as_str());
        }
    }
}
