//! The P4 command interpreter.
//!
//! [`P4Action`] executes compiled [`Command`]s against one request/response
//! pair. Each command resolves its source into a [`P4Result`], checks its
//! condition, then writes a variable or writes back into the source.

use std::ops::Range;

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::command::{Action, Command, Condition, Direction, Part, Pattern, Sequence, Source, Suffix};
use super::range::UseRange;
use super::scope::{ScopeLevel, Scopes, VarMap};
use super::template::{TemplateRef, de_template};
use crate::model::{MockUse, RequestData, ResponseData};

/// Read/write access to chapter use counters from a script.
pub trait UseStateAccess {
    /// Use state of `chapter`, or of the running chapter when `None`.
    fn uses(&self, chapter: Option<&str>) -> Option<MockUse>;

    /// Sets the use state of the named chapter. Returns `false` if no such
    /// chapter exists.
    fn set_uses(&mut self, chapter: &str, uses: MockUse) -> bool;
}

/// Resolved result of one command's source and pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct P4Result {
    /// At least one item (or match) was produced.
    pub passed: bool,
    /// Primary value: first item, or the first match's value.
    pub value: Option<String>,
    /// Raw result: the whole first match, the first item, or the range
    /// check outcome for `use` patterns.
    pub raw: Option<String>,
    /// Every match value (or item) in order.
    pub spread: Vec<String>,
    /// Length of the spread.
    pub count: usize,
}

/// Outcome of one sequence run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceReport {
    /// Commands whose condition held.
    pub executed: usize,
    /// Commands skipped (no-ops, or conditionals after a failed `~`).
    pub skipped: usize,
    /// A `?` / `!` check failed and stopped the sequence.
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    ResponseHeaderValue(usize),
    ResponseHeaderLine(usize),
    ResponseBody,
    Var(ScopeLevel, String),
    ReadOnly,
}

#[derive(Debug, Clone)]
struct Item {
    text: String,
    slot: Slot,
}

#[derive(Debug, Clone)]
struct Hit {
    item: usize,
    target: Range<usize>,
    groups: Vec<Option<String>>,
}

#[derive(Debug, Default)]
struct Resolution {
    result: P4Result,
    items: Vec<Item>,
    hits: Vec<Hit>,
}

/// Interpreter bound to one call.
pub struct P4Action<'a> {
    request: &'a RequestData,
    response: &'a mut ResponseData,
    scopes: Scopes<'a>,
    uses: &'a mut dyn UseStateAccess,
}

impl<'a> P4Action<'a> {
    /// Creates an interpreter over every collaborator it touches.
    pub fn new(
        request: &'a RequestData,
        response: &'a mut ResponseData,
        chapter_scope: &'a mut VarMap,
        bounds_scope: &'a mut VarMap,
        uses: &'a mut dyn UseStateAccess,
    ) -> Self {
        Self {
            request,
            response,
            scopes: Scopes::new(chapter_scope, bounds_scope),
            uses,
        }
    }

    /// Current scopes, including the last sequence's variables.
    #[must_use]
    pub const fn scopes(&self) -> &Scopes<'a> {
        &self.scopes
    }

    /// Runs every sequence in order, each with a fresh sequence scope.
    pub fn run(&mut self, sequences: &[Sequence]) -> Vec<SequenceReport> {
        sequences
            .iter()
            .map(|seq| {
                let report = self.run_sequence(&seq.commands);
                if report.aborted {
                    debug!(sequence = seq.name.as_deref().unwrap_or(""), "sequence aborted");
                }
                report
            })
            .collect()
    }

    /// Runs one command list with a fresh sequence scope.
    pub fn run_sequence(&mut self, commands: &[Command]) -> SequenceReport {
        self.scopes.reset_sequence();
        let mut report = SequenceReport::default();
        let mut optional_failed = false;

        for cmd in commands {
            let Some(source) = &cmd.source else {
                report.skipped += 1;
                continue;
            };
            if cmd.condition.is_conditional() && optional_failed {
                report.skipped += 1;
                continue;
            }

            let resolution = self.resolve(source, cmd.pattern.as_ref());
            let passed = resolution.result.passed;
            match cmd.condition {
                Condition::None => optional_failed = false,
                Condition::Optional => optional_failed = !passed,
                Condition::RequireTrue | Condition::RequireFalse => {
                    if passed != (cmd.condition == Condition::RequireTrue) {
                        debug!(command = %cmd, "condition failed");
                        report.aborted = true;
                        break;
                    }
                }
            }

            match &cmd.action {
                Some(Action::Variable {
                    level,
                    name,
                    suffixes,
                }) => self.write_variable(*level, name, suffixes, &resolution.result),
                Some(Action::WriteBack { template }) => {
                    self.write_back(source, cmd.pattern.is_some(), template, &resolution);
                }
                None => {}
            }
            report.executed += 1;
        }
        report
    }

    fn resolve(&self, source: &Source, pattern: Option<&Pattern>) -> Resolution {
        if let Source::Use { chapter } = source {
            return self.resolve_use(chapter.as_deref(), pattern);
        }
        let items = self.items(source);
        match pattern {
            None => {
                let spread: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
                let first = spread.first().cloned();
                Resolution {
                    result: P4Result {
                        passed: !spread.is_empty(),
                        value: first.clone(),
                        raw: first,
                        count: spread.len(),
                        spread,
                    },
                    items,
                    hits: Vec::new(),
                }
            }
            Some(pattern) => {
                let Some(re) = compile(&pattern.text) else {
                    return Resolution {
                        items,
                        ..Resolution::default()
                    };
                };
                let mut hits = Vec::new();
                let mut spread = Vec::new();
                let mut raw = None;
                for (index, item) in items.iter().enumerate() {
                    for caps in re.captures_iter(&item.text) {
                        let Some(whole) = caps.get(0) else { continue };
                        let target = (1..caps.len())
                            .rev()
                            .find_map(|g| caps.get(g))
                            .unwrap_or(whole);
                        raw.get_or_insert_with(|| whole.as_str().to_string());
                        spread.push(target.as_str().to_string());
                        hits.push(Hit {
                            item: index,
                            target: target.range(),
                            groups: caps
                                .iter()
                                .map(|g| g.map(|m| m.as_str().to_string()))
                                .collect(),
                        });
                    }
                }
                Resolution {
                    result: P4Result {
                        passed: !hits.is_empty(),
                        value: spread.first().cloned(),
                        raw,
                        count: spread.len(),
                        spread,
                    },
                    items,
                    hits,
                }
            }
        }
    }

    fn resolve_use(&self, chapter: Option<&str>, pattern: Option<&Pattern>) -> Resolution {
        let Some(uses) = self.uses.uses(chapter) else {
            return Resolution::default();
        };
        let wire = uses.to_wire();
        let text = wire.to_string();
        let items = vec![Item {
            text: text.clone(),
            slot: Slot::ReadOnly,
        }];
        let (passed, raw) = match pattern {
            None => (true, text.clone()),
            Some(p) => {
                let inside = UseRange::parse(&p.text).contains(wire);
                (inside, inside.to_string())
            }
        };
        Resolution {
            result: P4Result {
                passed,
                value: Some(text.clone()),
                raw: Some(raw),
                spread: if passed { vec![text] } else { Vec::new() },
                count: usize::from(passed),
            },
            items,
            hits: Vec::new(),
        }
    }

    fn items(&self, source: &Source) -> Vec<Item> {
        match source {
            Source::Io {
                direction,
                part: Part::Head,
                name,
            } => {
                let response = *direction == Direction::Response;
                let headers = if response {
                    &self.response.headers
                } else {
                    &self.request.headers
                };
                headers
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| match name {
                        Some(n) if e.name.eq_ignore_ascii_case(n) => Some(Item {
                            text: e.value.clone(),
                            slot: if response {
                                Slot::ResponseHeaderValue(i)
                            } else {
                                Slot::ReadOnly
                            },
                        }),
                        Some(_) => None,
                        None => Some(Item {
                            text: format!("{}: {}", e.name, e.value),
                            slot: if response {
                                Slot::ResponseHeaderLine(i)
                            } else {
                                Slot::ReadOnly
                            },
                        }),
                    })
                    .collect()
            }
            Source::Io {
                direction,
                part: Part::Body,
                ..
            } => {
                let (body, slot) = match direction {
                    Direction::Response => (&self.response.body, Slot::ResponseBody),
                    Direction::Request => (&self.request.body, Slot::ReadOnly),
                };
                if body.is_empty() {
                    Vec::new()
                } else {
                    vec![Item {
                        text: body.clone(),
                        slot,
                    }]
                }
            }
            Source::Var {
                level,
                search_up,
                name: Some(name),
            } => self
                .scopes
                .lookup(*level, name, *search_up)
                .map(|(found, value)| Item {
                    text: value.to_string(),
                    slot: Slot::Var(found, name.clone()),
                })
                .into_iter()
                .collect(),
            Source::Var {
                level, name: None, ..
            } => self
                .scopes
                .map(*level)
                .iter()
                .map(|(k, v)| Item {
                    text: v.clone(),
                    slot: Slot::Var(*level, k.clone()),
                })
                .collect(),
            Source::Use { .. } => Vec::new(),
        }
    }

    fn write_variable(&mut self, level: ScopeLevel, name: &str, suffixes: &[Suffix], result: &P4Result) {
        if let Some(value) = result.value.as_ref().filter(|_| result.passed) {
            self.scopes.set(level, name, value.clone());
        }
        for suffix in suffixes {
            match suffix {
                Suffix::Exists => self.scopes.set(level, format!("{name}?"), result.passed.to_string()),
                Suffix::Count => self.scopes.set(level, format!("{name}#"), result.count.to_string()),
                _ if !result.passed => {}
                Suffix::Raw => {
                    if let Some(raw) = &result.raw {
                        self.scopes.set(level, format!("{name}@"), raw.clone());
                    }
                }
                Suffix::SpreadAll => {
                    for (i, value) in result.spread.iter().enumerate() {
                        self.scopes.set(level, format!("{name}_{i}"), value.clone());
                    }
                }
                Suffix::SpreadLast => {
                    if let Some(last) = result.spread.last() {
                        self.scopes.set(level, format!("{name}_last"), last.clone());
                    }
                }
                Suffix::SpreadIndex(n) => {
                    if let Some(value) = result.spread.get(*n) {
                        self.scopes.set(level, format!("{name}_{n}"), value.clone());
                    }
                }
            }
        }
    }

    fn write_back(&mut self, source: &Source, patterned: bool, template: &str, res: &Resolution) {
        if !res.result.passed {
            return;
        }
        match source {
            Source::Io {
                direction: Direction::Request,
                ..
            } => {
                warn!("write-back into request rejected");
            }
            Source::Use { chapter } => {
                let Some(chapter) = chapter else { return };
                let value = self.render(template, res.hits.first(), res.items.first());
                match value.trim().parse::<i64>() {
                    Ok(wire) => {
                        if !self.uses.set_uses(chapter, MockUse::from_wire(wire)) {
                            debug!(chapter = %chapter, "use write-back to unknown chapter");
                        }
                    }
                    Err(_) => debug!(value = %value, "use write-back value is not an integer"),
                }
            }
            Source::Io {
                part: Part::Head,
                name: Some(name),
                ..
            } if !patterned => {
                let value = self.render(template, None, res.items.first());
                self.response.headers.set(name, value);
            }
            Source::Io { part: Part::Body, .. } if !patterned => {
                self.response.body = self.render(template, None, res.items.first());
            }
            Source::Var { .. } if !patterned => {
                let Some(item) = res.items.first() else { return };
                let value = self.render(template, None, Some(item));
                if let Slot::Var(level, name) = &item.slot {
                    self.scopes.set(*level, name.clone(), value);
                }
            }
            Source::Io { part: Part::Body, .. } => self.splice(template, res, res.hits.first().into_iter()),
            _ => self.splice(template, res, res.hits.iter()),
        }
    }

    /// Splices the rendered value at each hit's target range.
    fn splice<'h>(&mut self, template: &str, res: &Resolution, hits: impl Iterator<Item = &'h Hit>) {
        let mut texts: Vec<Option<String>> = vec![None; res.items.len()];
        let mut hits: Vec<&Hit> = hits.collect();
        hits.sort_by_key(|h| (h.item, std::cmp::Reverse(h.target.start)));
        for hit in hits {
            let value = self.render(template, Some(hit), res.items.get(hit.item));
            let Some(text) = texts
                .get_mut(hit.item)
                .map(|t| t.get_or_insert_with(|| res.items[hit.item].text.clone()))
            else {
                continue;
            };
            text.replace_range(hit.target.clone(), &value);
        }
        for (item, text) in res.items.iter().zip(texts) {
            if let Some(text) = text {
                self.store(&item.slot, text);
            }
        }
    }

    fn store(&mut self, slot: &Slot, text: String) {
        match slot {
            Slot::ResponseHeaderValue(i) => {
                if let Some(entry) = self.response.headers.iter_mut().nth(*i) {
                    entry.value = text;
                }
            }
            Slot::ResponseHeaderLine(i) => {
                let Some((name, value)) = text.split_once(": ") else {
                    debug!(line = %text, "spliced header line lost its separator");
                    return;
                };
                if let Some(entry) = self.response.headers.iter_mut().nth(*i) {
                    entry.name = name.to_string();
                    entry.value = value.to_string();
                }
            }
            Slot::ResponseBody => self.response.body = text,
            Slot::Var(level, name) => self.scopes.set(*level, name.clone(), text),
            Slot::ReadOnly => warn!("write-back into read-only source rejected"),
        }
    }

    fn render(&self, template: &str, hit: Option<&Hit>, item: Option<&Item>) -> String {
        de_template(template, |r| match r {
            TemplateRef::Index(n) => match hit {
                Some(hit) => hit.groups.get(*n).cloned().flatten(),
                None if *n == 0 => item.map(|i| i.text.clone()),
                None => None,
            },
            TemplateRef::Var {
                level,
                search_up,
                name,
            } => self
                .scopes
                .lookup(*level, name, *search_up)
                .map(|(_, v)| v.to_string()),
            TemplateRef::Literal(text) => Some((*text).to_string()),
        })
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern).size_limit(1 << 20).build() {
        Ok(re) => Some(re),
        Err(e) => {
            debug!(pattern, error = %e, "malformed command pattern");
            None
        }
    }
}
