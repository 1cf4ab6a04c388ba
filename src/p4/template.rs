//! `@{...}` template substitution for write-back values.
//!
//! Spans are found non-greedily and replaced right to left, so byte offsets
//! of earlier spans stay valid while the string is edited in place.
//! Unresolved spans become the empty string. Substituted text is never
//! re-scanned.

use std::sync::LazyLock;

use regex::Regex;

use super::scope::ScopeLevel;

/// Regex for matching `@{...}` spans.
static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\{(.*?)\}").expect("valid regex"));

/// A classified template span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef<'a> {
    /// `@{N}`: capture group `N` of the current match.
    Index(usize),
    /// `@{name}`, `@{^&name}`: a scope variable.
    Var {
        /// Scope level from the `&` / `%` prefix.
        level: ScopeLevel,
        /// `^`: search enclosing levels too.
        search_up: bool,
        /// Variable name.
        name: &'a str,
    },
    /// `@{'text'}` or `@{"text"}`.
    Literal(&'a str),
}

impl<'a> TemplateRef<'a> {
    /// Classifies the content of one span. `None` for empty content.
    #[must_use]
    pub fn classify(content: &'a str) -> Option<Self> {
        if content.is_empty() {
            return None;
        }
        if content.bytes().all(|b| b.is_ascii_digit()) {
            return content.parse().ok().map(Self::Index);
        }
        for quote in ['\'', '"'] {
            if content.len() >= 2 && content.starts_with(quote) && content.ends_with(quote) {
                return Some(Self::Literal(&content[1..content.len() - 1]));
            }
        }
        let (search_up, rest) = content
            .strip_prefix('^')
            .map_or((false, content), |rest| (true, rest));
        let mut chars = rest.chars();
        let (level, name) = match chars.next().and_then(ScopeLevel::from_prefix) {
            Some(level) => (level, chars.as_str()),
            None => (ScopeLevel::Sequence, rest),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self::Var {
            level,
            search_up,
            name,
        })
    }
}

/// Replaces every `@{...}` span using `resolve`.
pub fn de_template<F>(input: &str, mut resolve: F) -> String
where
    F: FnMut(&TemplateRef<'_>) -> Option<String>,
{
    let spans: Vec<_> = TEMPLATE_RE
        .captures_iter(input)
        .filter_map(|caps| Some((caps.get(0)?.range(), caps.get(1)?.as_str())))
        .collect();
    let mut out = input.to_string();
    for (range, content) in spans.into_iter().rev() {
        let value = TemplateRef::classify(content)
            .and_then(|r| resolve(&r))
            .unwrap_or_default();
        out.replace_range(range, &value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(r: &TemplateRef<'_>) -> Option<String> {
        match r {
            TemplateRef::Index(n) => Some(format!("g{n}")),
            TemplateRef::Var { name, .. } => (*name == "known").then(|| "K".to_string()),
            TemplateRef::Literal(text) => Some((*text).to_string()),
        }
    }

    #[test]
    fn classifies_spans() {
        assert_eq!(TemplateRef::classify("2"), Some(TemplateRef::Index(2)));
        assert_eq!(TemplateRef::classify("'hi'"), Some(TemplateRef::Literal("hi")));
        assert_eq!(TemplateRef::classify("\"hi\""), Some(TemplateRef::Literal("hi")));
        assert_eq!(
            TemplateRef::classify("^&token"),
            Some(TemplateRef::Var {
                level: ScopeLevel::Chapter,
                search_up: true,
                name: "token"
            })
        );
        assert_eq!(
            TemplateRef::classify("%x"),
            Some(TemplateRef::Var {
                level: ScopeLevel::Bounds,
                search_up: false,
                name: "x"
            })
        );
        assert_eq!(TemplateRef::classify(""), None);
        assert_eq!(TemplateRef::classify("^"), None);
    }

    #[test]
    fn replaces_all_spans() {
        let out = de_template("a@{1}b@{known}c@{'lit'}d", resolver);
        assert_eq!(out, "ag1bKclitd");
    }

    #[test]
    fn unresolved_spans_become_empty() {
        assert_eq!(de_template("[@{missing}][@{}]", resolver), "[][]");
    }

    #[test]
    fn non_greedy_span_stops_at_first_brace() {
        let out = de_template("@{'@{known}'}", |r| match r {
            TemplateRef::Literal(t) => Some((*t).to_string()),
            _ => Some("X".into()),
        });
        assert_eq!(out, "X'}");
    }

    #[test]
    fn positional_values_of_differing_length() {
        let out = de_template("@{0}-@{1}-@{0}", |r| match r {
            TemplateRef::Index(0) => Some("long-value".into()),
            TemplateRef::Index(1) => Some(String::new()),
            _ => None,
        });
        assert_eq!(out, "long-value--long-value");
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let out = de_template("@{known}", |_| Some("@{known}".into()));
        assert_eq!(out, "@{known}");
    }
}
