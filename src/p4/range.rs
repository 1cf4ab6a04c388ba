//! Numeric range expressions for `use` patterns.
//!
//! An expression is a comma-separated union of tokens: `#`, `>#`, `>=#`,
//! `<#`, `<=#` or an inclusive `a..b`. Whitespace around tokens is ignored.
//! A malformed token never matches; the rest of the union still applies.

/// One token of a range expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeToken {
    /// `n`
    Exact(i64),
    /// `>n`
    Greater(i64),
    /// `>=n`
    AtLeast(i64),
    /// `<n`
    Less(i64),
    /// `<=n`
    AtMost(i64),
    /// `a..b`, inclusive on both ends.
    Between(i64, i64),
    /// Unparsable token.
    Invalid,
}

impl RangeToken {
    fn parse(token: &str) -> Self {
        let token = token.trim();
        let num = |s: &str| s.trim().parse::<i64>().ok();
        let parsed = if let Some(rest) = token.strip_prefix(">=") {
            num(rest).map(Self::AtLeast)
        } else if let Some(rest) = token.strip_prefix("<=") {
            num(rest).map(Self::AtMost)
        } else if let Some(rest) = token.strip_prefix('>') {
            num(rest).map(Self::Greater)
        } else if let Some(rest) = token.strip_prefix('<') {
            num(rest).map(Self::Less)
        } else if let Some((lo, hi)) = token.split_once("..") {
            num(lo).zip(num(hi)).map(|(lo, hi)| Self::Between(lo, hi))
        } else {
            num(token).map(Self::Exact)
        };
        parsed.unwrap_or(Self::Invalid)
    }

    /// Returns `true` if `value` is inside this token's range.
    #[must_use]
    pub const fn contains(self, value: i64) -> bool {
        match self {
            Self::Exact(n) => value == n,
            Self::Greater(n) => value > n,
            Self::AtLeast(n) => value >= n,
            Self::Less(n) => value < n,
            Self::AtMost(n) => value <= n,
            Self::Between(lo, hi) => lo <= value && value <= hi,
            Self::Invalid => false,
        }
    }
}

/// A parsed range expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseRange {
    tokens: Vec<RangeToken>,
}

impl UseRange {
    /// Parses an expression. Never fails.
    #[must_use]
    pub fn parse(expr: &str) -> Self {
        Self {
            tokens: expr.split(',').map(RangeToken::parse).collect(),
        }
    }

    /// Returns `true` if any token contains `value`.
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        self.tokens.iter().any(|t| t.contains(value))
    }
}
