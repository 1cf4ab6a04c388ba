//! Chapter mock-use state.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Remaining-uses state of a chapter.
///
/// Wire encoding (tape JSON and DSL `use` values):
///
/// | state                 | wire       |
/// |-----------------------|------------|
/// | `Always`              | `-1`       |
/// | `Disabled`            | `0`        |
/// | `Limited(n)`          | `n` (> 0)  |
/// | `DisabledLimited(n)`  | `-(n + 1)` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MockUse {
    /// Serve on every call.
    #[default]
    Always,
    /// Never selected.
    Disabled,
    /// Serve `n` more times.
    Limited(u32),
    /// Disabled, remembering `n` remaining uses for re-enabling.
    DisabledLimited(u32),
}

impl MockUse {
    /// Wire value of the `Always` state.
    pub const ALWAYS: i32 = -1;
    /// Wire value of the `Disabled` state.
    pub const DISABLE: i32 = 0;

    /// Decodes a wire value.
    #[must_use]
    pub fn from_wire(value: i64) -> Self {
        match value {
            -1 => Self::Always,
            0 => Self::Disabled,
            n if n > 0 => u32::try_from(n).map_or(Self::Disabled, Self::Limited),
            n => n
                .checked_neg()
                .and_then(|v| u32::try_from(v - 1).ok())
                .map_or(Self::Disabled, Self::DisabledLimited),
        }
    }

    /// Encodes to the wire value.
    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Always => -1,
            Self::Disabled => 0,
            Self::Limited(n) => i64::from(n),
            Self::DisabledLimited(n) => -i64::from(n) - 1,
        }
    }

    /// Returns `true` if the chapter may be selected by a replay preference.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Always | Self::Limited(1..))
    }

    /// Returns `true` for states written to tape files.
    #[must_use]
    pub const fn is_persisted(self) -> bool {
        matches!(self, Self::Always | Self::Disabled)
    }

    /// Consumes one use. `Limited(1)` becomes `Disabled`; other states are
    /// unchanged.
    #[must_use]
    pub const fn consumed(self) -> Self {
        match self {
            Self::Limited(n) if n > 1 => Self::Limited(n - 1),
            Self::Limited(_) => Self::Disabled,
            other => other,
        }
    }
}

impl std::fmt::Display for MockUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl Serialize for MockUse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for MockUse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Self::from_wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(MockUse::from_wire(-1), MockUse::Always);
        assert_eq!(MockUse::from_wire(0), MockUse::Disabled);
        assert_eq!(MockUse::from_wire(3), MockUse::Limited(3));
        assert_eq!(MockUse::from_wire(-4), MockUse::DisabledLimited(3));
        assert_eq!(MockUse::DisabledLimited(3).to_wire(), -4);
        assert_eq!(MockUse::Always.to_wire(), i64::from(MockUse::ALWAYS));
        assert_eq!(MockUse::Disabled.to_wire(), i64::from(MockUse::DISABLE));
    }

    #[test]
    fn activity() {
        assert!(MockUse::Always.is_active());
        assert!(MockUse::Limited(1).is_active());
        assert!(!MockUse::Limited(0).is_active());
        assert!(!MockUse::Disabled.is_active());
        assert!(!MockUse::DisabledLimited(5).is_active());
    }

    #[test]
    fn consumption_reaches_disabled() {
        let mut uses = MockUse::Limited(2);
        uses = uses.consumed();
        assert_eq!(uses, MockUse::Limited(1));
        uses = uses.consumed();
        assert_eq!(uses, MockUse::Disabled);
        assert_eq!(MockUse::Always.consumed(), MockUse::Always);
    }

    #[test]
    fn persistence_policy() {
        assert!(MockUse::Always.is_persisted());
        assert!(MockUse::Disabled.is_persisted());
        assert!(!MockUse::Limited(2).is_persisted());
        assert!(!MockUse::DisabledLimited(2).is_persisted());
    }

    #[test]
    fn serde_as_integer() {
        assert_eq!(serde_json::to_string(&MockUse::Limited(7)).unwrap(), "7");
        let parsed: MockUse = serde_json::from_str("-1").unwrap();
        assert_eq!(parsed, MockUse::Always);
    }
}
