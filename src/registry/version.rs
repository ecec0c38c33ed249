//! Module versions and dependency constraints.
//!
//! Versions are dotted numeric strings (`1`, `1.2`, `1.2.3`). Missing trailing
//! components compare as zero, so `1.2 == 1.2.0`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Eq)]
pub struct ModuleVersion {
    parts: Vec<u64>,
}

impl ModuleVersion {
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    pub fn major(&self) -> u64 {
        self.parts.first().copied().unwrap_or(0)
    }

    fn component(&self, index: usize) -> u64 {
        self.parts.get(index).copied().unwrap_or(0)
    }
}

impl PartialEq for ModuleVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::hash::Hash for ModuleVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let significant = self
            .parts
            .iter()
            .rposition(|p| *p != 0)
            .map(|i| &self.parts[..=i])
            .unwrap_or(&[]);
        significant.hash(state);
    }
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ModuleVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        if trimmed.is_empty() {
            return Err("Invalid module version: empty string".to_string());
        }
        let parts = trimmed
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| format!("Invalid module version: {s}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { parts })
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(u64::to_string).collect();
        write!(f, "{}", rendered.join("."))
    }
}

impl Serialize for ModuleVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModuleVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Constraint a module places on one of its dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// `*`
    Any,
    /// `=X`
    Exact(ModuleVersion),
    /// `>=X`, or a bare `X`
    AtLeast(ModuleVersion),
    /// `>X`
    GreaterThan(ModuleVersion),
    /// `<=X`
    AtMost(ModuleVersion),
    /// `<X`
    LessThan(ModuleVersion),
    /// `^X`: same major version and at least X
    Compatible(ModuleVersion),
}

impl VersionConstraint {
    pub fn matches(&self, version: &ModuleVersion) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => version == v,
            Self::AtLeast(v) => version >= v,
            Self::GreaterThan(v) => version > v,
            Self::AtMost(v) => version <= v,
            Self::LessThan(v) => version < v,
            Self::Compatible(v) => version.major() == v.major() && version >= v,
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::Any);
        }
        let (ctor, rest): (fn(ModuleVersion) -> Self, &str) = if let Some(r) = s.strip_prefix(">=")
        {
            (Self::AtLeast, r)
        } else if let Some(r) = s.strip_prefix("<=") {
            (Self::AtMost, r)
        } else if let Some(r) = s.strip_prefix('>') {
            (Self::GreaterThan, r)
        } else if let Some(r) = s.strip_prefix('<') {
            (Self::LessThan, r)
        } else if let Some(r) = s.strip_prefix('=') {
            (Self::Exact, r)
        } else if let Some(r) = s.strip_prefix('^') {
            (Self::Compatible, r)
        } else {
            (Self::AtLeast, s)
        };
        let version = rest
            .parse::<ModuleVersion>()
            .map_err(|e| format!("Invalid version constraint '{s}': {e}"))?;
        Ok(ctor(version))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(v) => write!(f, "={v}"),
            Self::AtLeast(v) => write!(f, ">={v}"),
            Self::GreaterThan(v) => write!(f, ">{v}"),
            Self::AtMost(v) => write!(f, "<={v}"),
            Self::LessThan(v) => write!(f, "<{v}"),
            Self::Compatible(v) => write!(f, "^{v}"),
        }
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ModuleVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering_pads_with_zero() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.99.99"));
        assert_eq!(v("v1.0").to_string(), "1.0");
    }

    #[test]
    fn test_invalid_versions() {
        assert!("".parse::<ModuleVersion>().is_err());
        assert!("1.x".parse::<ModuleVersion>().is_err());
        assert!("1..2".parse::<ModuleVersion>().is_err());
    }

    #[test]
    fn test_constraints() {
        assert!("*".parse::<VersionConstraint>().unwrap().matches(&v("0.1")));
        assert!("1.0".parse::<VersionConstraint>().unwrap().matches(&v("1.2")));
        assert!(!"1.0".parse::<VersionConstraint>().unwrap().matches(&v("0.9")));
        assert!("=1.2".parse::<VersionConstraint>().unwrap().matches(&v("1.2.0")));
        assert!(!">1.2".parse::<VersionConstraint>().unwrap().matches(&v("1.2")));
        assert!("<2".parse::<VersionConstraint>().unwrap().matches(&v("1.9")));
        assert!("<=2".parse::<VersionConstraint>().unwrap().matches(&v("2.0")));
        let caret: VersionConstraint = "^1.2".parse().unwrap();
        assert!(caret.matches(&v("1.5")));
        assert!(!caret.matches(&v("2.0")));
        assert!(!caret.matches(&v("1.1")));
    }

    #[test]
    fn test_serde_as_strings() {
        let json = serde_json::to_string(&v("1.2.3")).unwrap();
        assert_eq!(json, "\"1.2.3\"");
        let constraint: VersionConstraint = serde_json::from_str("\">=1.0\"").unwrap();
        assert_eq!(constraint, VersionConstraint::AtLeast(v("1.0")));
    }
}
