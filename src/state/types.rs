//! Core state type definitions
//!
//! Defines the path type used to address fields in the state tree and the
//! identifiers shared between the hub, the registry and the server.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Nested mapping of field name to value
pub type Mapping = serde_json::Map<String, Value>;

/// Identifier of a subscriber connection (downstream socket or internal consumer)
pub type ConnectionId = u64;

/// Segment that expands to every child key present at subscribe time
pub const WILDCARD: &str = "*";

/// Dotted location of a field inside the state tree (`root.group.field`)
///
/// The first segment is always the root name (the upstream source or the
/// local root). The canonical string form is the wire and registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Parse a dotted path. Returns `None` for an empty path or an empty segment.
    pub fn parse(dotted: &str) -> Option<Self> {
        let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    /// Single-segment path naming a root
    pub fn root(name: &str) -> Self {
        Self {
            segments: vec![name.to_string()],
        }
    }

    /// Build a path from already-split segments
    pub fn from_segments<I, S>(segments: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    /// Path of a direct child (`key` is taken as one literal segment)
    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Self { segments }
    }

    /// Append a dotted suffix, e.g. `extruder` + `heater.power`
    pub fn join(&self, dotted: &str) -> Option<Self> {
        let suffix = Path::parse(dotted)?;
        let mut segments = self.segments.clone();
        segments.extend(suffix.segments);
        Some(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Name of the root this path lives under
    pub fn root_name(&self) -> &str {
        &self.segments[0]
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Paths are never empty; kept for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `other` or is one of its ancestors
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Overlap test: equal, ancestor or descendant
    pub fn overlaps(&self, other: &Path) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for Path {
    type Err = crate::error::RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s).ok_or_else(|| crate::error::RelayError::ProtocolDecode(format!("invalid path '{}'", s)))
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Path::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid path '{}'", raw)))
    }
}

/// Short name of a value's shape, used in conflict reports
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = Path::parse("printer.extruder.temperature").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.root_name(), "printer");
        assert_eq!(path.to_string(), "printer.extruder.temperature");
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(Path::parse("").is_none());
        assert!(Path::parse("a..b").is_none());
        assert!(Path::parse(".a").is_none());
        assert!(Path::from_segments(Vec::<String>::new()).is_none());
    }

    #[test]
    fn test_overlap() {
        let ab = Path::parse("a.b").unwrap();
        assert!(ab.overlaps(&Path::parse("a.b").unwrap()));
        assert!(ab.overlaps(&Path::parse("a.b.c").unwrap()));
        assert!(ab.overlaps(&Path::parse("a").unwrap()));
        assert!(!ab.overlaps(&Path::parse("a.c").unwrap()));
        // Segment-wise, not string prefix
        assert!(!ab.overlaps(&Path::parse("a.bc").unwrap()));
    }

    #[test]
    fn test_child_and_join() {
        let root = Path::root("moonraker");
        assert_eq!(root.child("extruder").to_string(), "moonraker.extruder");
        assert_eq!(
            root.join("extruder.target").unwrap().to_string(),
            "moonraker.extruder.target"
        );
        assert!(root.join("bad..path").is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let path = Path::parse("a.b").unwrap();
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"a.b\"");
        let back: Path = serde_json::from_str("\"a.b\"").unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<Path>("\"a..b\"").is_err());
    }
}
