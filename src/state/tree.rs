//! StateTree - path-addressable last-known value of every observed field
//!
//! Roots are upstream source names (or the local root); below each root is an
//! arbitrarily nested mapping. Merges are deep and additive: a merge never
//! drops sibling keys that are missing from the update.
//!
//! Snapshots are copy-on-write: `snapshot()` is a reference count bump, and the
//! next mutation clones the tree only while an older snapshot is still held.

use super::types::{value_kind, Mapping, Path};
use crate::error::RelayError;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTree {
    roots: Arc<Mapping>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from an existing root mapping
    pub fn from_mapping(roots: Mapping) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    /// Look up a path. `None` means absent: a segment is missing or a
    /// non-mapping was indexed. A stored `null` is `Some(&Value::Null)`.
    pub fn get(&self, path: &Path) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.roots.get(first)?;
        for key in rest {
            current = match current {
                Value::Object(map) => map.get(key)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Child keys of the mapping at `path` (empty if absent or not a mapping)
    pub fn child_keys(&self, path: &Path) -> Vec<String> {
        match self.get(path) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Names of all roots currently present
    pub fn root_names(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }

    /// Recursively merge `update` into the subtree of `root`.
    ///
    /// Mappings on both sides recurse; anything else is overwritten by the
    /// update. Shape changes (scalar vs mapping) are overwritten too and
    /// reported back as `MergeConflict` for the caller to log.
    pub fn merge_deep(&mut self, root: &str, update: &Mapping) -> Vec<RelayError> {
        let mut conflicts = Vec::new();
        let roots = Arc::make_mut(&mut self.roots);
        let slot = roots
            .entry(root.to_string())
            .or_insert_with(|| Value::Object(Mapping::new()));
        if !slot.is_object() {
            conflicts.push(conflict(root, slot, "mapping"));
            *slot = Value::Object(Mapping::new());
        }
        if let Value::Object(subtree) = slot {
            merge_into(subtree, update, root, &mut conflicts);
        }
        conflicts
    }

    /// Write a single value at `path`, creating intermediate mappings.
    ///
    /// Used for locally originated fields. Scalars in the way are replaced and
    /// reported as conflicts.
    pub fn set(&mut self, path: &Path, value: Value) -> Vec<RelayError> {
        let mut conflicts = Vec::new();
        let (last, parents) = match path.segments().split_last() {
            Some(split) => split,
            None => return conflicts,
        };

        let mut current = Arc::make_mut(&mut self.roots);
        let mut walked = String::new();
        for key in parents {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(key);

            let slot = current
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Mapping::new()));
            if !slot.is_object() {
                conflicts.push(conflict(&walked, slot, "mapping"));
                *slot = Value::Object(Mapping::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just made a mapping"),
            };
        }

        if let Some(existing) = current.get(last) {
            if existing.is_object() != value.is_object() {
                conflicts.push(conflict(&path.to_string(), existing, value_kind(&value)));
            }
        }
        current.insert(last.clone(), value);
        conflicts
    }

    /// Immutable view for diffing; cheap to take
    pub fn snapshot(&self) -> StateTree {
        self.clone()
    }

    /// True if both trees share storage (no mutation happened in between)
    pub fn same_storage(&self, other: &StateTree) -> bool {
        Arc::ptr_eq(&self.roots, &other.roots)
    }

    pub fn roots(&self) -> &Mapping {
        &self.roots
    }
}

fn merge_into(target: &mut Mapping, update: &Mapping, prefix: &str, conflicts: &mut Vec<RelayError>) {
    for (key, incoming) in update {
        let path = format!("{}.{}", prefix, key);
        match incoming {
            Value::Object(nested) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Mapping::new()));
                if !slot.is_object() {
                    conflicts.push(conflict(&path, slot, "mapping"));
                    *slot = Value::Object(Mapping::new());
                }
                if let Value::Object(child) = slot {
                    merge_into(child, nested, &path, conflicts);
                }
            }
            scalar => {
                if let Some(existing @ Value::Object(_)) = target.get(key) {
                    conflicts.push(conflict(&path, existing, value_kind(scalar)));
                }
                target.insert(key.clone(), scalar.clone());
            }
        }
    }
}

fn conflict(path: &str, existing: &Value, to: &'static str) -> RelayError {
    RelayError::MergeConflict {
        path: path.to_string(),
        from: value_kind(existing),
        to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(value: Value) -> Mapping {
        match value {
            Value::Object(map) => map,
            other => panic!("expected mapping, got {other}"),
        }
    }

    fn path(dotted: &str) -> Path {
        Path::parse(dotted).unwrap()
    }

    #[test]
    fn test_get_missing_and_non_mapping() {
        let mut tree = StateTree::new();
        tree.merge_deep("printer", &mapping(json!({"extruder": {"temperature": 20}})));

        assert_eq!(tree.get(&path("printer.extruder.temperature")), Some(&json!(20)));
        assert_eq!(tree.get(&path("printer.heater_bed")), None);
        // Indexing into a scalar is absent, not an error
        assert_eq!(tree.get(&path("printer.extruder.temperature.deeper")), None);
        assert_eq!(tree.get(&path("nope")), None);
    }

    #[test]
    fn test_stored_null_is_present() {
        let mut tree = StateTree::new();
        tree.merge_deep("printer", &mapping(json!({"error": null})));
        assert_eq!(tree.get(&path("printer.error")), Some(&Value::Null));
    }

    #[test]
    fn test_merge_keeps_siblings() {
        let mut tree = StateTree::new();
        tree.merge_deep(
            "printer",
            &mapping(json!({"extruder": {"temperature": 20, "target": 0}})),
        );
        tree.merge_deep("printer", &mapping(json!({"extruder": {"temperature": 25}})));

        assert_eq!(tree.get(&path("printer.extruder.temperature")), Some(&json!(25)));
        assert_eq!(tree.get(&path("printer.extruder.target")), Some(&json!(0)));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let update = mapping(json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"}));
        let mut once = StateTree::new();
        once.merge_deep("root", &update);
        let mut twice = once.clone();
        twice.merge_deep("root", &update);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_conflict_overwrites_and_reports() {
        let mut tree = StateTree::new();
        tree.merge_deep("printer", &mapping(json!({"state": "ready"})));
        let conflicts = tree.merge_deep("printer", &mapping(json!({"state": {"code": 1}})));

        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            &conflicts[0],
            RelayError::MergeConflict { path, from: "text", to: "mapping" } if path == "printer.state"
        ));
        assert_eq!(tree.get(&path("printer.state.code")), Some(&json!(1)));

        let conflicts = tree.merge_deep("printer", &mapping(json!({"state": 3})));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(tree.get(&path("printer.state")), Some(&json!(3)));
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let mut tree = StateTree::new();
        let conflicts = tree.set(&path("skylight.display_mode"), json!("idle"));
        assert!(conflicts.is_empty());
        assert_eq!(tree.get(&path("skylight.display_mode")), Some(&json!("idle")));

        let conflicts = tree.set(&path("skylight.display_mode.sub"), json!(1));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(tree.get(&path("skylight.display_mode.sub")), Some(&json!(1)));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_merges() {
        let mut tree = StateTree::new();
        tree.merge_deep("printer", &mapping(json!({"x": 1})));
        let snapshot = tree.snapshot();
        assert!(snapshot.same_storage(&tree));

        tree.merge_deep("printer", &mapping(json!({"x": 2})));
        assert!(!snapshot.same_storage(&tree));
        assert_eq!(snapshot.get(&path("printer.x")), Some(&json!(1)));
        assert_eq!(tree.get(&path("printer.x")), Some(&json!(2)));
    }

    #[test]
    fn test_child_keys() {
        let mut tree = StateTree::new();
        tree.merge_deep("printer", &mapping(json!({"extruder": {"temperature": 1, "target": 2}})));
        let mut keys = tree.child_keys(&path("printer.extruder"));
        keys.sort();
        assert_eq!(keys, vec!["target".to_string(), "temperature".to_string()]);
        assert!(tree.child_keys(&path("printer.extruder.target")).is_empty());
    }
}
