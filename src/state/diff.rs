//! Structural difference between two state snapshots
//!
//! A `ChangeSet` is shaped like the part of the tree that changed. Each leaf
//! carries the value before and after, with an explicit `Slot::Absent` marker
//! for "not there" so that a stored `null` is never confused with an addition
//! or removal.

use super::tree::StateTree;
use super::types::{Mapping, Path};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One side of a changed leaf
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// The key did not exist on this side
    Absent,
    /// The key held this value (which may itself be `null`)
    Present(Value),
}

impl Slot {
    pub fn from_option(value: Option<&Value>) -> Self {
        match value {
            Some(v) => Slot::Present(v.clone()),
            None => Slot::Absent,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Slot::Absent)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Slot::Present(v) => Some(v),
            Slot::Absent => None,
        }
    }
}

/// Entry of a change set: either a nested set or a before/after pair
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Nested(ChangeSet),
    Leaf { old: Slot, new: Slot },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    entries: BTreeMap<String, Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Change> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Change)> {
        self.entries.iter()
    }

    /// The before/after pair recorded exactly at `path`, if any
    pub fn leaf_at(&self, path: &Path) -> Option<(&Slot, &Slot)> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for key in parents {
            current = match current.entries.get(key)? {
                Change::Nested(nested) => nested,
                Change::Leaf { .. } => return None,
            };
        }
        match current.entries.get(last)? {
            Change::Leaf { old, new } => Some((old, new)),
            Change::Nested(_) => None,
        }
    }

    /// Canonical paths of every leaf in the set
    pub fn changed_paths(&self) -> BTreeSet<Path> {
        let mut out = BTreeSet::new();
        let mut prefix = Vec::new();
        self.collect_paths(&mut prefix, &mut out);
        out
    }

    fn collect_paths(&self, prefix: &mut Vec<String>, out: &mut BTreeSet<Path>) {
        for (key, change) in &self.entries {
            prefix.push(key.clone());
            match change {
                Change::Nested(nested) => nested.collect_paths(prefix, out),
                Change::Leaf { .. } => {
                    // An empty key has no dotted form; report its nearest
                    // addressable ancestor instead
                    let addressable = prefix.iter().take_while(|s| !s.is_empty()).cloned();
                    match Path::from_segments(addressable) {
                        Some(path) => {
                            out.insert(path);
                        }
                        None => debug!(key = ?prefix, "Change under an empty root key"),
                    }
                }
            }
            prefix.pop();
        }
    }
}

/// Compare two snapshots. Empty iff the trees are deeply equal.
pub fn compare_trees(old: &StateTree, new: &StateTree) -> ChangeSet {
    if old.same_storage(new) {
        return ChangeSet::default();
    }
    compare(old.roots(), new.roots())
}

/// Recursive key-set union of two mappings.
///
/// A mapping present on one side only is compared against an empty mapping,
/// so its leaves show up at their deepest paths. An empty mapping added or
/// removed becomes a single leaf, otherwise it would go unnoticed.
pub fn compare(old: &Mapping, new: &Mapping) -> ChangeSet {
    let empty = Mapping::new();
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut entries = BTreeMap::new();

    for key in keys {
        let change = match (old.get(key), new.get(key)) {
            (Some(Value::Object(o)), Some(Value::Object(n))) => {
                let nested = compare(o, n);
                if nested.is_empty() {
                    continue;
                }
                Change::Nested(nested)
            }
            (Some(o), Some(n)) => {
                if values_equal(o, n) {
                    continue;
                }
                Change::Leaf {
                    old: Slot::Present(o.clone()),
                    new: Slot::Present(n.clone()),
                }
            }
            (None, Some(Value::Object(n))) if !n.is_empty() => Change::Nested(compare(&empty, n)),
            (Some(Value::Object(o)), None) if !o.is_empty() => Change::Nested(compare(o, &empty)),
            (None, Some(n)) => Change::Leaf {
                old: Slot::Absent,
                new: Slot::Present(n.clone()),
            },
            (Some(o), None) => Change::Leaf {
                old: Slot::Present(o.clone()),
                new: Slot::Absent,
            },
            (None, None) => continue,
        };
        entries.insert(key.clone(), change);
    }

    ChangeSet { entries }
}

/// Deep equality where numbers compare by value, so `20` equals `20.0`
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| values_equal(a, b)))
        }
        _ => a == b,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    if a.is_f64() || b.is_f64() {
        return a.as_f64() == b.as_f64();
    }
    false
}
