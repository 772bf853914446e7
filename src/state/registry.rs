//! Subscription registry
//!
//! Tracks which connection asked for which paths. Object specs are expanded
//! once, at subscribe time, against the current tree: a `*` only resolves to
//! the children that exist at that moment. Keys added later under a
//! wildcarded parent are not picked up by existing subscriptions.

use super::tree::StateTree;
use super::types::{ConnectionId, Path, WILDCARD};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

/// One subscriber's frozen interest set
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    /// JSON-RPC id echoed back in every notification
    pub subscription_id: Value,
    pub requested_paths: BTreeSet<Path>,
}

impl Subscription {
    /// True if any requested path overlaps any changed path
    pub fn is_interested_in(&self, changed: &BTreeSet<Path>) -> bool {
        self.requested_paths
            .iter()
            .any(|requested| changed.iter().any(|c| requested.overlaps(c)))
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand `objects` against `tree` and store the result.
    ///
    /// Subscribing again with the same connection and subscription id
    /// replaces the previous path set.
    pub fn subscribe(
        &mut self,
        connection_id: ConnectionId,
        subscription_id: Value,
        objects: &Value,
        tree: &StateTree,
    ) -> Subscription {
        let subscription = Subscription {
            connection_id,
            subscription_id,
            requested_paths: expand_object_spec(objects, tree),
        };

        self.subscriptions.retain(|s| {
            !(s.connection_id == connection_id && s.subscription_id == subscription.subscription_id)
        });
        self.subscriptions.push(subscription.clone());

        debug!(
            connection_id,
            paths = subscription.requested_paths.len(),
            "Subscription registered"
        );
        subscription
    }

    /// Remove every subscription of a connection. Idempotent.
    pub fn unsubscribe(&mut self, connection_id: ConnectionId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.connection_id != connection_id);
        before - self.subscriptions.len()
    }

    /// Subscriptions that care about at least one of `changed`
    pub fn matching<'a>(
        &'a self,
        changed: &'a BTreeSet<Path>,
    ) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.subscriptions
            .iter()
            .filter(move |s| s.is_interested_in(changed))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.subscriptions
            .iter()
            .map(|s| s.connection_id)
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Expand an object spec into canonical paths.
///
/// Per key, the value means:
/// - `null` / `true`: the key itself (whole subtree)
/// - list of strings: one path per listed field (`"*"` expands children)
/// - mapping: recurse with the key as prefix
/// - `"*"`: every child present now; any other string is a single field
///
/// A key that is literally `"*"` expands over every child of the current
/// prefix (or every root at the top level) and applies its value to each.
pub fn expand_object_spec(objects: &Value, tree: &StateTree) -> BTreeSet<Path> {
    let mut out = BTreeSet::new();
    if let Value::Object(spec) = objects {
        expand_mapping(None, spec, tree, &mut out);
    }
    out
}

fn expand_mapping(
    prefix: Option<&Path>,
    spec: &serde_json::Map<String, Value>,
    tree: &StateTree,
    out: &mut BTreeSet<Path>,
) {
    for (key, value) in spec {
        if key == WILDCARD {
            for child in children_of(prefix, tree) {
                expand_value(&child, value, tree, out);
            }
            continue;
        }

        let path = match prefix {
            Some(p) => p.join(key),
            None => Path::parse(key),
        };
        match path {
            Some(path) => expand_value(&path, value, tree, out),
            None => debug!(key = %key, "Ignoring invalid object key"),
        }
    }
}

fn expand_value(path: &Path, value: &Value, tree: &StateTree, out: &mut BTreeSet<Path>) {
    match value {
        Value::Null | Value::Bool(true) | Value::Number(_) => {
            out.insert(path.clone());
        }
        Value::Bool(false) => {}
        Value::String(field) => expand_field(path, field, tree, out),
        Value::Array(fields) => {
            for field in fields.iter().filter_map(Value::as_str) {
                expand_field(path, field, tree, out);
            }
        }
        Value::Object(nested) => expand_mapping(Some(path), nested, tree, out),
    }
}

fn expand_field(path: &Path, field: &str, tree: &StateTree, out: &mut BTreeSet<Path>) {
    if field == WILDCARD {
        out.extend(children_of(Some(path), tree));
    } else if let Some(full) = path.join(field) {
        out.insert(full);
    }
}

fn children_of(prefix: Option<&Path>, tree: &StateTree) -> Vec<Path> {
    match prefix {
        Some(path) => tree
            .child_keys(path)
            .iter()
            .map(|key| path.child(key))
            .collect(),
        None => tree.root_names().iter().map(|name| Path::root(name)).collect(),
    }
}
