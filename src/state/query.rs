//! Read path over a tree snapshot
//!
//! Used for inbound `objects.query` requests, for the HTTP query endpoint and
//! for building notification payloads. Never mutates.

use super::registry::expand_object_spec;
use super::tree::StateTree;
use super::types::{Mapping, Path};
use serde_json::Value;
use std::collections::BTreeSet;

/// `{dotted path: value}` for every requested path that is present.
/// Absent paths are omitted rather than reported as `null`.
pub fn handle_query(tree: &StateTree, paths: &BTreeSet<Path>) -> Mapping {
    paths
        .iter()
        .filter_map(|path| tree.get(path).map(|v| (path.to_string(), v.clone())))
        .collect()
}

/// Expand an object spec against `tree` and read it
pub fn query_objects(tree: &StateTree, objects: &Value) -> Mapping {
    handle_query(tree, &expand_object_spec(objects, tree))
}

/// Object spec from an HTTP query string: `a.b&c&d=x,y`.
///
/// A bare key requests the whole subtree; `key=f1,f2` requests fields.
pub fn object_spec_from_query(raw: &str) -> Value {
    let mut spec = Mapping::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, fields) = match pair.split_once('=') {
            Some((key, fields)) => (key, Some(fields)),
            None => (pair, None),
        };
        let value = match fields {
            Some(fields) if !fields.is_empty() => Value::Array(
                fields
                    .split(',')
                    .filter(|f| !f.is_empty())
                    .map(|f| Value::String(f.to_string()))
                    .collect(),
            ),
            _ => Value::Null,
        };
        spec.insert(key.to_string(), value);
    }
    Value::Object(spec)
}
