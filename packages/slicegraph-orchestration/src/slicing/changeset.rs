//! Path-level diff between two canonical payloads

use crate::contract::PATH_SEPARATOR;
use serde_json::Value;
use std::collections::BTreeSet;

/// Changed dotted paths between two versions of one entity
///
/// Objects are walked key by key; any other value (scalars, arrays) is
/// compared as a whole at its path. Added and removed keys both count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub from_version: u64,
    pub to_version: u64,
    /// Sorted, unique
    pub changed_paths: Vec<String>,
}

impl ChangeSet {
    pub fn diff(from_version: u64, from: &Value, to_version: u64, to: &Value) -> Self {
        let mut paths = BTreeSet::new();
        collect(&mut paths, "", from, to);
        Self {
            from_version,
            to_version,
            changed_paths: paths.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed_paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed_paths.len()
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", prefix, PATH_SEPARATOR, key)
    }
}

fn collect(paths: &mut BTreeSet<String>, prefix: &str, from: &Value, to: &Value) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let path = join(prefix, key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => collect(paths, &path, x, y),
                    _ => {
                        paths.insert(path);
                    }
                }
            }
        }
        (a, b) if a != b => {
            // Root-level type change: everything changed
            paths.insert(if prefix.is_empty() {
                crate::contract::WILDCARD.to_string()
            } else {
                prefix.to_string()
            });
        }
        _ => {}
    }
}
