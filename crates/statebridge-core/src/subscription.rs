use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::types::State;

/// Subscribing to this key means "the whole state".
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// SubscriptionManager
// ---------------------------------------------------------------------------

/// The set of state keys one consumer has subscribed to.
///
/// Keys are dotted paths (`user.profile.name`). Subscribing to a key covers
/// all of its descendants; subscribing to a descendant does not make the
/// ancestor visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionManager {
    keys: BTreeSet<String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add keys to the set. `None` subscribes to everything.
    pub fn subscribe(&mut self, keys: Option<&[String]>) {
        match keys {
            None => {
                self.keys.insert(WILDCARD.to_string());
            }
            Some(keys) => {
                self.keys.extend(
                    keys.iter()
                        .map(|k| k.trim())
                        .filter(|k| !k.is_empty())
                        .map(str::to_string),
                );
            }
        }
    }

    /// Remove keys from the set. `None` clears it.
    pub fn unsubscribe(&mut self, keys: Option<&[String]>) {
        match keys {
            None => self.keys.clear(),
            Some(keys) => {
                for key in keys {
                    self.keys.remove(key.trim());
                }
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.keys.contains(WILDCARD)
    }

    /// Whether a change at `key` concerns this consumer.
    ///
    /// Matches on the wildcard, the exact key, a subscribed ancestor of `key`,
    /// or a subscribed descendant of `key`.
    pub fn matches_key(&self, key: &str) -> bool {
        if self.has_access(key) {
            return true;
        }
        let prefix = format!("{key}.");
        self.keys.iter().any(|k| k.starts_with(&prefix))
    }

    /// Whether `key` is visible to this consumer: wildcard, exact, or a
    /// subscribed ancestor.
    pub fn has_access(&self, key: &str) -> bool {
        if self.is_wildcard() || self.keys.contains(key) {
            return true;
        }
        ancestors(key).any(|a| self.keys.contains(a))
    }

    /// True if any of `changed` paths concerns this consumer. An empty path
    /// stands for a replacement of the whole state.
    pub fn touches(&self, changed: &[String]) -> bool {
        changed
            .iter()
            .any(|path| path.is_empty() || self.matches_key(path))
    }

    /// The slice of `state` this consumer may see.
    pub fn project(&self, state: &State) -> State {
        project(state, &self.keys)
    }
}

/// Proper ancestors of a dotted key, nearest last: `a.b.c` → `a`, `a.b`.
fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('.').map(move |(i, _)| &key[..i])
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Build the object containing only `keys` (and their descendants) of
/// `state`. Keys absent from `state` are skipped.
pub fn project<'a>(state: &State, keys: impl IntoIterator<Item = &'a String>) -> State {
    let mut out = Value::Object(Map::new());
    for key in keys {
        if key == WILDCARD {
            return state.clone();
        }
        if let Some(value) = get_path(state, key) {
            set_path(&mut out, key, value.clone());
        }
    }
    out
}

/// Look up a dotted path inside nested objects.
pub fn get_path<'v>(state: &'v State, path: &str) -> Option<&'v Value> {
    path.split('.')
        .try_fold(state, |current, segment| current.as_object()?.get(segment))
}

/// Write `value` at a dotted path, creating intermediate objects and
/// replacing any non-object found on the way.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// Finest dotted paths at which `old` and `new` differ.
///
/// Objects are compared key by key; any other differing value (including
/// arrays) is reported at its own path. A differing non-object root yields
/// the empty path.
pub fn changed_paths(old: &State, new: &State) -> Vec<String> {
    let mut out = Vec::new();
    diff_into(old, new, String::new(), &mut out);
    out
}

fn diff_into(old: &Value, new: &Value, path: String, out: &mut Vec<String>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => diff_into(x, y, child, out),
                    _ => out.push(child),
                }
            }
        }
        _ => out.push(path),
    }
}

// ---------------------------------------------------------------------------
// Depth-limited serialization
// ---------------------------------------------------------------------------

/// Copy `value`, replacing every object or array nested `max_depth` levels
/// deep with a marker string naming its dotted path.
///
/// The root sits at depth 0, so `max_depth = 0` replaces the root itself.
pub fn serialize_with_depth(value: &Value, max_depth: usize) -> Value {
    limit_depth(value, max_depth, 0, "")
}

pub fn truncation_marker(path: &str) -> String {
    let path = if path.is_empty() { "<root>" } else { path };
    format!("[Max Depth Exceeded: {path}]")
}

fn limit_depth(value: &Value, max_depth: usize, depth: usize, path: &str) -> Value {
    let is_container = value.is_object() || value.is_array();
    if is_container && depth >= max_depth {
        return Value::String(truncation_marker(path));
    }
    let join = |segment: &str| {
        if path.is_empty() {
            segment.to_string()
        } else {
            format!("{path}.{segment}")
        }
    };
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), limit_depth(v, max_depth, depth + 1, &join(k))))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| limit_depth(v, max_depth, depth + 1, &join(&i.to_string())))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subs(keys: &[&str]) -> SubscriptionManager {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let mut m = SubscriptionManager::new();
        m.subscribe(Some(&keys));
        m
    }

    #[test]
    fn subscribe_none_means_wildcard() {
        let mut m = SubscriptionManager::new();
        m.subscribe(None);
        assert!(m.is_wildcard());
        assert!(m.matches_key("anything.at.all"));
        assert_eq!(m.keys(), vec!["*"]);
    }

    #[test]
    fn unsubscribe_specific_and_all() {
        let mut m = subs(&["a", "b"]);
        m.unsubscribe(Some(&["a".to_string()]));
        assert_eq!(m.keys(), vec!["b"]);
        m.unsubscribe(None);
        assert!(m.is_empty());
    }

    #[test]
    fn ancestor_subscription_covers_descendants() {
        let m = subs(&["user"]);
        assert!(m.matches_key("user.profile.name"));
        assert!(m.has_access("user.profile.name"));
        assert!(!m.matches_key("users"));
    }

    #[test]
    fn descendant_subscription_matches_but_grants_no_ancestor_access() {
        let m = subs(&["user.profile"]);
        assert!(m.matches_key("user"), "a change at user may touch user.profile");
        assert!(!m.has_access("user"));
        assert!(m.has_access("user.profile.avatar"));
        assert!(!m.matches_key("user.settings"));
    }

    #[test]
    fn unrelated_key_does_not_match() {
        let m = subs(&["a"]);
        assert!(!m.matches_key("b"));
        assert!(!m.touches(&["b".to_string()]));
        assert!(m.touches(&[String::new()]));
    }

    #[test]
    fn project_keeps_only_subscribed_branches() {
        let state = json!({
            "counter": 4,
            "user": { "profile": { "name": "ada", "age": 36 }, "token": "secret" },
            "theme": "dark"
        });
        let m = subs(&["counter", "user.profile.name", "missing.key"]);
        assert_eq!(
            m.project(&state),
            json!({ "counter": 4, "user": { "profile": { "name": "ada" } } })
        );

        let mut all = SubscriptionManager::new();
        all.subscribe(None);
        assert_eq!(all.project(&state), state);
    }

    #[test]
    fn changed_paths_reports_finest_differences() {
        let old = json!({ "counter": 1, "user": { "name": "a", "age": 3 }, "gone": true });
        let new = json!({ "counter": 1, "user": { "name": "b", "age": 3 }, "added": [1] });
        assert_eq!(changed_paths(&old, &new), vec!["added", "gone", "user.name"]);
        assert!(changed_paths(&old, &old).is_empty());
        assert_eq!(changed_paths(&json!(1), &json!(2)), vec![""]);
    }

    #[test]
    fn deep_values_are_replaced_with_marker() {
        let value = json!({ "a": { "b": { "c": { "d": 1 } } }, "flat": 2 });
        let out = serialize_with_depth(&value, 2);
        assert_eq!(
            out,
            json!({ "a": { "b": "[Max Depth Exceeded: a.b]" }, "flat": 2 })
        );
    }

    #[test]
    fn arrays_count_towards_depth() {
        let value = json!({ "items": [ { "x": 1 } ] });
        let out = serialize_with_depth(&value, 2);
        assert_eq!(out, json!({ "items": [ "[Max Depth Exceeded: items.0]" ] }));
    }

    #[test]
    fn zero_depth_truncates_root() {
        assert_eq!(
            serialize_with_depth(&json!({ "a": 1 }), 0),
            json!("[Max Depth Exceeded: <root>]")
        );
        assert_eq!(serialize_with_depth(&json!(5), 0), json!(5));
    }
}
