//! Hierarchical variable store with `${path.to.value}` expansion.
//!
//! A [`State`] is a cheap-to-clone handle over an ordered map of entries.
//! States nest through *links*: a child scope links its parent under
//! [`PARENT_KEY`] and itself under [`SELF_KEY`], and dotted-path lookup
//! traverses links transparently. Expansion resolves `${…}` references
//! recursively and supports `${udfName(arg)}` invocation against the
//! [`UdfRegistry`] carried by the state.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::udf::UdfRegistry;

/// Reserved key under which a process publishes its own state scope.
pub const SELF_KEY: &str = "self";
/// Reserved key linking a child scope back to its parent scope.
pub const PARENT_KEY: &str = "parent";
/// Reserved key holding run parameters.
pub const PARAMS_KEY: &str = "params";
/// Reserved key holding the workflow data bag.
pub const DATA_KEY: &str = "data";
/// Reserved key holding the active task selector.
pub const TASKS_KEY: &str = "tasks";

/// Expansion recursion cap; cyclic references are left as-is once reached.
const MAX_EXPANSION_DEPTH: usize = 10;

lazy_static! {
    static ref REFERENCE: Regex = Regex::new(r"\$\{([^{}]+)\}").expect("reference pattern");
    static ref UDF_CALL: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\((.*)\)$").expect("udf pattern");
}

/// Shared, order-preserving variable scope.
#[derive(Clone, Default)]
pub struct State {
    entries: Arc<RwLock<Map<String, Value>>>,
    links: Arc<RwLock<HashMap<String, State>>>,
    udfs: Arc<UdfRegistry>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("entries", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl State {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A state carrying the supplied UDF registry for `${udf(…)}` expansion.
    #[must_use]
    pub fn with_udfs(udfs: Arc<UdfRegistry>) -> Self {
        Self {
            udfs,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        let state = Self::new();
        if let Ok(mut entries) = state.entries.write() {
            *entries = map;
        }
        state
    }

    #[must_use]
    pub fn udfs(&self) -> Arc<UdfRegistry> {
        Arc::clone(&self.udfs)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: &str, value: Value) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), value);
        }
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
            || self
                .links
                .read()
                .map(|links| links.contains_key(key))
                .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.shift_remove(key);
        }
        if let Ok(mut links) = self.links.write() {
            links.remove(key);
        }
    }

    /// Alias another scope under `key`; dotted lookups traverse into it.
    pub fn link(&self, key: &str, other: &State) {
        if let Ok(mut links) = self.links.write() {
            links.insert(key.to_string(), other.clone());
        }
    }

    #[must_use]
    pub fn linked(&self, key: &str) -> Option<State> {
        self.links.read().ok()?.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the top-level entries. Linked scopes are not rendered.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Shallow merge of `other` over this state's entries.
    pub fn apply(&self, other: &Map<String, Value>) {
        if let Ok(mut entries) = self.entries.write() {
            for (key, value) in other {
                entries.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn apply_state(&self, other: &State) {
        self.apply(&other.snapshot());
    }

    /// A sibling state with its own copy of the top-level entries.
    ///
    /// Mutations on the fork do not show up in the original; nested
    /// container values still share structure until reassigned.
    #[must_use]
    pub fn fork(&self) -> State {
        let forked = State {
            entries: Arc::new(RwLock::new(self.snapshot())),
            links: Arc::new(RwLock::new(HashMap::new())),
            udfs: Arc::clone(&self.udfs),
        };
        if let Ok(links) = self.links.read() {
            if let Ok(mut forked_links) = forked.links.write() {
                forked_links.extend(links.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        forked
    }

    /// Dotted-path lookup; the first segment may name a linked scope.
    #[must_use]
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        if let Some(value) = self.get(path) {
            return Some(value);
        }
        if let Some(linked) = self.linked(path) {
            return Some(Value::Object(linked.snapshot()));
        }
        let (head, rest) = path.split_once('.')?;
        if let Some(linked) = self.linked(head) {
            return linked.get_value(rest);
        }
        let root = self.get(head)?;
        descend(&root, rest)
    }

    /// Dotted-path assignment, creating intermediate objects as needed.
    pub fn set_value(&self, path: &str, value: Value) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }
        match path.split_once('.') {
            None => self.put(path, value),
            Some((head, rest)) => {
                if let Some(linked) = self.linked(head) {
                    linked.set_value(rest, value);
                    return;
                }
                if let Ok(mut entries) = self.entries.write() {
                    let slot = entries
                        .entry(head.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    assign(slot, rest, value);
                }
            }
        }
    }

    /// Recursively replaces `${…}` references inside strings, sequences
    /// and mappings. Unresolved references are left intact.
    #[must_use]
    pub fn expand(&self, value: &Value) -> Value {
        self.expand_at(value, 0)
    }

    /// Expands a string and renders the result as text.
    #[must_use]
    pub fn expand_text(&self, text: &str) -> String {
        as_text(&self.expand_string(text, 0))
    }

    /// Expands every value of the supplied map.
    #[must_use]
    pub fn expand_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| (self.expand_text(key), self.expand_at(value, 0)))
            .collect()
    }

    fn expand_at(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::String(text) => self.expand_string(text, depth),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.expand_at(item, depth)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| {
                        (as_text(&self.expand_string(key, depth)), self.expand_at(item, depth))
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn expand_string(&self, text: &str, depth: usize) -> Value {
        if depth > MAX_EXPANSION_DEPTH || !text.contains("${") {
            return Value::String(text.to_string());
        }
        // A string that is exactly one reference keeps the resolved type.
        if let Some(caps) = REFERENCE.captures(text) {
            let full = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            if full == (0, text.len()) {
                return match self.resolve(&caps[1], depth) {
                    Some(resolved) => self.expand_at(&resolved, depth + 1),
                    None => Value::String(text.to_string()),
                };
            }
        }
        let replaced = REFERENCE
            .replace_all(text, |caps: &regex::Captures<'_>| {
                match self.resolve(&caps[1], depth) {
                    Some(value) => as_text(&value),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
        if replaced != text && replaced.contains("${") {
            return self.expand_string(&replaced, depth + 1);
        }
        Value::String(replaced)
    }

    fn resolve(&self, expr: &str, depth: usize) -> Option<Value> {
        let expr = expr.trim();
        if let Some(caps) = UDF_CALL.captures(expr) {
            if self.udfs.has(&caps[1]) {
                return self.call_udf(&caps[1], &caps[2], depth);
            }
            return None;
        }
        self.get_value(expr)
    }

    fn call_udf(&self, name: &str, arg: &str, depth: usize) -> Option<Value> {
        let expanded = as_text(&self.expand_string(arg, depth + 1));
        let trimmed = expanded.trim();
        let payload = if let Some(path) = trimmed.strip_prefix('$') {
            self.get_value(path)?
        } else if trimmed.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
        };
        match self.udfs.call(name, &payload, self) {
            Ok(value) => Some(value),
            Err(error) => {
                debug!("udf expansion left intact: {error}");
                None
            }
        }
    }
}

fn descend(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn assign(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Some(map) = target.as_object_mut() else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            assign(slot, rest, value);
        }
    }
}

/// Textual rendering used when a reference is substituted mid-string.
#[must_use]
pub fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_whole_reference() {
        let state = State::new();
        state.put("port", json!(8080));
        assert_eq!(state.expand(&json!("${port}")), json!(8080));
        assert_eq!(state.expand(&json!("port: ${port}")), json!("port: 8080"));
    }

    #[test]
    fn test_dotted_lookup_and_assignment() {
        let state = State::new();
        state.set_value("app.build.target", json!("linux"));
        assert_eq!(state.get_value("app.build.target"), Some(json!("linux")));
        state.put("items", json!(["a", "b"]));
        assert_eq!(state.get_value("items.1"), Some(json!("b")));
        assert_eq!(state.get_value("app.missing"), None);
    }

    #[test]
    fn test_nested_scope_links() {
        let parent = State::new();
        parent.put("region", json!("us-west"));
        let child = State::new();
        child.link(PARENT_KEY, &parent);
        child.link(SELF_KEY, &child);
        child.put("name", json!("deploy"));

        assert_eq!(child.get_value("parent.region"), Some(json!("us-west")));
        assert_eq!(child.get_value("self.name"), Some(json!("deploy")));
        assert_eq!(child.expand_text("${parent.region}/${name}"), "us-west/deploy");
    }

    #[test]
    fn test_unresolved_reference_left_intact() {
        let state = State::new();
        assert_eq!(state.expand_text("keep ${missing.path}"), "keep ${missing.path}");
    }

    #[test]
    fn test_cyclic_reference_is_bounded() {
        let state = State::new();
        state.put("a", json!("${b}"));
        state.put("b", json!("${a}"));
        // Expansion terminates and leaves a reference behind.
        let expanded = state.expand_text("${a}");
        assert!(expanded.contains("${"));
    }

    #[test]
    fn test_udf_invocation() {
        let state = State::with_udfs(Arc::new(UdfRegistry::with_builtins()));
        state.put("raw", json!("42"));
        assert_eq!(state.expand(&json!("${AsInt($raw)}")), json!(42));
        assert_eq!(state.expand(&json!("${AsInt(7)}")), json!(7));
        // Unknown UDFs stay textual.
        assert_eq!(state.expand_text("${Nope(1)}"), "${Nope(1)}");
    }

    #[test]
    fn test_fork_isolates_top_level_entries() {
        let original = State::new();
        original.put("kept", json!("yes"));
        let fork = original.fork();
        fork.put("kept", json!("no"));
        fork.put("extra", json!(1));
        assert_eq!(original.get("kept"), Some(json!("yes")));
        assert!(!original.has("extra"));
    }

    #[test]
    fn test_apply_merges_shallowly() {
        let state = State::new();
        state.put("a", json!(1));
        let mut other = Map::new();
        other.insert("b".to_string(), json!(2));
        state.apply(&other);
        assert_eq!(state.get("a"), Some(json!(1)));
        assert_eq!(state.get("b"), Some(json!(2)));
    }
}
