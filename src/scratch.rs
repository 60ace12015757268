//! Scratch memory: the environment's free-form key/value store.
//!
//! Keys are free-form; `answer`/`total`/`picked`/`joined`/`result` are
//! privileged only in that the Root Loop's early-stop heuristic consults
//! them by name — the interpreter itself treats every key alike.

use serde_json::{Map, Value};

/// A mapping from string keys to arbitrary JSON values.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    map: Map<String, Value>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Resolve a dotted path like `doc.rows` or `scratch.doc.rows` (the
    /// `scratch.` prefix is optional and stripped if present).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let path = strip_scratch_prefix(path);
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.map.get(first)?;
        for seg in segments {
            current = current.as_object()?.get(seg)?;
        }
        Some(current)
    }

    /// Assign `value` at a dotted path, creating intermediate objects as
    /// needed (`set {path, value}`'s implicit `scratch.` prefix).
    pub fn set_path(&mut self, path: &str, value: Value) {
        let path = strip_scratch_prefix(path);
        let segments: Vec<&str> = path.split('.').collect();
        if segments.len() == 1 {
            self.map.insert(segments[0].to_string(), value);
            return;
        }

        let mut current = &mut self.map;
        for seg in &segments[..segments.len() - 1] {
            let entry = current
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().expect("just ensured object");
        }
        current.insert(segments[segments.len() - 1].to_string(), value);
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.map
    }
}

fn strip_scratch_prefix(path: &str) -> &str {
    path.strip_prefix("scratch.").unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get_top_level() {
        let mut s = Scratch::new();
        s.set("answer", "42");
        assert_eq!(s.get("answer"), Some(&json!("42")));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut s = Scratch::new();
        s.set_path("a.b.c", json!(1));
        assert_eq!(s.get_path("a.b.c"), Some(&json!(1)));
        assert_eq!(s.get_path("scratch.a.b.c"), Some(&json!(1)));
    }

    #[test]
    fn set_path_overwrites_non_object_intermediate() {
        let mut s = Scratch::new();
        s.set("a", json!("not an object"));
        s.set_path("a.b", json!(2));
        assert_eq!(s.get_path("a.b"), Some(&json!(2)));
    }

    #[test]
    fn get_path_missing_returns_none() {
        let s = Scratch::new();
        assert_eq!(s.get_path("missing.path"), None);
    }

    #[test]
    fn keys_lists_top_level() {
        let mut s = Scratch::new();
        s.set("x", json!(1));
        s.set("y", json!(2));
        let mut keys = s.keys();
        keys.sort();
        assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
    }
}
