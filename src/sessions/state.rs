//! Scoped key-value state with pending-change tracking.
//!
//! A [`State`] keeps a `base` map (last committed view) and a `delta` map
//! (changes not yet flushed). Reads consult the delta first, so the combined
//! view is always `base` overlaid with `delta`.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

pub type StateMap = HashMap<String, Value>;

/// Shared across all sessions of an application.
pub const KEY_PREFIX_APP: &str = "app:";
/// Shared across all sessions of a user.
pub const KEY_PREFIX_USER: &str = "user:";
/// Ephemeral; never persisted.
pub const KEY_PREFIX_TEMP: &str = "temp:";

pub fn is_temp_key(key: &str) -> bool {
    key.starts_with(KEY_PREFIX_TEMP)
}

/// Copy of `map` without `temp:` keys.
pub fn without_temp_keys(map: &StateMap) -> StateMap {
    map.iter()
        .filter(|(key, _)| !is_temp_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Debug, Default)]
struct StateInner {
    base: StateMap,
    delta: StateMap,
}

impl StateInner {
    fn combined(&self) -> StateMap {
        let mut merged = self.base.clone();
        merged.extend(self.delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Thread-safe key-value state owned by one session.
#[derive(Debug, Default)]
pub struct State {
    inner: Mutex<StateInner>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// State whose committed view is `base` and which has no pending changes.
    pub fn from_map(base: StateMap) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                base,
                delta: StateMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock();
        inner
            .delta
            .get(key)
            .or_else(|| inner.base.get(key))
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.base.insert(key.clone(), value.clone());
        inner.delta.insert(key, value);
    }

    /// Bulk-apply a committed delta into both maps.
    pub fn update(&self, delta: &StateMap) {
        if delta.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for (key, value) in delta {
            inner.base.insert(key.clone(), value.clone());
            inner.delta.insert(key.clone(), value.clone());
        }
    }

    /// Swap in a freshly committed view and drop pending changes.
    pub fn replace(&self, base: StateMap) {
        let mut inner = self.inner.lock();
        inner.base = base;
        inner.delta.clear();
    }

    /// Merged snapshot; the caller owns the copy.
    pub fn to_map(&self) -> StateMap {
        self.inner.lock().combined()
    }

    /// Merged snapshot without `temp:` keys.
    pub fn durable_snapshot(&self) -> StateMap {
        without_temp_keys(&self.to_map())
    }

    pub fn has_delta(&self) -> bool {
        !self.inner.lock().delta.is_empty()
    }

    pub fn delta(&self) -> StateMap {
        self.inner.lock().delta.clone()
    }

    pub fn clear_delta(&self) {
        let mut inner = self.inner.lock();
        let StateInner { base, delta } = &mut *inner;
        base.extend(delta.drain());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner.delta.contains_key(key) || inner.base.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.to_map().len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.base.is_empty() && inner.delta.is_empty()
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            inner: Mutex::new(StateInner {
                base: inner.base.clone(),
                delta: inner.delta.clone(),
            }),
        }
    }
}

impl From<StateMap> for State {
    fn from(base: StateMap) -> Self {
        Self::from_map(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn delta_shadows_base() {
        let state = State::from_map(StateMap::from([("x".to_string(), json!(1))]));
        assert_eq!(state.get("x"), Some(json!(1)));
        assert!(!state.has_delta());

        state.set("x", json!(2));
        assert_eq!(state.get("x"), Some(json!(2)));
        assert!(state.has_delta());
        assert_eq!(state.delta().get("x"), Some(&json!(2)));
    }

    #[test]
    fn missing_key_is_none() {
        let state = State::new();
        assert_eq!(state.get("nope"), None);
        assert!(state.is_empty());
    }

    #[test]
    fn to_map_is_a_detached_copy() {
        let state = State::new();
        state.set("a", json!("one"));
        let mut snapshot = state.to_map();
        snapshot.insert("b".into(), json!("two"));
        state.set("c", json!(3));

        assert!(!state.contains_key("b"));
        assert!(!snapshot.contains_key("c"));
    }

    #[test]
    fn clear_delta_keeps_combined_view() {
        let state = State::new();
        state.update(&StateMap::from([
            ("k1".to_string(), json!(true)),
            ("k2".to_string(), json!({"nested": [1, 2]})),
        ]));
        let before = state.to_map();
        state.clear_delta();
        assert!(!state.has_delta());
        assert_eq!(state.to_map(), before);
    }

    #[test]
    fn replace_drops_pending_changes() {
        let state = State::new();
        state.set("old", json!(1));
        state.replace(StateMap::from([("new".to_string(), json!(2))]));
        assert!(!state.has_delta());
        assert_eq!(state.get("old"), None);
        assert_eq!(state.get("new"), Some(json!(2)));
    }

    #[test]
    fn durable_snapshot_excludes_temp_keys() {
        let state = State::new();
        state.set("user:name", json!("ada"));
        state.set("temp:scratch", json!("x"));
        let durable = state.durable_snapshot();
        assert!(durable.contains_key("user:name"));
        assert!(!durable.contains_key("temp:scratch"));
        assert!(state.contains_key("temp:scratch"));
    }

    #[test]
    fn concurrent_writers_on_disjoint_keys_all_survive() {
        let state = Arc::new(State::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        state.set(format!("k{i}-{j}"), json!(j));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.len(), 8 * 50);
    }
}
