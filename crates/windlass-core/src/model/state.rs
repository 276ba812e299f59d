//! Run state: a flat record of named JSON values
//!
//! Nodes receive an immutable snapshot of the state and return a patch;
//! the executor merges patches atomically with last-writer-wins semantics
//! at the field level.

use serde::{Deserialize, Serialize};

/// A partial state update returned by a node
pub type StatePatch = serde_json::Map<String, serde_json::Value>;

/// The shared state record of a run
///
/// # Example
///
/// ```
/// use windlass_core::model::RunState;
/// use serde_json::json;
///
/// let mut state = RunState::new();
/// state.set("count", json!(1));
/// assert_eq!(state.get_i64("count"), Some(1));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl RunState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from an existing record
    pub fn from_patch(fields: StatePatch) -> Self {
        Self { fields }
    }

    /// Create a state from a JSON value
    ///
    /// Non-object values produce an empty state; workflow state is always
    /// a flat record.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    /// Get a field
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Get a field as an integer
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(|v| v.as_i64())
    }

    /// Get a field as a float
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| v.as_f64())
    }

    /// Get a field as a string slice
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Get a field as a boolean
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(|v| v.as_bool())
    }

    /// Set a field
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
    }

    /// Merge a patch into the state, last writer wins per field
    pub fn merge(&mut self, patch: StatePatch) {
        for (key, value) in patch {
            self.fields.insert(key, value);
        }
    }

    /// Whether a field is present
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the state has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.fields.iter()
    }

    /// The state as a JSON object value
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.fields.clone())
    }

    /// Consume into the underlying record
    pub fn into_patch(self) -> StatePatch {
        self.fields
    }
}

/// Convenience for building a patch from key/value pairs
///
/// ```
/// use windlass_core::model::patch;
/// use serde_json::json;
///
/// let p = patch([("x", json!(1)), ("y", json!("two"))]);
/// assert_eq!(p.len(), 2);
/// ```
pub fn patch<I, K>(entries: I) -> StatePatch
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let mut state = RunState::new();
        state.set("name", json!("order-7"));
        state.set("count", json!(3));
        state.set("done", json!(true));

        assert_eq!(state.get_str("name"), Some("order-7"));
        assert_eq!(state.get_i64("count"), Some(3));
        assert_eq!(state.get_bool("done"), Some(true));
        assert_eq!(state.get("missing"), None);
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut state = RunState::from_value(json!({"x": 1, "y": 2}));
        state.merge(patch([("y", json!(20)), ("z", json!(30))]));

        assert_eq!(state.get_i64("x"), Some(1));
        assert_eq!(state.get_i64("y"), Some(20));
        assert_eq!(state.get_i64("z"), Some(30));
    }

    #[test]
    fn test_from_non_object_value_is_empty() {
        let state = RunState::from_value(json!([1, 2, 3]));
        assert!(state.is_empty());
    }

    #[test]
    fn test_serialization_is_transparent() {
        let state = RunState::from_value(json!({"a": 1}));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"a":1}"#);

        let parsed: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, parsed);
    }
}
