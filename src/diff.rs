//! Structural JSON deltas for delta-mode subscriptions.
//!
//! A [`Delta`] describes how to turn one JSON value into another. Objects and
//! arrays are patched member-by-member; anything else is replaced wholesale.
//! The law the broadcaster relies on is `apply(old, diff(old, new)) == new`.

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Difference between two JSON values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    /// Values are equal.
    Unchanged,
    /// Replace the whole value.
    Replace { value: Value },
    /// Patch members of an object.
    Object {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        set: BTreeMap<String, Delta>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        remove: Vec<String>,
    },
    /// Resize an array to `len`, then patch the listed `(index, delta)` pairs.
    Array {
        len: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        set: Vec<(usize, Delta)>,
    },
}

impl Delta {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Delta::Unchanged)
    }
}

/// Compute the delta that turns `old` into `new`.
pub fn diff(old: &Value, new: &Value) -> Delta {
    if old == new {
        return Delta::Unchanged;
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b)) => diff_objects(a, b),
        (Value::Array(a), Value::Array(b)) => diff_arrays(a, b),
        _ => Delta::Replace { value: new.clone() },
    }
}

fn diff_objects(old: &Map<String, Value>, new: &Map<String, Value>) -> Delta {
    let mut set = BTreeMap::new();
    let mut remove = Vec::new();

    for (key, old_val) in old {
        match new.get(key) {
            Some(new_val) => {
                let d = diff(old_val, new_val);
                if !d.is_unchanged() {
                    set.insert(key.clone(), d);
                }
            }
            None => remove.push(key.clone()),
        }
    }

    for (key, new_val) in new {
        if !old.contains_key(key) {
            set.insert(key.clone(), Delta::Replace { value: new_val.clone() });
        }
    }

    Delta::Object { set, remove }
}

fn diff_arrays(old: &[Value], new: &[Value]) -> Delta {
    let mut set = Vec::new();

    for (idx, new_val) in new.iter().enumerate() {
        let d = match old.get(idx) {
            Some(old_val) => diff(old_val, new_val),
            None => Delta::Replace { value: new_val.clone() },
        };
        if !d.is_unchanged() {
            set.push((idx, d));
        }
    }

    Delta::Array { len: new.len(), set }
}

/// Apply `delta` to `base`, producing the patched value.
///
/// Fails if the delta's shape does not match the base, which means the
/// receiver's copy has diverged from the sender's.
pub fn apply(base: &Value, delta: &Delta) -> Result<Value> {
    match delta {
        Delta::Unchanged => Ok(base.clone()),
        Delta::Replace { value } => Ok(value.clone()),
        Delta::Object { set, remove } => {
            let Value::Object(map) = base else {
                return Err(DbError::InvalidOperation(format!(
                    "object delta applied to {}",
                    kind(base)
                )));
            };
            let mut map = map.clone();
            for key in remove {
                map.remove(key);
            }
            for (key, d) in set {
                let current = map.get(key).cloned().unwrap_or(Value::Null);
                map.insert(key.clone(), apply(&current, d)?);
            }
            Ok(Value::Object(map))
        }
        Delta::Array { len, set } => {
            let Value::Array(items) = base else {
                return Err(DbError::InvalidOperation(format!(
                    "array delta applied to {}",
                    kind(base)
                )));
            };
            let mut items = items.clone();
            items.resize(*len, Value::Null);
            for (idx, d) in set {
                if *idx >= items.len() {
                    return Err(DbError::InvalidOperation(format!(
                        "array delta index {} out of bounds (len {})",
                        idx,
                        items.len()
                    )));
                }
                items[*idx] = apply(&items[*idx], d)?;
            }
            Ok(Value::Array(items))
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values_are_unchanged() {
        let v = json!({"a": [1, 2, {"b": true}]});
        assert!(diff(&v, &v).is_unchanged());
    }

    #[test]
    fn test_object_delta_only_touches_changed_keys() {
        let old = json!({"total": 6, "count": 3, "gone": "x"});
        let new = json!({"total": 10, "count": 3, "added": [1]});

        let delta = diff(&old, &new);
        match &delta {
            Delta::Object { set, remove } => {
                assert_eq!(set.len(), 2);
                assert!(set.contains_key("total"));
                assert!(set.contains_key("added"));
                assert_eq!(remove, &vec!["gone".to_string()]);
            }
            other => panic!("expected object delta, got {:?}", other),
        }
        assert_eq!(apply(&old, &delta).unwrap(), new);
    }

    #[test]
    fn test_array_shrink_and_grow() {
        let old = json!([1, 2, 3, 4]);
        let shorter = json!([1, 5]);
        let longer = json!([1, 2, 3, 4, 5, 6]);

        assert_eq!(apply(&old, &diff(&old, &shorter)).unwrap(), shorter);
        assert_eq!(apply(&old, &diff(&old, &longer)).unwrap(), longer);
    }

    #[test]
    fn test_type_change_replaces() {
        let delta = diff(&json!({"a": 1}), &json!([1]));
        assert_eq!(delta, Delta::Replace { value: json!([1]) });
    }

    #[test]
    fn test_wire_shape() {
        let delta = diff(&json!({"sum": 6}), &json!({"sum": 10}));
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            json!({"op": "object", "set": {"sum": {"op": "replace", "value": 10}}})
        );

        let parsed: Delta = serde_json::from_value(serde_json::to_value(&delta).unwrap()).unwrap();
        assert_eq!(parsed, delta);
    }

    #[test]
    fn test_mismatched_base_is_rejected() {
        let delta = diff(&json!({"a": 1}), &json!({"a": 2}));
        assert!(apply(&json!(3), &delta).is_err());
    }
}
