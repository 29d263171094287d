//! Deep merge over JSON trees.
//!
//! One rule everywhere: objects merge recursively, arrays are replaced
//! wholesale, scalars replace. Right side wins at every level.

use serde_json::Value;

/// Merge `overlay` into `base` in place, right-wins.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (key, val) in o {
                match b.get_mut(key) {
                    Some(slot) => deep_merge(slot, val),
                    None => {
                        b.insert(key.clone(), val.clone());
                    }
                }
            }
        }
        (slot, val) => *slot = val.clone(),
    }
}

/// Merge an ordered list of layers, leftmost as the base, right-wins.
///
/// Used for store updates (`defaults ⊕ existing ⊕ incoming`) and for
/// layering site headers over shared headers.
pub fn merge_layers(layers: &[&Value]) -> Value {
    let mut out = Value::Object(Default::default());
    for layer in layers {
        deep_merge(&mut out, layer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_recursively() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        deep_merge(&mut base, &json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1}));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let mut base = json!({"list": [1, 2, 3]});
        deep_merge(&mut base, &json!({"list": [9]}));
        assert_eq!(base, json!({"list": [9]}));
    }

    #[test]
    fn scalars_replace() {
        let mut base = json!({"n": 1, "s": "old"});
        deep_merge(&mut base, &json!({"n": {"deep": true}, "s": "new"}));
        assert_eq!(base, json!({"n": {"deep": true}, "s": "new"}));
    }

    #[test]
    fn layered_merge_is_right_wins() {
        let defaults = json!({"status": "PENDING", "other": {"a": 1}});
        let existing = json!({"username": "alice", "other": {"a": 2}});
        let incoming = json!({"other": {"b": 3}});
        let merged = merge_layers(&[&defaults, &existing, &incoming]);
        assert_eq!(
            merged,
            json!({
                "status": "PENDING",
                "username": "alice",
                "other": {"a": 2, "b": 3}
            })
        );
    }
}
