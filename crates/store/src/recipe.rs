//! Recipes: named, declarative specs for queries and mutations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recipe record from the reserved `recipes` collection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Recipe {
    /// Unique name across the store's recipes.
    pub name: String,

    /// Groups permitted to use the recipe. Absent = open.
    #[serde(default)]
    pub auth: Option<Vec<String>>,

    /// Query expression evaluated against the whole store.
    #[serde(default)]
    pub expression: Option<String>,

    /// Target collection for modify.
    #[serde(default)]
    pub collection: Option<String>,

    /// Expression locating `{index, record}` for a bound `$ref`.
    #[serde(default)]
    pub reference: Option<String>,

    /// Expression yielding `{key, value}` for assigning a primary key on
    /// insert.
    #[serde(default)]
    pub unique: Option<String>,

    /// Base record merged under inserts/updates, and the fallback query
    /// result.
    #[serde(default)]
    pub defaults: Option<Value>,

    /// Safe-data allowlist constraining which fields pass through.
    #[serde(default)]
    pub filter: Option<Value>,

    /// Positive = head slice, negative = tail slice on query results.
    #[serde(default)]
    pub limit: Option<i64>,

    /// Prepended to array query results.
    #[serde(default)]
    pub header: Option<Value>,
}

impl Recipe {
    /// The query fallback: `defaults`, or an empty object.
    pub fn defaults_or_empty(&self) -> Value {
        self.defaults
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

/// Apply a filter tree to a value: an allowlist where `true` keeps a field
/// and a nested object recurses. Arrays filter element-wise; values the
/// filter does not speak about are dropped. Non-object filters or values
/// pass through unchanged.
pub fn apply_filter(value: &Value, filter: &Value) -> Value {
    let Value::Object(allow) = filter else {
        return value.clone();
    };
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| apply_filter(v, filter)).collect())
        }
        Value::Object(fields) => {
            let mut out = serde_json::Map::new();
            for (key, rule) in allow {
                let Some(val) = fields.get(key) else {
                    continue;
                };
                match rule {
                    Value::Bool(true) => {
                        out.insert(key.clone(), val.clone());
                    }
                    Value::Object(_) => {
                        out.insert(key.clone(), apply_filter(val, rule));
                    }
                    _ => {}
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recipe_parses_from_store_record() {
        let recipe: Recipe = serde_json::from_value(json!({
            "name": "userList",
            "auth": ["admin"],
            "expression": "$.users",
            "limit": -5
        }))
        .unwrap();
        assert_eq!(recipe.name, "userList");
        assert_eq!(recipe.auth.as_deref(), Some(&["admin".to_string()][..]));
        assert_eq!(recipe.limit, Some(-5));
        assert!(recipe.collection.is_none());
    }

    #[test]
    fn filter_is_an_allowlist() {
        let value = json!({"username": "alice", "credentials": {"hash": "x"}, "email": "a@b.c"});
        let filter = json!({"username": true, "email": true});
        assert_eq!(
            apply_filter(&value, &filter),
            json!({"username": "alice", "email": "a@b.c"})
        );
    }

    #[test]
    fn filter_recurses_into_nested_objects() {
        let value = json!({"user": {"name": "a", "secret": "s"}, "extra": 1});
        let filter = json!({"user": {"name": true}});
        assert_eq!(apply_filter(&value, &filter), json!({"user": {"name": "a"}}));
    }

    #[test]
    fn filter_maps_over_arrays() {
        let value = json!([{"a": 1, "b": 2}, {"a": 3, "c": 4}]);
        let filter = json!({"a": true});
        assert_eq!(apply_filter(&value, &filter), json!([{"a": 1}, {"a": 3}]));
    }
}
