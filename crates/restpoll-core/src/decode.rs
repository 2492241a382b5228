//! Response decoding.
//!
//! Response shapes are structs, so a payload that is a bare JSON array has no
//! field to land in. Such arrays are wrapped as `{"items": [...]}` before the
//! typed decode: a top-level array, and any array that is itself an element
//! of another array. Arrays held by object keys stay arrays.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::AppError;

/// Parse `body` as JSON, wrap incompatible arrays and decode into `T`.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, AppError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AppError::DecodeError(format!("response is not valid JSON: {e}")))?;
    decode_value(value)
}

/// Decode an already parsed payload into `T`.
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T, AppError> {
    serde_json::from_value(wrap_lists(value)).map_err(|e| AppError::DecodeError(e.to_string()))
}

/// Rewrite `value` so every array that cannot map onto a struct field is
/// wrapped in an `items` object.
pub fn wrap_lists(value: Value) -> Value {
    match value {
        Value::Array(items) => wrap(items),
        other => walk(other),
    }
}

fn wrap(items: Vec<Value>) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(
        "items".to_string(),
        Value::Array(items.into_iter().map(element).collect()),
    );
    Value::Object(map)
}

fn element(value: Value) -> Value {
    match value {
        Value::Array(items) => wrap(items),
        other => walk(other),
    }
}

fn walk(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, walk(v))).collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(element).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: i64,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct ItemList {
        items: Vec<Item>,
    }

    #[test]
    fn top_level_array_matches_items_object() {
        let from_list: ItemList = decode(r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        let from_object: ItemList = decode(r#"{"items": [{"id": 1}, {"id": 2}]}"#).unwrap();
        assert_eq!(from_list, from_object);
        assert_eq!(from_list.items.len(), 2);
    }

    #[test]
    fn nested_arrays_are_wrapped() {
        let value = wrap_lists(json!([[1, 2], [3]]));
        assert_eq!(
            value,
            json!({"items": [{"items": [1, 2]}, {"items": [3]}]})
        );

        #[derive(Deserialize)]
        struct Inner {
            items: Vec<i64>,
        }
        #[derive(Deserialize)]
        struct Outer {
            items: Vec<Inner>,
        }
        let outer: Outer = decode("[[1, 2], [3]]").unwrap();
        assert_eq!(outer.items[0].items, vec![1, 2]);
        assert_eq!(outer.items[1].items, vec![3]);
    }

    #[test]
    fn arrays_under_keys_stay_arrays() {
        let value = wrap_lists(json!({"tags": ["a", "b"], "grid": [[1], [2]]}));
        assert_eq!(
            value,
            json!({"tags": ["a", "b"], "grid": [{"items": [1]}, {"items": [2]}]})
        );
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(wrap_lists(json!(3)), json!(3));
        assert_eq!(wrap_lists(json!(null)), json!(null));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = decode::<ItemList>("{not json").unwrap_err();
        assert!(matches!(err, AppError::DecodeError(_)));
    }

    #[test]
    fn shape_mismatch_is_a_decode_error() {
        let err = decode::<ItemList>(r#"{"items": [{"id": "one"}]}"#).unwrap_err();
        assert!(matches!(err, AppError::DecodeError(_)));
    }
}
