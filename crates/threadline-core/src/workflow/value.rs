//! JSON value helpers shared by resolution, transition evaluation and the
//! built-in condition functions.

use serde_json::Value;

/// Convert a JSON value to a display string for template interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Normalize boolean-looking strings (`"true"`, `"False"`) to booleans.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        other => other,
    }
}

/// JavaScript-like truthiness, applied after [`normalize`].
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numeric view of a number or a numeric string.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Equality after normalization; numbers compare numerically across types.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    normalize(left.clone()) == normalize(right.clone())
}

/// Ordering for `>`/`<` style comparisons: numeric when both sides are
/// numeric, lexical when both are strings, otherwise undefined.
pub fn loose_cmp(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Membership: substring for strings, element for arrays, key for objects.
pub fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&value_to_string(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => map.contains_key(&value_to_string(needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!("Ava")), "Ava");
        assert_eq!(value_to_string(&json!(3)), "3");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&Value::Null), "null");
        assert_eq!(value_to_string(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_normalize_boolean_strings() {
        assert_eq!(normalize(json!("true")), json!(true));
        assert_eq!(normalize(json!(" FALSE ")), json!(false));
        assert_eq!(normalize(json!("yes")), json!("yes"));
        assert_eq!(normalize(json!(1)), json!(1));
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!(0.5)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!([])));
        assert!(!is_truthy(&normalize(json!("false"))));
    }

    #[test]
    fn test_loose_equality() {
        assert!(loose_eq(&json!("3"), &json!(3)));
        assert!(loose_eq(&json!(2.0), &json!(2)));
        assert!(loose_eq(&json!("true"), &json!(true)));
        assert!(!loose_eq(&json!("Ava"), &json!("ava")));
        assert!(loose_eq(&json!({"a": 1}), &json!({"a": 1})));
    }

    #[test]
    fn test_loose_ordering() {
        assert_eq!(loose_cmp(&json!("10"), &json!(9)), Some(Ordering::Greater));
        assert_eq!(loose_cmp(&json!("apple"), &json!("banana")), Some(Ordering::Less));
        assert_eq!(loose_cmp(&json!(true), &json!(1)), None);
    }

    #[test]
    fn test_contains() {
        assert!(contains(&json!("I feel great"), &json!("great")));
        assert!(contains(&json!(["a", 2]), &json!("2")));
        assert!(contains(&json!({"name": "x"}), &json!("name")));
        assert!(!contains(&json!(5), &json!(5)));
    }
}
