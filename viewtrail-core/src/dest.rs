use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde_json::Value;

/// Parses `key=value&key=value` pairs. A `+` is kept as is; a repeated key
/// keeps its last value.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in query.split('&') {
        let mut pieces = part.split('=');
        let key = pieces.next().unwrap_or_default().to_lowercase();
        let value = pieces.next().unwrap_or_default();
        params.insert(decode_component(&key), decode_component(value));
    }
    params
}

fn decode_component(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

pub fn unescape_hash(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let text: &str = decoded.as_ref();
    text.strip_prefix('#').unwrap_or(text).to_string()
}

/// Reads the `page` parameter the way a lenient integer cast would: fractions
/// are truncated and anything unparsable becomes zero.
pub fn page_from_hash(hash: &str) -> i64 {
    parse_query_string(hash)
        .get("page")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .map(|value| value.trunc() as i64)
        .unwrap_or(0)
}

pub fn is_valid_rotation(rotation: i32) -> bool {
    rotation % 90 == 0
}

pub fn is_dest_hashes_equal(dest_hash: Option<&str>, push_hash: &str) -> bool {
    let Some(dest_hash) = dest_hash else {
        return false;
    };
    if dest_hash == push_hash {
        return true;
    }
    parse_query_string(dest_hash)
        .get("nameddest")
        .map_or(false, |named| named == push_hash)
}

// Nested arrays never compare equal; numbers compare by value.
pub fn is_dest_arrays_equal(first: Option<&[Value]>, second: Option<&[Value]>) -> bool {
    let (Some(first), Some(second)) = (first, second) else {
        return false;
    };
    first.len() == second.len()
        && first
            .iter()
            .zip(second)
            .all(|(a, b)| is_entry_equal(a, b))
}

fn is_entry_equal(first: &Value, second: &Value) -> bool {
    match (first, second) {
        (Value::Array(_), _) | (_, Value::Array(_)) => false,
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.get(key)
                        .map_or(false, |other| is_entry_equal(value, other))
                })
        }
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn array(value: Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items,
            other => panic!("not an array: {:?}", other),
        }
    }

    #[test]
    fn hashes_equal_when_identical() {
        assert!(is_dest_hashes_equal(Some("page=3"), "page=3"));
        assert!(!is_dest_hashes_equal(Some("page=3"), "page=4"));
    }

    #[test]
    fn hashes_equal_through_nameddest_parameter() {
        assert!(is_dest_hashes_equal(Some("nameddest=foo"), "foo"));
        assert!(is_dest_hashes_equal(Some("page=2&nameddest=foo"), "foo"));
        assert!(!is_dest_hashes_equal(Some("nameddest=foo"), "bar"));
    }

    #[test]
    fn hashes_never_equal_without_recorded_hash() {
        assert!(!is_dest_hashes_equal(None, "page=3"));
    }

    #[test]
    fn arrays_equal_compares_objects_by_value() {
        let a = array(json!([1, { "a": 1 }]));
        let b = array(json!([1, { "a": 1 }]));
        let c = array(json!([1, { "a": 2 }]));
        assert!(is_dest_arrays_equal(Some(a.as_slice()), Some(b.as_slice())));
        assert!(!is_dest_arrays_equal(Some(a.as_slice()), Some(c.as_slice())));
    }

    #[test]
    fn arrays_of_different_length_differ() {
        let a = array(json!([1, 2]));
        let b = array(json!([1, 2, 3]));
        assert!(!is_dest_arrays_equal(Some(a.as_slice()), Some(b.as_slice())));
    }

    #[test]
    fn arrays_with_nested_arrays_never_match() {
        let a = array(json!([[1]]));
        assert!(!is_dest_arrays_equal(Some(a.as_slice()), Some(a.clone().as_slice())));
    }

    #[test]
    fn arrays_match_integer_and_float_forms() {
        let a = array(json!([{ "num": 4, "gen": 0 }, { "name": "XYZ" }, 0, 792.0, null]));
        let b = array(json!([{ "num": 4, "gen": 0 }, { "name": "XYZ" }, 0.0, 792, null]));
        assert!(is_dest_arrays_equal(Some(a.as_slice()), Some(b.as_slice())));
    }

    #[test]
    fn arrays_reject_mismatched_object_keys() {
        let a = array(json!([{ "a": 1 }]));
        let b = array(json!([{ "b": 1 }]));
        assert!(!is_dest_arrays_equal(Some(a.as_slice()), Some(b.as_slice())));
        assert!(!is_dest_arrays_equal(None, Some(b.as_slice())));
    }

    #[test]
    fn query_string_lowercases_keys_and_decodes_values() {
        let params = parse_query_string("Page=4&nameddest=chapter%201&zoom=auto");
        assert_eq!(params.get("page").map(String::as_str), Some("4"));
        assert_eq!(params.get("nameddest").map(String::as_str), Some("chapter 1"));
        assert_eq!(params.get("zoom").map(String::as_str), Some("auto"));
    }

    #[test]
    fn query_string_keeps_plus_signs() {
        let params = parse_query_string("nameddest=a+b&search=x%2By");
        assert_eq!(params.get("nameddest").map(String::as_str), Some("a+b"));
        assert_eq!(params.get("search").map(String::as_str), Some("x+y"));
    }

    #[test]
    fn query_string_takes_text_up_to_the_second_equals() {
        let params = parse_query_string("zoom=page-fit=extra&flag");
        assert_eq!(params.get("zoom").map(String::as_str), Some("page-fit"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn hashes_equal_through_nameddest_with_plus() {
        assert!(is_dest_hashes_equal(Some("nameddest=a+b"), "a+b"));
        assert!(!is_dest_hashes_equal(Some("nameddest=a+b"), "a b"));
    }

    #[test]
    fn page_from_hash_is_lenient() {
        assert_eq!(page_from_hash("page=5"), 5);
        assert_eq!(page_from_hash("page=5.7&zoom=100"), 5);
        assert_eq!(page_from_hash("page=abc"), 0);
        assert_eq!(page_from_hash("nameddest=intro"), 0);
    }

    #[test]
    fn unescape_hash_strips_marker() {
        assert_eq!(unescape_hash("#page=5"), "page=5");
        assert_eq!(unescape_hash("#nameddest=a%20b"), "nameddest=a b");
        assert_eq!(unescape_hash(""), "");
    }

    #[test]
    fn rotation_must_be_right_angle() {
        assert!(is_valid_rotation(0));
        assert!(is_valid_rotation(270));
        assert!(is_valid_rotation(-90));
        assert!(!is_valid_rotation(45));
    }
}
