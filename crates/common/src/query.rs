//! Dotted JSON path queries
//!
//! The query language used by `qjson`, `store_response_qjson`, and
//! `SetWithQuery`: dot-separated segments where an integer segment
//! indexes an array, `#` yields an array's length, and anything else
//! looks up an object key. Keys containing a literal dot can escape it
//! with `\.`.

use serde_json::Value;

/// Apply a dotted query to a value. Returns `None` when any segment
/// fails to resolve.
pub fn query(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in split_segments(path) {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => {
                if segment == "#" {
                    return Some(Value::from(items.len()));
                }
                let idx: i64 = segment.parse().ok()?;
                let idx = if idx < 0 { items.len() as i64 + idx } else { idx };
                if idx < 0 {
                    return None;
                }
                items.get(idx as usize)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

fn split_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '.' => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_walk() {
        let v = json!({"load": {"me": "loaded"}});
        assert_eq!(query(&v, "load.me"), Some(json!("loaded")));
        assert_eq!(query(&v, "load.missing"), None);
    }

    #[test]
    fn test_array_index() {
        let v = json!({"rows": [{"id": 1}, {"id": 2}]});
        assert_eq!(query(&v, "rows.1.id"), Some(json!(2)));
        assert_eq!(query(&v, "rows.-1.id"), Some(json!(2)));
        assert_eq!(query(&v, "rows.2"), None);
        assert_eq!(query(&v, "rows.x"), None);
    }

    #[test]
    fn test_array_length() {
        let v = json!([1, 2, 3]);
        assert_eq!(query(&v, "#"), Some(json!(3)));
    }

    #[test]
    fn test_escaped_dot() {
        let v = json!({"a.b": 7});
        assert_eq!(query(&v, "a\\.b"), Some(json!(7)));
    }

    #[test]
    fn test_empty_path_returns_value() {
        let v = json!({"x": 1});
        assert_eq!(query(&v, ""), Some(v.clone()));
    }
}
