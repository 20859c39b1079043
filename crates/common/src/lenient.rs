//! Lenient JSON parsing for manifests
//!
//! Manifests are JSON with two tolerated extensions: `#` line comments
//! (stripped by the template renderer before parsing) and trailing
//! commas, handled here.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Parse manifest JSON, tolerating trailing commas.
pub fn parse<T: DeserializeOwned>(input: &str) -> Result<T> {
    let cleaned = strip_trailing_commas(input);
    serde_json::from_str(&cleaned).map_err(|e| Error::ManifestLoad(format!("malformed JSON: {}", e)))
}

/// Parse manifest JSON into a dynamic value.
pub fn parse_value(input: &str) -> Result<Value> {
    parse(input)
}

/// Remove commas that directly precede a closing `}` or `]`, outside of
/// string literals.
pub fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_comma: Option<usize> = None;

    for c in input.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                pending_comma = None;
                out.push(c);
            }
            ',' => {
                pending_comma = Some(out.len());
                out.push(c);
            }
            '}' | ']' => {
                if let Some(pos) = pending_comma.take() {
                    out.remove(pos);
                }
                out.push(c);
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                pending_comma = None;
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trailing_comma_object() {
        let v: Value = parse(r#"{"a": 1, "b": [1, 2, ], }"#).unwrap();
        assert_eq!(v, json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn test_comma_inside_string_untouched() {
        let v: Value = parse(r#"{"a": "x,}"}"#).unwrap();
        assert_eq!(v, json!({"a": "x,}"}));
    }

    #[test]
    fn test_plain_json_passthrough() {
        let v: Value = parse(r#"{"a": [1, 2], "b": {"c": true}}"#).unwrap();
        assert_eq!(v, json!({"a": [1, 2], "b": {"c": true}}));
    }

    #[test]
    fn test_malformed_is_manifest_load_error() {
        let err = parse::<Value>("{nope").unwrap_err();
        assert!(matches!(err, Error::ManifestLoad(_)));
    }
}
