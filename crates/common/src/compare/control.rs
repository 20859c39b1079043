//! The `:control` annotation mini-language
//!
//! In expected objects, a sibling key `foo:control` holding an object
//! configures how key `foo` is compared.

use regex::Regex;
use serde::Deserialize;
use serde_json::{Number, Value};

use super::number::number_eq;
use super::Failure;

/// Parsed control annotation for one key
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Control {
    pub must_exist: Option<bool>,
    pub must_not_exist: Option<bool>,

    pub is_string: Option<bool>,
    pub is_number: Option<bool>,
    pub is_bool: Option<bool>,
    pub is_array: Option<bool>,
    pub is_object: Option<bool>,

    pub element_count: Option<u64>,
    pub no_extra: Option<bool>,
    pub element_no_extra: Option<bool>,
    pub order_matters: Option<bool>,
    pub depth: Option<i64>,

    pub number_gt: Option<Number>,
    pub number_ge: Option<Number>,
    pub number_lt: Option<Number>,
    pub number_le: Option<Number>,

    #[serde(rename = "match")]
    pub match_: Option<String>,
    pub not_match: Option<String>,
    pub starts_with: Option<String>,
    pub ends_with: Option<String>,

    pub not_equal: Option<Value>,
}

impl Control {
    /// Parse a control annotation object. Unknown keys are an error so
    /// typos do not silently pass.
    pub fn parse(key: &str, value: &Value) -> Result<Control, Failure> {
        serde_json::from_value(value.clone()).map_err(|e| Failure {
            key: key.to_string(),
            message: format!("invalid control annotation: {}", e),
        })
    }

    fn bounds(&self) -> [(&'static str, Option<&Number>, fn(f64, f64) -> bool); 4] {
        [
            ("greater than", self.number_gt.as_ref(), |a, b| a > b),
            ("greater or equal to", self.number_ge.as_ref(), |a, b| a >= b),
            ("less than", self.number_lt.as_ref(), |a, b| a < b),
            ("less or equal to", self.number_le.as_ref(), |a, b| a <= b),
        ]
    }

    /// Run all value-level checks against `actual`. Returns the
    /// collected failures; a non-empty result suppresses the value
    /// comparison for this key.
    pub fn check(&self, path: &str, actual: &Value) -> Vec<Failure> {
        let mut failures = Vec::new();
        let mut fail = |message: String| {
            failures.push(Failure {
                key: path.to_string(),
                message,
            })
        };

        let type_checks: [(&str, Option<bool>, bool); 5] = [
            ("string", self.is_string, actual.is_string()),
            ("number", self.is_number, actual.is_number()),
            ("bool", self.is_bool, actual.is_boolean()),
            ("array", self.is_array, actual.is_array()),
            ("object", self.is_object, actual.is_object()),
        ];
        for (name, wanted, is) in type_checks {
            if wanted == Some(true) && !is {
                fail(format!("'{}' is not of type {}", render(actual), name));
            }
        }

        // Numeric bounds imply is_number
        if self.has_bounds() {
            match actual.as_f64() {
                Some(v) => {
                    for (desc, bound, op) in self.bounds() {
                        if let Some(b) = bound {
                            let b = b.as_f64().unwrap_or(f64::NAN);
                            if !op(v, b) {
                                fail(format!("'{}' is not {} '{}'", render(actual), desc, b));
                            }
                        }
                    }
                }
                None => fail(format!("'{}' is not of type number", render(actual))),
            }
        }

        if let Some(n) = self.element_count {
            match actual.as_array() {
                Some(items) if items.len() as u64 == n => {}
                Some(items) => fail(format!(
                    "length of array is {}, expected {}",
                    items.len(),
                    n
                )),
                None => fail(format!("'{}' is not of type array", render(actual))),
            }
        }

        if let Some(re) = &self.match_ {
            match compile(re) {
                Ok(re_c) => {
                    if !re_c.is_match(&render(actual)) {
                        fail(format!(
                            "'{}' does not match regex '{}'",
                            render(actual),
                            re
                        ));
                    }
                }
                Err(e) => fail(e),
            }
        }
        if let Some(re) = &self.not_match {
            match compile(re) {
                Ok(re_c) => {
                    if re_c.is_match(&render(actual)) {
                        fail(format!("'{}' matches regex '{}', but should not", render(actual), re));
                    }
                }
                Err(e) => fail(e),
            }
        }

        if let Some(prefix) = &self.starts_with {
            match actual.as_str() {
                Some(s) if s.starts_with(prefix.as_str()) => {}
                Some(s) => fail(format!("'{}' does not start with '{}'", s, prefix)),
                None => fail(format!("'{}' is not of type string", render(actual))),
            }
        }
        if let Some(suffix) = &self.ends_with {
            match actual.as_str() {
                Some(s) if s.ends_with(suffix.as_str()) => {}
                Some(s) => fail(format!("'{}' does not end with '{}'", s, suffix)),
                None => fail(format!("'{}' is not of type string", render(actual))),
            }
        }

        if let Some(forbidden) = &self.not_equal {
            if not_equal_violated(forbidden, actual) {
                fail(format!(
                    "'{}' is equal to '{}', but should not be",
                    render(actual),
                    render(forbidden)
                ));
            }
        }

        failures
    }

    fn has_bounds(&self) -> bool {
        self.number_gt.is_some()
            || self.number_ge.is_some()
            || self.number_lt.is_some()
            || self.number_le.is_some()
    }
}

/// Differing types always satisfy `not_equal`.
fn not_equal_violated(forbidden: &Value, actual: &Value) -> bool {
    match (forbidden, actual) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => number_eq(a, b),
        (Value::Array(_), Value::Array(_)) => super::compare(forbidden, actual).equal,
        _ => false,
    }
}

/// Stringify a value the way regex/report messages show it: strings
/// raw, everything else as its JSON text.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compile(re: &str) -> Result<Regex, String> {
    Regex::new(re).map_err(|e| format!("invalid regex '{}': {}", re, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let v = json!({"is_strnig": true});
        assert!(Control::parse("x", &v).is_err());
    }

    #[test]
    fn test_regex_match() {
        let ctrl = Control::parse("x", &json!({"is_string": true, "match": "^\\d+\\.\\d+$"})).unwrap();
        assert!(ctrl.check("x", &json!("12.34")).is_empty());
        let failures = ctrl.check("x", &json!("12"));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("does not match regex"));
    }

    #[test]
    fn test_bounds_imply_number() {
        let ctrl = Control::parse("x", &json!({"number_gt": 5})).unwrap();
        assert!(ctrl.check("x", &json!(6)).is_empty());
        assert!(!ctrl.check("x", &json!(5)).is_empty());
        let failures = ctrl.check("x", &json!("six"));
        assert!(failures[0].message.contains("not of type number"));
    }

    #[test]
    fn test_element_count() {
        let ctrl = Control::parse("x", &json!({"element_count": 2})).unwrap();
        assert!(ctrl.check("x", &json!([1, 2])).is_empty());
        assert!(!ctrl.check("x", &json!([1])).is_empty());
    }

    #[test]
    fn test_not_equal() {
        let ctrl = Control::parse("x", &json!({"not_equal": "a"})).unwrap();
        assert!(!ctrl.check("x", &json!("a")).is_empty());
        assert!(ctrl.check("x", &json!("b")).is_empty());
        // Differing types always satisfy
        assert!(ctrl.check("x", &json!(5)).is_empty());
    }

    #[test]
    fn test_starts_ends_with() {
        let ctrl = Control::parse("x", &json!({"starts_with": "ab", "ends_with": "yz"})).unwrap();
        assert!(ctrl.check("x", &json!("ab..yz")).is_empty());
        assert_eq!(ctrl.check("x", &json!("nope")).len(), 2);
    }
}
