//! Semantic JSON comparison
//!
//! Compares an expected (left) value against an actual (right) value
//! under the `:control` annotation mini-language. Object comparison
//! walks every expected key; array comparison is a set-subset match by
//! default and a strictly monotonic scan with `order_matters`.

mod control;
mod number;

use std::collections::HashSet;

use serde_json::Value;

pub use control::Control;
pub use number::number_eq;

use control::render;

/// A single comparison failure, carrying the path it occurred at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub key: String,
    pub message: String,
}

impl Failure {
    fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Failure {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.key, self.message)
        }
    }
}

/// Outcome of a comparison
#[derive(Debug, Clone)]
pub struct CompareResult {
    pub equal: bool,
    pub failures: Vec<Failure>,
}

/// Per-level comparison settings, carried into nested containers per
/// the `depth` propagation rules.
#[derive(Debug, Clone, Copy)]
struct Settings {
    no_extra: bool,
    element_no_extra: bool,
    order_matters: bool,
    depth: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            no_extra: false,
            element_no_extra: false,
            order_matters: false,
            depth: 0,
        }
    }
}

impl Settings {
    fn from_control(ctrl: &Control) -> Settings {
        Settings {
            no_extra: ctrl.no_extra.unwrap_or(false),
            element_no_extra: ctrl.element_no_extra.unwrap_or(false),
            order_matters: ctrl.order_matters.unwrap_or(false),
            depth: ctrl.depth.unwrap_or(0),
        }
    }

    /// Settings applied to each element of an array compared under
    /// `self`. `depth` governs whether `no_extra`/`order_matters`
    /// carry into nested containers: -1 is unlimited, positive values
    /// count remaining levels, everything else stops propagation.
    fn for_elements(self) -> Settings {
        let propagate = self.depth == -1 || self.depth > 0;
        Settings {
            no_extra: self.element_no_extra || (propagate && self.no_extra),
            element_no_extra: false,
            order_matters: propagate && self.order_matters,
            depth: if self.depth > 0 { self.depth - 1 } else { self.depth },
        }
    }
}

/// Compare expected `left` against actual `right`. The left value is
/// cloned before walking so repeated comparisons stay idempotent.
pub fn compare(left: &Value, right: &Value) -> CompareResult {
    let left = left.clone();
    let mut failures = Vec::new();
    compare_value("", &left, right, Settings::default(), &mut failures);
    CompareResult {
        equal: failures.is_empty(),
        failures,
    }
}

fn compare_value(path: &str, left: &Value, right: &Value, s: Settings, failures: &mut Vec<Failure>) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => object_compare(path, l, r, s, failures),
        (Value::Array(l), Value::Array(r)) => array_compare(path, l, r, s, failures),
        (Value::Number(l), Value::Number(r)) => {
            if !number_eq(l, r) {
                failures.push(Failure::new(path, format!("expected '{}', got '{}'", l, r)));
            }
        }
        (Value::String(l), Value::String(r)) => {
            if l != r {
                failures.push(Failure::new(path, format!("expected '{}', got '{}'", l, r)));
            }
        }
        (Value::Bool(l), Value::Bool(r)) => {
            if l != r {
                failures.push(Failure::new(path, format!("expected '{}', got '{}'", l, r)));
            }
        }
        (Value::Null, Value::Null) => {}
        _ => failures.push(Failure::new(
            path,
            format!(
                "expected type {} ('{}'), got type {} ('{}')",
                type_name(left),
                render(left),
                type_name(right),
                render(right)
            ),
        )),
    }
}

fn object_compare(
    path: &str,
    left: &serde_json::Map<String, Value>,
    right: &serde_json::Map<String, Value>,
    s: Settings,
    failures: &mut Vec<Failure>,
) {
    let mut visited: HashSet<&str> = HashSet::new();

    for (key, lval) in left {
        if let Some(base) = key.strip_suffix(":control") {
            // Control annotations without a sibling value run their
            // checks standalone.
            if !left.contains_key(base) {
                visited.insert(base);
                control_only(path, base, lval, right, failures);
            }
            continue;
        }

        visited.insert(key.as_str());
        let child_path = join_key(path, key);
        let ctrl = match left.get(&format!("{}:control", key)) {
            Some(cv) => match Control::parse(&child_path, cv) {
                Ok(c) => c,
                Err(f) => {
                    failures.push(f);
                    continue;
                }
            },
            None => Control::default(),
        };

        if ctrl.must_not_exist == Some(true) {
            if right.contains_key(key) {
                failures.push(Failure::new(
                    &child_path,
                    "was found, but should NOT exist".to_string(),
                ));
            }
            continue;
        }

        match right.get(key) {
            None => failures.push(Failure::new(
                &child_path,
                "was not found, but should exist".to_string(),
            )),
            Some(rval) => {
                let guard = ctrl.check(&child_path, rval);
                if !guard.is_empty() {
                    failures.extend(guard);
                    continue;
                }
                compare_value(&child_path, lval, rval, Settings::from_control(&ctrl), failures);
            }
        }
    }

    if s.no_extra {
        for rkey in right.keys() {
            if !visited.contains(rkey.as_str()) {
                failures.push(Failure::new(
                    join_key(path, rkey),
                    "was not expected (no_extra)".to_string(),
                ));
            }
        }
    }
}

fn control_only(
    path: &str,
    base: &str,
    ctrl_value: &Value,
    right: &serde_json::Map<String, Value>,
    failures: &mut Vec<Failure>,
) {
    let child_path = join_key(path, base);
    let ctrl = match Control::parse(&child_path, ctrl_value) {
        Ok(c) => c,
        Err(f) => {
            failures.push(f);
            return;
        }
    };

    match right.get(base) {
        Some(_) if ctrl.must_not_exist == Some(true) => failures.push(Failure::new(
            &child_path,
            "was found, but should NOT exist".to_string(),
        )),
        Some(rval) => failures.extend(ctrl.check(&child_path, rval)),
        None => {
            if ctrl.must_exist == Some(true) {
                failures.push(Failure::new(
                    &child_path,
                    "was not found, but should exist".to_string(),
                ));
            }
        }
    }
}

fn array_compare(
    path: &str,
    left: &[Value],
    right: &[Value],
    s: Settings,
    failures: &mut Vec<Failure>,
) {
    if left.len() > right.len() {
        failures.push(Failure::new(
            path,
            format!(
                "expected at least {} elements, got {}: expected {}, actual {}",
                left.len(),
                right.len(),
                Value::Array(left.to_vec()),
                Value::Array(right.to_vec())
            ),
        ));
        return;
    }

    let elem_s = s.for_elements();
    let mut claimed = vec![false; right.len()];

    if s.order_matters {
        let mut next = 0;
        for (i, le) in left.iter().enumerate() {
            let hit = (next..right.len()).find(|&j| diff(le, &right[j], elem_s).is_empty());
            match hit {
                Some(j) => {
                    claimed[j] = true;
                    next = j + 1;
                }
                None => failures.push(Failure::new(
                    join_idx(path, i),
                    format!("element {} not found in array in proper order", i),
                )),
            }
        }
    } else {
        for (i, le) in left.iter().enumerate() {
            let elem_path = join_idx(path, i);
            let mut best: Option<Vec<Failure>> = None;
            let mut hit = None;
            for (j, claimed_j) in claimed.iter().enumerate() {
                if *claimed_j {
                    continue;
                }
                let fs = diff_at(&elem_path, le, &right[j], elem_s);
                if fs.is_empty() {
                    hit = Some(j);
                    break;
                }
                if best.as_ref().map_or(true, |b| fs.len() < b.len()) {
                    best = Some(fs);
                }
            }
            match hit {
                Some(j) => claimed[j] = true,
                None => {
                    failures.push(Failure::new(
                        &elem_path,
                        format!("element {} not found in array", i),
                    ));
                    if let Some(b) = best {
                        failures.extend(b);
                    }
                }
            }
        }
    }

    if s.no_extra {
        for (j, claimed_j) in claimed.iter().enumerate() {
            if !*claimed_j {
                failures.push(Failure::new(
                    join_idx(path, j),
                    "was not expected (no_extra)".to_string(),
                ));
            }
        }
    }
}

fn diff(left: &Value, right: &Value, s: Settings) -> Vec<Failure> {
    diff_at("", left, right, s)
}

fn diff_at(path: &str, left: &Value, right: &Value, s: Settings) -> Vec<Failure> {
    let mut failures = Vec::new();
    compare_value(path, left, right, s, &mut failures);
    failures
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn join_idx(path: &str, i: usize) -> String {
    format!("{}[{}]", path, i)
}
