//! Per-suite datastore
//!
//! A keyed store of arbitrary JSON values plus the ordered list of
//! response snapshots recorded by previous test cases. Shared across
//! all parallel workers of a suite; writes serialize under a writer
//! lock, reads return cloned values so callers may mutate them freely.
//!
//! Key grammar: `key` writes/reads directly, `key[idx]` addresses a
//! sub-slot (integer `idx` infers a list, anything else a map),
//! `key[]` appends to a list, an integer key (possibly negative)
//! indexes the response list, and `-` reads the whole user map.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::query;

static SUBSLOT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)\[(.+)\]$").unwrap());

#[derive(Debug, Default)]
struct Inner {
    storage: Map<String, Value>,
    responses: Vec<Value>,
}

/// Process-wide store of values and prior responses for one suite run
#[derive(Debug, Default)]
pub struct Datastore {
    inner: RwLock<Inner>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, interpreting the sub-slot grammar.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let value = coerce_number(value);
        debug!(target: "datastore", key, value = %value, "set");
        let mut inner = self.inner.write();

        if let Some(name) = key.strip_suffix("[]") {
            let slot = inner
                .storage
                .entry(name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            slot.as_array_mut().unwrap().push(value);
            return Ok(());
        }

        if let Some(caps) = SUBSLOT_RE.captures(key) {
            let name = caps.get(1).unwrap().as_str();
            let idx = caps.get(2).unwrap().as_str();
            return set_subslot(&mut inner.storage, name, idx, value);
        }

        inner.storage.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove a key from the user storage.
    pub fn delete(&self, key: &str) {
        debug!(target: "datastore", key, "delete");
        self.inner.write().storage.remove(key);
    }

    /// Store every entry of `map`.
    pub fn set_map(&self, map: Map<String, Value>) -> Result<()> {
        for (k, v) in map {
            self.set(&k, v)?;
        }
        Ok(())
    }

    /// Read a value. Missing map slots yield the empty string; only
    /// response-list indexing can fail with an out-of-bounds error.
    pub fn get(&self, key: &str) -> Result<Value> {
        let inner = self.inner.read();

        if key == "-" {
            return Ok(Value::Object(inner.storage.clone()));
        }

        if let Ok(idx) = key.parse::<i64>() {
            return get_response(&inner.responses, idx);
        }

        if let Some(caps) = SUBSLOT_RE.captures(key) {
            let name = caps.get(1).unwrap().as_str();
            let idx = caps.get(2).unwrap().as_str();
            let container = inner
                .storage
                .get(name)
                .ok_or_else(|| Error::DataStoreKey(name.to_string()))?;
            return get_subslot(container, name, idx);
        }

        Ok(inner
            .storage
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new())))
    }

    /// Append a response snapshot to the response list.
    pub fn append_response(&self, snapshot: Value) {
        self.inner.write().responses.push(snapshot);
    }

    /// Overwrite the most recent response snapshot; appends when the
    /// list is still empty.
    pub fn update_last_response(&self, snapshot: Value) {
        let mut inner = self.inner.write();
        match inner.responses.last_mut() {
            Some(last) => *last = snapshot,
            None => inner.responses.push(snapshot),
        }
    }

    /// Number of recorded response snapshots.
    pub fn response_count(&self) -> usize {
        self.inner.read().responses.len()
    }

    /// Apply every query of `queries` (storage key → query expression)
    /// to `json` and store the results. Unresolved queries are skipped,
    /// unless the expression carries a leading `!`, which deletes the
    /// storage key instead.
    pub fn set_with_query(&self, json: &Value, queries: &HashMap<String, String>) -> Result<()> {
        for (key, expr) in queries {
            let (expr, delete_on_miss) = match expr.strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (expr.as_str(), false),
            };
            match query::query(json, expr) {
                Some(v) => self.set(key, v)?,
                None if delete_on_miss => self.delete(key),
                None => {}
            }
        }
        Ok(())
    }
}

fn set_subslot(storage: &mut Map<String, Value>, name: &str, idx: &str, value: Value) -> Result<()> {
    match idx.parse::<i64>() {
        Ok(i) => {
            let slot = storage
                .entry(name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let arr = slot.as_array_mut().unwrap();
            let pos = if i < 0 { arr.len() as i64 + i } else { i };
            if pos < 0 {
                return Err(Error::DataStoreIndex { index: i, len: arr.len() });
            }
            let pos = pos as usize;
            while arr.len() <= pos {
                arr.push(Value::Null);
            }
            arr[pos] = value;
            Ok(())
        }
        Err(_) => {
            let slot = storage
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            slot.as_object_mut().unwrap().insert(idx.to_string(), value);
            Ok(())
        }
    }
}

fn get_subslot(container: &Value, name: &str, idx: &str) -> Result<Value> {
    match container {
        Value::Array(items) => {
            let i: i64 = idx.parse().map_err(|_| Error::DataStoreIndexType {
                key: name.to_string(),
                index: idx.to_string(),
            })?;
            let pos = if i < 0 { items.len() as i64 + i } else { i };
            if pos < 0 || pos as usize >= items.len() {
                return Ok(Value::String(String::new()));
            }
            Ok(items[pos as usize].clone())
        }
        Value::Object(map) => Ok(map
            .get(idx)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()))),
        _ => Ok(Value::String(String::new())),
    }
}

fn get_response(responses: &[Value], idx: i64) -> Result<Value> {
    let len = responses.len();
    let pos = if idx < 0 { len as i64 + idx } else { idx };
    if pos < 0 || pos as usize >= len {
        return Err(Error::DataStoreIndex { index: idx, len });
    }
    Ok(responses[pos as usize].clone())
}

/// Collapse floats with a zero fractional part into integers so that
/// template arithmetic round-trips through the store.
pub fn coerce_number(value: Value) -> Value {
    if let Value::Number(n) = &value {
        if n.as_i64().is_none() && n.as_u64().is_none() {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 {
                    return Value::Number(Number::from(f as i64));
                }
            }
        }
    }
    value
}
