//! Filter matching, value ordering and update application.
//!
//! Filters support field equality (dotted paths) and array containment.
//! Updates are `$inc` / `$set` operator documents or whole-document
//! replacements.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// True when `doc` satisfies every clause of `filter`.
pub fn matches(filter: &Value, doc: &Value) -> StoreResult<bool> {
    let clauses = match filter {
        Value::Null => return Ok(true),
        Value::Object(clauses) => clauses,
        other => return Err(StoreError::BadRequest(format!("filter must be an object: {other}"))),
    };
    for (path, expected) in clauses {
        if path.starts_with('$') {
            return Err(StoreError::BadRequest(format!("unsupported filter operator {path}")));
        }
        let hit = match lookup(doc, path) {
            None => expected.is_null(),
            Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
            Some(actual) => actual == expected,
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Value at a dotted `path`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, key| current.get(key))
}

/// Total order over JSON values: null, numbers, strings, objects, arrays, booleans.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Bool(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x.cmp(&y);
            }
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

/// Apply `update` to `doc` in place.
pub fn apply_update(doc: &mut Value, update: &Value) -> StoreResult<()> {
    let Value::Object(spec) = update else {
        return Err(StoreError::BadUpdate(format!("update must be an object, got {update}")));
    };
    let operators = spec.keys().filter(|k| k.starts_with('$')).count();
    if operators == 0 {
        return replace(doc, spec);
    }
    if operators != spec.len() {
        return Err(StoreError::BadUpdate(
            "cannot mix update operators and plain fields".to_string(),
        ));
    }

    for (op, fields) in spec {
        let Value::Object(fields) = fields else {
            return Err(StoreError::BadUpdate(format!("{op} expects an object")));
        };
        for (path, operand) in fields {
            if path == "_id" {
                return Err(StoreError::BadUpdate("_id is immutable".to_string()));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone())?,
                "$inc" => {
                    let current = lookup(doc, path).cloned().unwrap_or(Value::from(0));
                    set_path(doc, path, add(&current, operand)?)?;
                }
                other => {
                    return Err(StoreError::BadUpdate(format!("unknown update operator {other}")));
                }
            }
        }
    }
    Ok(())
}

/// Starting document for an upsert: the equality clauses of `filter`.
pub fn upsert_seed(filter: &Value) -> StoreResult<Value> {
    let mut doc = Value::Object(Map::new());
    if let Value::Object(clauses) = filter {
        for (path, value) in clauses {
            set_path(&mut doc, path, value.clone())?;
        }
    }
    Ok(doc)
}

fn replace(doc: &mut Value, replacement: &Map<String, Value>) -> StoreResult<()> {
    let id = doc.get("_id").cloned();
    if let (Some(old), Some(new)) = (&id, replacement.get("_id"))
        && old != new
    {
        return Err(StoreError::BadUpdate("_id is immutable".to_string()));
    }
    let mut next = replacement.clone();
    if let Some(id) = id {
        next.insert("_id".to_string(), id);
    }
    *doc = Value::Object(next);
    Ok(())
}

fn add(current: &Value, operand: &Value) -> StoreResult<Value> {
    let (Value::Number(a), Value::Number(b)) = (current, operand) else {
        return Err(StoreError::BadUpdate(format!(
            "cannot apply $inc to non-number ({current} + {operand})"
        )));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64())
        && let Some(sum) = a.checked_add(b)
    {
        return Ok(Value::from(sum));
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Ok(Value::from(sum))
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> StoreResult<()> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(key) = parts.next() {
        let Value::Object(map) = current else {
            return Err(StoreError::BadUpdate(format!(
                "cannot set {path}: parent is not an object"
            )));
        };
        if parts.peek().is_none() {
            map.insert(key.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}
