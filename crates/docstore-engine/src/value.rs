//! Document value semantics: matching, merging, projection and ordering

use std::cmp::Ordering;

use serde_json::{Map, Value};

use docstore_common::query::{Direction, OrderBy, Projection};

/// True when every field of `filter` is present in `doc` with an equal value.
///
/// Nested objects in the filter match as subsets of the document's object.
pub fn matches(doc: &Value, filter: &Map<String, Value>) -> bool {
    let Value::Object(fields) = doc else {
        return false;
    };

    filter.iter().all(|(key, expected)| match fields.get(key) {
        Some(actual) => match (expected, actual) {
            (Value::Object(sub), Value::Object(_)) => matches(actual, sub),
            _ => values_equal(expected, actual),
        },
        None => false,
    })
}

/// Structural equality with numeric comparison for numbers
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Merge `patch` into `base`, recursing into objects present on both sides
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested = value.is_object() && target.get(key).map_or(false, Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Keep only the projected fields of a document (or of each element of an array)
pub fn pluck(value: &Value, projection: &Projection) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::new();
            for (name, nested) in projection.iter() {
                if let Some(field) = fields.get(name) {
                    let kept = match nested {
                        Some(inner) => pluck(field, inner),
                        None => field.clone(),
                    };
                    out.insert(name.to_string(), kept);
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| pluck(v, projection)).collect()),
        other => other.clone(),
    }
}

/// Total order over JSON values.
///
/// Types order as arrays < booleans < null < numbers < objects < strings.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Array(_) => 0,
            Value::Bool(_) => 1,
            Value::Null => 2,
            Value::Number(_) => 3,
            Value::Object(_) => 4,
            Value::String(_) => 5,
        }
    }

    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            for (a, b) in x.iter().zip(y) {
                let ord = compare(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Object(x), Value::Object(y)) => {
            let mut xs: Vec<_> = x.iter().collect();
            let mut ys: Vec<_> = y.iter().collect();
            xs.sort_by(|a, b| a.0.cmp(b.0));
            ys.sort_by(|a, b| a.0.cmp(b.0));
            for ((ka, va), (kb, vb)) in xs.iter().zip(&ys) {
                let ord = ka.cmp(kb).then_with(|| compare(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Stable sort by the given keys. Documents missing a key sort first.
pub fn sort(docs: &mut [Value], order: &OrderBy) {
    docs.sort_by(|a, b| {
        for key in order.keys() {
            let ord = match (a.get(&key.field), b.get(&key.field)) {
                (Some(x), Some(y)) => compare(x, y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ord = match key.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
