use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

// Canonical form used for audit hashing and for serialized check payloads:
// - keys sorted lexicographically at every depth
// - no insignificant whitespace
// - integers only, so the same value always hashes the same on every platform
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_keys(v, false)?;
    Ok(serde_json::to_string(&sorted)?.into_bytes())
}

// Payloads from automated checks may legitimately carry floats (scores, ratios);
// those keep their numbers but still get stable key order.
pub fn to_sorted_pretty_bytes<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_keys(v, true)?;
    Ok(serde_json::to_vec_pretty(&sorted)?)
}

fn sort_keys(v: Value, allow_floats: bool) -> CoreResult<Value> {
    match v {
        Value::Object(map) => {
            let mut btm: BTreeMap<String, Value> = BTreeMap::new();
            for (k, vv) in map {
                btm.insert(k, sort_keys(vv, allow_floats)?);
            }
            Ok(Value::Object(btm.into_iter().collect()))
        }
        Value::Array(arr) => arr
            .into_iter()
            .map(|vv| sort_keys(vv, allow_floats))
            .collect::<CoreResult<Vec<_>>>()
            .map(Value::Array),
        Value::Number(n) if !allow_floats && !(n.is_i64() || n.is_u64()) => Err(
            CoreError::Validation("canonical JSON forbids non-integer numbers".to_string()),
        ),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::{to_canonical_bytes, to_sorted_pretty_bytes};
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_bytes() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(to_canonical_bytes(&a).unwrap(), to_canonical_bytes(&b).unwrap());
    }

    #[test]
    fn floats_rejected_for_hashing_but_kept_for_payloads() {
        let v = json!({"score": 0.5});
        assert!(to_canonical_bytes(&v).is_err());
        let pretty = String::from_utf8(to_sorted_pretty_bytes(&v).unwrap()).unwrap();
        assert!(pretty.contains("0.5"));
    }
}
