use serde_json::Value;

/// Canonical JSON text: object keys sorted lexicographically at every depth,
/// arrays kept in order, no insignificant whitespace.
///
/// Scalars go through `Value`'s `Display`, which emits compact JSON and
/// cannot fail, so the encoder is infallible.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical JSON as bytes, the input to every digest in the ledger.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

/// Canonical bytes of a JSON object with the named top-level fields removed.
/// Used to hash a record "excluding its own hash".
pub fn canonical_bytes_without(value: &Value, excluded: &[&str]) -> Vec<u8> {
    match value {
        Value::Object(map) => {
            let mut trimmed = map.clone();
            for field in excluded {
                trimmed.remove(*field);
            }
            canonical_json_bytes(&Value::Object(trimmed))
        }
        other => canonical_json_bytes(other),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_keys_sorted() {
        let input = json!({"run": {"z": 1, "a": [3, 1]}, "actor": "alice"});
        assert_eq!(
            canonical_json(&input),
            r#"{"actor":"alice","run":{"a":[3,1],"z":1}}"#
        );
    }

    #[test]
    fn strings_are_escaped() {
        let input = json!({"text": "line\n\"quoted\""});
        assert_eq!(canonical_json(&input), r#"{"text":"line\n\"quoted\""}"#);
    }

    #[test]
    fn excluded_fields_do_not_reach_the_digest_input() {
        let input = json!({"id": "evt_1", "hash": "abc", "kind": "run.started"});
        let bytes = canonical_bytes_without(&input, &["hash"]);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"id":"evt_1","kind":"run.started"}"#
        );
    }

    #[test]
    fn key_order_of_input_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":null,"x":true}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":true,"y":null},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
