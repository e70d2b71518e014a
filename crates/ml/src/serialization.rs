//! Canonical JSON for metadata records
//!
//! Object keys are sorted recursively and output uses a two-space indent,
//! so two runs with identical results write byte-identical metadata.

use serde::Serialize;
use serde_json::{map::Map, ser::PrettyFormatter, Serializer, Value};
use std::io::Write;

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, val)| (key, canonicalize(val)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Write `value` as canonical JSON followed by a trailing newline.
pub fn write_canonical_json<T, W>(mut writer: W, value: &T) -> Result<(), serde_json::Error>
where
    T: Serialize,
    W: Write,
{
    let canonical = canonicalize(serde_json::to_value(value)?);
    let mut serializer =
        Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"  "));
    canonical.serialize(&mut serializer)?;
    writer.write_all(b"\n").map_err(serde_json::Error::io)?;
    Ok(())
}

pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();
    write_canonical_json(&mut buffer, value)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": [{"y": 1, "x": 2}], "c": null}});
        let text = String::from_utf8(canonical_json_bytes(&value).unwrap()).unwrap();

        let a = text.find("\"a\"").unwrap();
        let b = text.find("\"b\"").unwrap();
        let x = text.find("\"x\"").unwrap();
        let y = text.find("\"y\"").unwrap();
        assert!(a < b);
        assert!(x < y);
        assert!(text.starts_with("{\n  \"a\""));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_output_is_stable() {
        let value = json!({"target": "Moisture", "features": ["Temparature", "Humidity"]});
        assert_eq!(
            canonical_json_bytes(&value).unwrap(),
            canonical_json_bytes(&value).unwrap()
        );
    }
}
