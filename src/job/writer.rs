// ABOUTME: Writes serializable values to disk as indented, key-sorted JSON
// ABOUTME: Output ends with a blank line; files are replaced unless appending

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    #[default]
    Truncate,
    Append,
}

/// Render `value` as JSON with four-space indentation and keys sorted at every level.
pub fn to_sorted_json<T>(value: &T) -> Result<String>
where
    T: Serialize + ?Sized,
{
    let value = sort_keys(serde_json::to_value(value).context("Failed to convert value to JSON")?);

    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .context("Failed to serialize JSON")?;

    let mut text = String::from_utf8(buf).context("Serialized JSON was not UTF-8")?;
    text.push_str("\n\n");
    Ok(text)
}

pub fn write_json_to_file<T>(value: &T, path: impl AsRef<Path>, mode: WriteMode) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let path = path.as_ref();
    let text = to_sorted_json(value)?;

    let mut options = OpenOptions::new();
    match mode {
        WriteMode::Truncate => options.write(true).create(true).truncate(true),
        WriteMode::Append => options.append(true).create(true),
    };
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open {} for writing", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    info!(path = %path.display(), ?mode, bytes = text.len(), "Wrote JSON file");
    Ok(())
}

// Rebuilds maps in key order so sorting holds even if serde_json keeps insertion order
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_output_parses_back_to_input() {
        let value = json!({
            "properties": {"nodeCount": 2, "inputDirectories": [{"path": "/x", "id": "SCRIPTS"}]},
            "$schema": "https://example.com/job.json"
        });
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.json");
        write_json_to_file(&value, &path, WriteMode::Truncate).unwrap();

        let parsed: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_keys_sorted_and_indented() {
        let value = json!({"b": {"z": 1, "a": [{"y": true, "x": null}]}, "a": "first"});
        let text = to_sorted_json(&value).unwrap();
        let expected = r#"{
    "a": "first",
    "b": {
        "a": [
            {
                "x": null,
                "y": true
            }
        ],
        "z": 1
    }
}

"#;
        assert_eq!(text, expected);
    }

    #[test]
    fn test_truncate_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.json");
        write_json_to_file(&json!({"stale": 1, "keep": 1}), &path, WriteMode::Truncate).unwrap();
        write_json_to_file(&json!({"keep": 2}), &path, WriteMode::Truncate).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("stale"));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"keep": 2}));
    }

    #[test]
    fn test_append_keeps_previous_documents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        write_json_to_file(&json!({"n": 1}), &path, WriteMode::Append).unwrap();
        write_json_to_file(&json!({"n": 2}), &path, WriteMode::Append).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"n\": 1\n}\n\n{\n    \"n\": 2\n}\n\n");
    }
}
