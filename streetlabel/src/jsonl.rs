//! JSON-lines helpers shared by every stage: id normalization, lenient and strict
//! readers, and the merge-by-id used to join building records with labels.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub type Record = Map<String, Value>;

/// Normalize an id value to its string form, without surrounding quotes.
/// Numeric ids (as written by the Overpass stage) and string ids (as written by
/// the labeling stage) for the same building compare equal.
pub fn normalize_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim_matches('"').to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn record_id(record: &Record) -> Option<String> {
    record.get("id").and_then(normalize_id)
}

/// Records of a JSONL source read leniently
#[derive(Debug, Default)]
pub struct JsonlScan {
    pub records: Vec<Record>,
    /// Lines that were not a JSON object with a usable `id`
    pub skipped: usize,
}

/// Read every line that is a JSON object carrying an `id`; anything else is
/// skipped with a warning. Blank lines are ignored silently.
pub fn read_records_lenient(path: &Path) -> Result<JsonlScan> {
    let file = File::open(path).with_context(|| format!("Failed to open JSONL file: {:?}", path))?;
    let mut scan = JsonlScan::default();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line from {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(record)) if record_id(&record).is_some() => scan.records.push(record),
            Ok(_) => {
                warn!("Skipping line {} of {:?}: not an object with an id", index + 1, path);
                scan.skipped += 1;
            }
            Err(e) => {
                warn!("Error decoding JSON from file {:?} line {}: {}", path, index + 1, e);
                scan.skipped += 1;
            }
        }
    }

    Ok(scan)
}

/// Read every line as a JSON object, failing on the first bad line
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("Failed to open JSONL file: {:?}", path))?;
    let mut records = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line from {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("Invalid JSON on line {} of {:?}", index + 1, path))?;
        match value {
            Value::Object(record) => records.push(record),
            _ => anyhow::bail!("Line {} of {:?} is not a JSON object", index + 1, path),
        }
    }

    Ok(records)
}

/// Write one compact JSON object per line, creating parent directories
pub fn write_records<'a, I>(path: &Path, records: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a Record>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    let mut count = 0;
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {:?}", path))?;
    Ok(count)
}

/// Union of records by normalized id, keeping first-seen id order
#[derive(Debug, Default)]
pub struct MergedRecords {
    order: Vec<String>,
    by_id: HashMap<String, Record>,
}

impl MergedRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields of `record` overwrite fields already merged under the same id
    pub fn insert(&mut self, record: Record) -> bool {
        let Some(id) = record_id(&record) else {
            return false;
        };
        match self.by_id.get_mut(&id) {
            Some(existing) => existing.extend(record),
            None => {
                self.order.push(id.clone());
                self.by_id.insert(id, record);
            }
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub output: PathBuf,
    pub records: usize,
    pub skipped_lines: usize,
}

/// Merge two JSONL sources by id into `output`.
/// When both define an id, fields from `second` win. A missing source counts as empty.
pub fn merge_jsonl(first: &Path, second: &Path, output: &Path) -> Result<MergeReport> {
    info!("Merging JSONL files {:?} and {:?}", first, second);

    let mut merged = MergedRecords::new();
    let mut skipped_lines = 0;

    for source in [first, second] {
        if !source.exists() {
            warn!("Merge source {:?} does not exist, treating it as empty", source);
            continue;
        }
        let scan = read_records_lenient(source)?;
        skipped_lines += scan.skipped;
        for record in scan.records {
            merged.insert(record);
        }
    }

    let records = write_records(output, merged.iter())?;
    info!("Successfully merged {} records into {:?}", records, output);

    Ok(MergeReport {
        output: output.to_path_buf(),
        records,
        skipped_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_lines(path: &Path, lines: &[&str]) {
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id(&json!("\"42\"")), Some("42".to_string()));
        assert_eq!(normalize_id(&json!(42)), Some("42".to_string()));
        assert_eq!(normalize_id(&json!(null)), None);
        assert_eq!(normalize_id(&json!(["42"])), None);
    }

    #[test]
    fn test_merge_overwrites_and_keeps_unique_fields() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("buildings.jsonl");
        let second = dir.path().join("labels.jsonl");
        let output = dir.path().join("out/merged.jsonl");
        write_lines(&first, &[r#"{"id":"1","lat":1.0}"#]);
        write_lines(&second, &[r#"{"id":"1","content":"x"}"#]);

        let report = merge_jsonl(&first, &second, &output).unwrap();
        assert_eq!(report.records, 1);

        let records = read_records(&output).unwrap();
        assert_eq!(
            Value::Object(records[0].clone()),
            json!({"id": "1", "lat": 1.0, "content": "x"})
        );
    }

    #[test]
    fn test_merge_second_source_wins_on_collision() {
        let mut merged = MergedRecords::new();
        merged.insert(json!({"id": 7, "type": "house", "height": "N/A"}).as_object().unwrap().clone());
        merged.insert(json!({"id": "7", "height": "12"}).as_object().unwrap().clone());

        let record = merged.get("7").unwrap();
        assert_eq!(record["height"], json!("12"));
        assert_eq!(record["type"], json!("house"));
        assert_eq!(record["id"], json!("7"));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_skips_only_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.jsonl");
        let second = dir.path().join("b.jsonl");
        let output = dir.path().join("merged.jsonl");
        write_lines(
            &first,
            &[
                r#"{"id":"1","lat":1.0}"#,
                r#"{"id":"2","lat":2.0"#,
                r#"{"id":"3","lat":3.0}"#,
            ],
        );
        write_lines(&second, &[r#"{"id":"3","content":"c"}"#, "[1, 2]"]);

        let report = merge_jsonl(&first, &second, &output).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.skipped_lines, 2);

        let records = read_records(&output).unwrap();
        let ids: Vec<String> = records.iter().filter_map(record_id).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(records[1]["content"], json!("c"));
    }

    #[test]
    fn test_merge_keeps_field_order_in_written_lines() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("buildings.jsonl");
        let second = dir.path().join("labels.jsonl");
        let output = dir.path().join("merged.jsonl");
        write_lines(
            &first,
            &[r#"{"lon":-73.9,"id":1,"lat":40.7,"building_type":"house"}"#],
        );
        write_lines(&second, &[r#"{"id":"1","content":"brick"}"#]);

        merge_jsonl(&first, &second, &output).unwrap();
        let content = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            content,
            "{\"lon\":-73.9,\"id\":\"1\",\"lat\":40.7,\"building_type\":\"house\",\"content\":\"brick\"}\n"
        );
    }

    #[test]
    fn test_merge_missing_source_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let second = dir.path().join("labels.jsonl");
        let output = dir.path().join("merged.jsonl");
        write_lines(&second, &[r#"{"id":"9","content":"roof"}"#]);

        let report = merge_jsonl(&dir.path().join("missing.jsonl"), &second, &output).unwrap();
        assert_eq!(report.records, 1);
    }

    #[test]
    fn test_read_records_strict_fails_on_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        write_lines(&path, &[r#"{"id":"1"}"#, "not json"]);
        assert!(read_records(&path).is_err());
    }
}
