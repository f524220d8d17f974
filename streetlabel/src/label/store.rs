use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::jsonl::{read_records_lenient, record_id};

/// One labeled image, one line of the label file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: String,
    pub content: String,
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    Ok(())
}

/// Append-only label file with an in-memory index of the ids it holds.
///
/// The index is rebuilt by one scan of the file on open; malformed lines are
/// skipped with a warning. Every append is written and flushed immediately.
pub struct LabelStore {
    path: PathBuf,
    ids: HashSet<String>,
    file: Option<File>,
}

impl LabelStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut ids = HashSet::new();

        if path.exists() {
            let scan = read_records_lenient(&path)?;
            ids.extend(scan.records.iter().filter_map(record_id));
            info!(
                "Loaded {} previously processed records from {:?}",
                ids.len(),
                path
            );
        }

        Ok(LabelStore {
            path,
            ids,
            file: None,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append `record` unless its id is already stored.
    /// Returns whether a line was written.
    pub fn append(&mut self, record: &LabelRecord) -> Result<bool> {
        if self.ids.contains(&record.id) {
            debug!(id = %record.id, "Label already stored, not appending");
            return Ok(false);
        }

        let line = serde_json::to_string(record)?;
        let path = self.path.clone();
        let file = self.writer()?;
        writeln!(file, "{}", line)
            .and_then(|_| file.flush())
            .with_context(|| format!("Failed to append to {:?}", path))?;

        self.ids.insert(record.id.clone());
        Ok(true)
    }

    fn writer(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            ensure_parent(&self.path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open label file: {:?}", self.path))?;
            self.file = Some(file);
        }
        // Populated just above
        self.file
            .as_mut()
            .context("Label file handle missing")
    }
}

/// Image paths that failed during the current cycle, one per line.
/// Creating the log truncates whatever the previous cycle left.
pub struct FailureLog {
    path: PathBuf,
    file: File,
    entries: usize,
}

impl FailureLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create failure log: {:?}", path))?;
        Ok(FailureLog {
            path,
            file,
            entries: 0,
        })
    }

    pub fn record(&mut self, image_path: &Path) -> Result<()> {
        writeln!(self.file, "{}", image_path.display())
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to write failure log: {:?}", self.path))?;
        self.entries += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Entries of an existing log; a missing log has none
    pub fn read_entries<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file =
            File::open(path).with_context(|| format!("Failed to open failure log: {:?}", path))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("Failed to read failure log: {:?}", path))?;
            let entry = line.trim();
            if !entry.is_empty() {
                entries.push(entry.to_string());
            }
        }
        Ok(entries)
    }

    /// Replace the log content with `entries`
    pub fn rewrite<P: AsRef<Path>>(path: P, entries: &[String]) -> Result<()> {
        let mut log = Self::create(path)?;
        for entry in entries {
            log.record(Path::new(entry))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, content: &str) -> LabelRecord {
        LabelRecord {
            id: id.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_store_rebuilds_index_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Data/city_label.jsonl");

        let mut store = LabelStore::open(&path).unwrap();
        assert!(store.is_empty());
        assert!(store.append(&record("1", "house")).unwrap());
        assert!(store.append(&record("2", "shop")).unwrap());

        let reopened = LabelStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.contains("1"));
        assert!(reopened.contains("2"));
    }

    #[test]
    fn test_store_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.jsonl");

        let mut store = LabelStore::open(&path).unwrap();
        assert!(store.append(&record("1", "house")).unwrap());
        assert!(!store.append(&record("1", "again")).unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_store_skips_malformed_lines_and_normalizes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"\\\"7\\\"\",\"content\":\"a\"}\n{broken\n{\"id\":8,\"content\":\"b\"}\n",
        )
        .unwrap();

        let store = LabelStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains("7"));
        assert!(store.contains("8"));
    }

    #[test]
    fn test_failure_log_truncates_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.txt");
        std::fs::write(&path, "old/1.jpg\n").unwrap();

        let mut log = FailureLog::create(&path).unwrap();
        assert!(log.is_empty());
        log.record(Path::new("img/2.jpg")).unwrap();
        log.record(Path::new("img/3.jpg")).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(
            FailureLog::read_entries(&path).unwrap(),
            vec!["img/2.jpg", "img/3.jpg"]
        );

        FailureLog::rewrite(&path, &["img/3.jpg".to_string()]).unwrap();
        assert_eq!(FailureLog::read_entries(&path).unwrap(), vec!["img/3.jpg"]);
    }

    #[test]
    fn test_missing_failure_log_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FailureLog::read_entries(dir.path().join("none.txt"))
            .unwrap()
            .is_empty());
    }
}
