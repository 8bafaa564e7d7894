//! Persisted partial-result stores.
//!
//! Each stage owns one line-delimited JSON file. Loading tolerates malformed
//! lines (skipped with a warning) and de-duplicates by `question_id`, last
//! line wins. Saving rewrites the whole file through a temporary file in the
//! same directory and renames it into place, so an interrupted save never
//! leaves a partially written store behind.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::task::{QuestionId, StageRecord};
use crate::error::StoreError;

/// Reads every well-formed line of a JSONL file.
///
/// A missing file reads as empty. Blank lines are ignored; lines that do not
/// parse as `T` are logged and skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut items = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping malformed record"
            ),
        }
    }
    Ok(items)
}

/// Writes `items` as JSONL, replacing `path` atomically.
pub fn write_jsonl_atomic<'a, T, I>(path: &Path, items: I) -> Result<(), StoreError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

    let temp = NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
    let mut writer = BufWriter::new(temp);
    let mut count = 0usize;
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer
            .write_all(b"\n")
            .map_err(|e| StoreError::io(path, e))?;
        count += 1;
    }
    let temp = writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    temp.persist(path).map_err(|e| StoreError::Persist {
        path: path.to_path_buf(),
        message: e.error.to_string(),
    })?;

    debug!(path = %path.display(), records = count, "Wrote JSONL file");
    Ok(())
}

/// Partial-result store for one stage.
#[derive(Debug, Clone)]
pub struct PartialResultStore {
    path: PathBuf,
}

impl PartialResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the authoritative record set: one record per `question_id`,
    /// the last line seen for an id winning, in first-seen order.
    ///
    /// Records whose fields do not fit the task's field types are skipped,
    /// so their questions count as pending on the next run.
    pub fn load(&self) -> Result<Vec<StageRecord>, StoreError> {
        let raw: Vec<StageRecord> = read_jsonl(&self.path)?
            .into_iter()
            .filter(|record: &StageRecord| match record.check_fields() {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        question_id = record.question_id,
                        error = %e,
                        "Skipping record with invalid fields"
                    );
                    false
                }
            })
            .collect();
        let total = raw.len();

        let mut position: HashMap<QuestionId, usize> = HashMap::new();
        let mut records: Vec<StageRecord> = Vec::with_capacity(total);
        for record in raw {
            match position.get(&record.question_id) {
                Some(&index) => records[index] = record,
                None => {
                    position.insert(record.question_id, records.len());
                    records.push(record);
                }
            }
        }

        if records.len() < total {
            debug!(
                path = %self.path.display(),
                duplicates = total - records.len(),
                "Collapsed duplicate records"
            );
        }
        Ok(records)
    }

    /// Replaces the store's contents with `records`.
    pub fn save(&self, records: &[StageRecord]) -> Result<(), StoreError> {
        write_jsonl_atomic(&self.path, records)
    }
}
