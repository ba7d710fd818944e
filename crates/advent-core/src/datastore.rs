use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::entry::SlotKey;

/// One persisted slot, in the document shape shared with other clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawEntry {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default, rename = "userPhotoURL")]
    pub user_photo_url: Option<String>,
    pub day: i64,
    pub year: i32,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTimestamp {
    /// Resolved with the store's clock when the write commits.
    ServerNow,
    Preserve(DateTime<Utc>),
}

/// The record a transaction wants to commit. The store assigns `id` from the
/// slot key and resolves `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWrite {
    pub user_id: String,
    pub user_name: String,
    pub user_photo_url: Option<String>,
    pub day: i64,
    pub year: i32,
    pub title: String,
    pub url: String,
    pub comment: Option<String>,
    pub created_at: WriteTimestamp,
}

impl EntryWrite {
    fn into_record(self, key: &SlotKey, now: DateTime<Utc>) -> RawEntry {
        let created_at = match self.created_at {
            WriteTimestamp::ServerNow => now,
            WriteTimestamp::Preserve(ts) => ts,
        };
        RawEntry {
            id: key.to_string(),
            user_id: self.user_id,
            user_name: self.user_name,
            user_photo_url: self.user_photo_url,
            day: self.day,
            year: self.year,
            title: self.title,
            url: self.url,
            comment: self.comment,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Write(EntryWrite),
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed(RawEntry),
    /// Carries the record the transaction observed, if any.
    Aborted(Option<RawEntry>),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt record in {path} line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode record {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The document-store boundary: a filtered query and a single-record
/// read-check-write that runs as one atomic unit.
pub trait DocumentStore {
    fn query_by_year(&self, year: i32) -> Result<Vec<RawEntry>, StoreError>;

    /// Runs `decide` against the current record at `key` while no other
    /// transaction can touch the store, then applies its decision.
    fn run_atomic<F>(&self, key: &SlotKey, decide: F) -> Result<Outcome, StoreError>
    where
        F: FnOnce(Option<&RawEntry>) -> Decision;
}

/// File-backed store: one JSON record per line in `entries.data`, guarded by
/// an advisory lock on `entries.lock` so separate handles and processes
/// serialize their transactions.
#[derive(Debug)]
pub struct JsonlStore {
    pub data_dir: PathBuf,
    pub entries_path: PathBuf,
    pub lock_path: PathBuf,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(error = %err, "failed to release store lock");
        }
    }
}

impl JsonlStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let entries_path = data_dir.join("entries.data");
        let lock_path = data_dir.join("entries.lock");

        // entries.data is only ever created by a committed transaction; a
        // missing file reads as an empty calendar.
        info!(
            data_dir = %data_dir.display(),
            entries = %entries_path.display(),
            "opened entry store"
        );

        Ok(Self {
            data_dir,
            entries_path,
            lock_path,
        })
    }

    fn lock(&self, exclusive: bool) -> Result<LockGuard, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| StoreError::io(&self.lock_path, err))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|err| StoreError::io(&self.lock_path, err))?;

        Ok(LockGuard { file })
    }

    #[tracing::instrument(skip(self))]
    pub fn load_all(&self) -> Result<Vec<RawEntry>, StoreError> {
        let _guard = self.lock(false)?;
        load_jsonl(&self.entries_path)
    }
}

impl DocumentStore for JsonlStore {
    #[tracing::instrument(skip(self))]
    fn query_by_year(&self, year: i32) -> Result<Vec<RawEntry>, StoreError> {
        let records = self.load_all()?;
        let matching: Vec<RawEntry> = records
            .into_iter()
            .filter(|record| record.year == year)
            .collect();
        debug!(year, count = matching.len(), "queried entries by year");
        Ok(matching)
    }

    #[tracing::instrument(skip(self, decide), fields(slot = %key))]
    fn run_atomic<F>(&self, key: &SlotKey, decide: F) -> Result<Outcome, StoreError>
    where
        F: FnOnce(Option<&RawEntry>) -> Decision,
    {
        let _guard = self.lock(true)?;
        let mut records = load_jsonl(&self.entries_path)?;

        let position = records.iter().rposition(|record| record.id == key.as_str());
        let current = position.map(|idx| &records[idx]);

        match decide(current) {
            Decision::Abort => {
                debug!("transaction aborted by caller");
                Ok(Outcome::Aborted(current.cloned()))
            }
            Decision::Write(write) => {
                let record = write.into_record(key, Utc::now());
                match position {
                    Some(idx) => records[idx] = record.clone(),
                    None => records.push(record.clone()),
                }
                records.sort_by_key(|r| (r.year, r.day));
                save_jsonl_atomic(&self.entries_path, &records)?;
                debug!(count = records.len(), "transaction committed");
                Ok(Outcome::Committed(record))
            }
        }
    }
}

#[tracing::instrument(skip(path))]
fn load_jsonl(path: &Path) -> Result<Vec<RawEntry>, StoreError> {
    debug!(file = %path.display(), "loading jsonl");
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| StoreError::io(path, err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: RawEntry =
            serde_json::from_str(trimmed).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded entries from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, records))]
fn save_jsonl_atomic(path: &Path, records: &[RawEntry]) -> Result<(), StoreError> {
    debug!(file = %path.display(), count = records.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir).map_err(|err| StoreError::io(dir, err))?;
    for record in records {
        let serialized = serde_json::to_string(record).map_err(|source| StoreError::Encode {
            id: record.id.clone(),
            source,
        })?;
        writeln!(temp, "{serialized}").map_err(|err| StoreError::io(temp.path(), err))?;
    }
    temp.flush().map_err(|err| StoreError::io(temp.path(), err))?;

    temp.persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::entry::Day;

    fn write_for(day: i64, user: &str, created_at: WriteTimestamp) -> EntryWrite {
        EntryWrite {
            user_id: user.to_string(),
            user_name: user.to_uppercase(),
            user_photo_url: None,
            day,
            year: 2025,
            title: format!("day {day}"),
            url: "https://example.com/post".to_string(),
            comment: None,
            created_at,
        }
    }

    fn key(day: u32) -> SlotKey {
        SlotKey::new(2025, Day::new(day).expect("valid day"))
    }

    #[test]
    fn committed_write_is_visible_to_queries() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStore::open(temp.path()).expect("open store");

        let outcome = store
            .run_atomic(&key(3), |current| {
                assert!(current.is_none());
                Decision::Write(write_for(3, "alice", WriteTimestamp::ServerNow))
            })
            .expect("transaction");

        let record = match outcome {
            Outcome::Committed(record) => record,
            other => panic!("expected commit, got {other:?}"),
        };
        assert_eq!(record.id, "2025-3");

        let listed = store.query_by_year(2025).expect("query");
        assert_eq!(listed, vec![record]);
        assert!(store.query_by_year(2024).expect("query").is_empty());
    }

    #[test]
    fn abort_reports_observed_record_and_leaves_file_untouched() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStore::open(temp.path()).expect("open store");

        store
            .run_atomic(&key(5), |_| {
                Decision::Write(write_for(5, "alice", WriteTimestamp::ServerNow))
            })
            .expect("first write");
        let before = fs::read_to_string(&store.entries_path).expect("read entries");

        let outcome = store
            .run_atomic(&key(5), |_| Decision::Abort)
            .expect("abort");
        match outcome {
            Outcome::Aborted(Some(seen)) => assert_eq!(seen.user_id, "alice"),
            other => panic!("expected abort with record, got {other:?}"),
        }

        let after = fs::read_to_string(&store.entries_path).expect("read entries");
        assert_eq!(before, after);
    }

    #[test]
    fn preserved_timestamp_survives_overwrite() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStore::open(temp.path()).expect("open store");

        let original = DateTime::parse_from_rfc3339("2025-12-01T09:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        store
            .run_atomic(&key(1), |_| {
                Decision::Write(write_for(1, "alice", WriteTimestamp::Preserve(original)))
            })
            .expect("write");

        let listed = store.query_by_year(2025).expect("query");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_at, original);
    }

    #[test]
    fn records_persist_in_document_shape() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStore::open(temp.path()).expect("open store");

        store
            .run_atomic(&key(9), |_| {
                Decision::Write(write_for(9, "bob", WriteTimestamp::ServerNow))
            })
            .expect("write");

        let text = fs::read_to_string(&store.entries_path).expect("read entries");
        let value: serde_json::Value = serde_json::from_str(text.trim()).expect("json line");
        for field in [
            "id",
            "userId",
            "userName",
            "userPhotoURL",
            "day",
            "year",
            "title",
            "url",
            "comment",
            "createdAt",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert!(value["comment"].is_null());
    }

    #[test]
    fn reopening_never_discards_committed_entries() {
        let temp = tempdir().expect("tempdir");
        let first = JsonlStore::open(temp.path()).expect("open store");
        assert!(!first.entries_path.exists());
        assert!(first.query_by_year(2025).expect("query").is_empty());

        first
            .run_atomic(&key(6), |_| {
                Decision::Write(write_for(6, "alice", WriteTimestamp::ServerNow))
            })
            .expect("write");

        let second = JsonlStore::open(temp.path()).expect("reopen store");
        let listed = second.query_by_year(2025).expect("query");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, "alice");
    }

    #[test]
    fn corrupt_line_is_reported_with_position() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStore::open(temp.path()).expect("open store");
        fs::write(&store.entries_path, "\n{not json}\n").expect("write garbage");

        match store.query_by_year(2025) {
            Err(StoreError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }
}
