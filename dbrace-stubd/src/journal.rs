//! Write-ahead journal with group commit.
//!
//! Writers append entries to an in-memory batch while holding the store
//! lock. A background thread flushes the batch to `journal/j._0` and fsyncs
//! it every commit interval. A hard kill loses at most one interval.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const JOURNAL_DIR: &str = "journal";
pub const JOURNAL_FILE: &str = "j._0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Insert or replace the document with this `_id`.
    Put { ns: String, doc: Value },
    Delete { ns: String, id: Value },
    Drop { ns: String },
}

pub struct Journal {
    pending: Mutex<Vec<String>>,
    file: Mutex<File>,
}

impl Journal {
    /// Create a fresh, empty journal under `dbpath`.
    pub fn create(dbpath: &Path) -> std::io::Result<Arc<Self>> {
        let dir = dbpath.join(JOURNAL_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;
        Ok(Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            file: Mutex::new(file),
        }))
    }

    /// Queue an entry for the next group commit.
    pub fn record(&self, entry: &JournalEntry) {
        match serde_json::to_string(entry) {
            Ok(line) => self.pending.lock().unwrap().push(line),
            Err(e) => warn!("dropping unserializable journal entry: {e}"),
        }
    }

    /// Write and fsync everything queued so far. Returns the entry count.
    pub fn flush(&self) -> std::io::Result<usize> {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        if batch.is_empty() {
            return Ok(0);
        }
        let mut file = self.file.lock().unwrap();
        let mut buf = String::with_capacity(batch.iter().map(|l| l.len() + 1).sum());
        for line in &batch {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        debug!(entries = batch.len(), "group commit");
        Ok(batch.len())
    }

    /// Start the group-commit thread. It exits once the journal is dropped.
    pub fn start_group_commit(
        self: &Arc<Self>,
        interval: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        let weak: Weak<Self> = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("group-commit".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(interval);
                    let Some(journal) = weak.upgrade() else {
                        break;
                    };
                    if let Err(e) = journal.flush() {
                        warn!("group commit failed: {e}");
                    }
                }
            })
    }
}

/// Entries left in `dbpath`'s journal, in write order.
///
/// A torn final line from a hard kill is skipped.
pub fn read_entries(dbpath: &Path) -> std::io::Result<Vec<JournalEntry>> {
    let path = dbpath.join(JOURNAL_DIR).join(JOURNAL_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!("ignoring journal from line {}: {e}", index + 1);
                break;
            }
        }
    }
    Ok(entries)
}

/// Remove the journal directory if present.
pub fn remove(dbpath: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dbpath.join(JOURNAL_DIR)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_flush_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).unwrap();
        journal.record(&JournalEntry::Put {
            ns: "test.foo".to_string(),
            doc: json!({"_id": 1, "x": 1}),
        });
        journal.record(&JournalEntry::Drop {
            ns: "test.bar".to_string(),
        });
        assert!(read_entries(dir.path()).unwrap().is_empty());

        assert_eq!(journal.flush().unwrap(), 2);
        assert_eq!(journal.flush().unwrap(), 0);
        let entries = read_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1],
            JournalEntry::Drop {
                ns: "test.bar".to_string()
            }
        );
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).unwrap();
        journal.record(&JournalEntry::Delete {
            ns: "test.foo".to_string(),
            id: json!(1),
        });
        journal.flush().unwrap();
        let path = dir.path().join(JOURNAL_DIR).join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{\"op\":\"put\",\"ns\":").unwrap();

        assert_eq!(read_entries(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_group_commit_thread_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).unwrap();
        let _thread = journal
            .start_group_commit(Duration::from_millis(10))
            .unwrap();
        journal.record(&JournalEntry::Drop {
            ns: "test.foo".to_string(),
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while read_entries(dir.path()).unwrap().is_empty() {
            assert!(Instant::now() < deadline, "group commit never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        drop(Journal::create(dir.path()).unwrap());
        remove(dir.path()).unwrap();
        assert!(!dir.path().join(JOURNAL_DIR).exists());
        remove(dir.path()).unwrap();
    }
}
