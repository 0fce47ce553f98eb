//! Data files written at clean shutdown and recovery checkpoints.
//!
//! Each database `db` gets `db.ns` (collection names, one per line, sorted)
//! and `db.0` (one `{"ns", "doc"}` JSON record per line, sorted by namespace
//! then `_id`). Files are written to a temporary name and renamed into place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::matcher::cmp_values;

#[derive(Debug, Serialize, Deserialize)]
struct DataRecord {
    ns: String,
    doc: Value,
}

/// Contents of a data directory.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub databases: BTreeSet<String>,
    /// Collection name -> documents, in file order.
    pub collections: BTreeMap<String, Vec<Value>>,
}

/// Database part of a namespace (`test` for `test.foo`).
pub fn database_of(ns: &str) -> &str {
    ns.split_once('.').map_or(ns, |(db, _)| db)
}

/// Load every `*.ns` / `*.0` pair in `dir`.
pub fn load(dir: &Path) -> std::io::Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshot),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "ns") {
            continue;
        }
        let Some(db) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        snapshot.databases.insert(db.to_string());

        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            let name = line.trim();
            if !name.is_empty() {
                snapshot.collections.entry(name.to_string()).or_default();
            }
        }

        let records = dir.join(format!("{db}.0"));
        if !records.exists() {
            continue;
        }
        for (index, line) in BufReader::new(File::open(&records)?).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DataRecord = serde_json::from_str(&line).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{}:{}: {e}", records.display(), index + 1),
                )
            })?;
            let docs = snapshot.collections.entry(record.ns).or_default();
            docs.push(record.doc);
        }
    }
    Ok(snapshot)
}

/// Write data files for every database in `snapshot`.
pub fn write(dir: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    for db in &snapshot.databases {
        let prefix = format!("{db}.");
        let collections: Vec<(&String, &Vec<Value>)> = snapshot
            .collections
            .iter()
            .filter(|(ns, _)| ns.starts_with(&prefix))
            .collect();

        let mut names = String::new();
        let mut records = String::new();
        for (ns, docs) in collections {
            names.push_str(ns);
            names.push('\n');

            let mut sorted: Vec<&Value> = docs.iter().collect();
            sorted.sort_by(|a, b| cmp_values(&a["_id"], &b["_id"]));
            for doc in sorted {
                let line = serde_json::to_string(&DataRecord {
                    ns: ns.clone(),
                    doc: doc.clone(),
                })
                .map_err(std::io::Error::other)?;
                records.push_str(&line);
                records.push('\n');
            }
        }

        write_atomic(&dir.join(format!("{db}.ns")), names.as_bytes())?;
        write_atomic(&dir.join(format!("{db}.0")), records.as_bytes())?;
    }
    Ok(())
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
