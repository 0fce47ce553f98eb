//! In-memory document store.
//!
//! All collections sit behind one mutex. Scans take it once per document so
//! concurrent writers interleave with long reads; spins run with the lock
//! released. Every running operation carries a cancel flag that is raised on
//! shutdown or when its client disconnects.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use dbrace_common::workload::{CollectionStats, ExplainStats, OpResult, Operation, SortSpec, Spin};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::datafiles::{self, Snapshot, database_of};
use crate::error::{StoreError, StoreResult};
use crate::journal::{self, Journal, JournalEntry};
use crate::matcher::{apply_update, cmp_values, lookup, matches, upsert_seed};

/// Documents a non-atomic remove examines per lock hold.
pub const REMOVE_BATCH: usize = 64;

struct Collection {
    records: BTreeMap<u64, Value>,
    ids: HashMap<String, u64>,
    next_record: u64,
    next_id: i64,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            ids: HashMap::new(),
            next_record: 0,
            next_id: 1,
        }
    }
}

fn id_key(id: &Value) -> String {
    id.to_string()
}

impl Collection {
    /// Insert a new document, assigning `_id` when missing.
    fn insert(&mut self, ns: &str, mut doc: Value) -> StoreResult<Value> {
        if !doc.is_object() {
            return Err(StoreError::BadRequest(format!("document must be an object, got {doc}")));
        }
        let id = match doc.get("_id").cloned() {
            Some(id) => id,
            None => {
                let id = Value::from(self.next_id);
                doc["_id"] = id.clone();
                id
            }
        };
        let key = id_key(&id);
        if self.ids.contains_key(&key) {
            return Err(StoreError::DuplicateKey {
                ns: ns.to_string(),
                id: key,
            });
        }
        if let Some(n) = id.as_i64()
            && n >= self.next_id
        {
            self.next_id = n.saturating_add(1);
        }
        let record = self.next_record;
        self.next_record += 1;
        self.ids.insert(key, record);
        self.records.insert(record, doc.clone());
        Ok(doc)
    }

    /// Insert, or replace the document with the same `_id`.
    fn put(&mut self, ns: &str, doc: Value) -> StoreResult<()> {
        let existing = doc
            .get("_id")
            .and_then(|id| self.ids.get(&id_key(id)).copied());
        match existing {
            Some(record) => {
                self.records.insert(record, doc);
            }
            None => {
                self.insert(ns, doc)?;
            }
        }
        Ok(())
    }

    fn remove(&mut self, record: u64) -> Option<Value> {
        let doc = self.records.remove(&record)?;
        if let Some(id) = doc.get("_id") {
            self.ids.remove(&id_key(id));
        }
        Some(doc)
    }

    fn remove_by_id(&mut self, id: &Value) -> Option<Value> {
        let record = self.ids.get(&id_key(id)).copied()?;
        self.remove(record)
    }

    fn next_after(&self, position: Option<u64>) -> Option<(u64, &Value)> {
        let next = match position {
            None => self.records.iter().next(),
            Some(p) => self
                .records
                .range((std::ops::Bound::Excluded(p), std::ops::Bound::Unbounded))
                .next(),
        };
        next.map(|(record, doc)| (*record, doc))
    }

    fn size(&self) -> u64 {
        self.records
            .values()
            .map(|doc| doc.to_string().len() as u64)
            .sum()
    }
}

#[derive(Default)]
struct State {
    collections: BTreeMap<String, Collection>,
    databases: BTreeSet<String>,
}

impl State {
    fn collection_mut(&mut self, ns: &str) -> &mut Collection {
        self.databases.insert(database_of(ns).to_string());
        self.collections.entry(ns.to_string()).or_default()
    }

    fn apply(&mut self, entry: JournalEntry) -> StoreResult<()> {
        match entry {
            JournalEntry::Put { ns, doc } => self.collection_mut(&ns).put(&ns, doc)?,
            JournalEntry::Delete { ns, id } => {
                if let Some(collection) = self.collections.get_mut(&ns) {
                    collection.remove_by_id(&id);
                }
            }
            JournalEntry::Drop { ns } => {
                self.collections.remove(&ns);
            }
        }
        Ok(())
    }
}

struct ScanResult {
    docs: Vec<Value>,
    n: u64,
    scanned: u64,
    yields: u64,
}

pub struct Store {
    dbpath: PathBuf,
    state: Mutex<State>,
    journal: Option<Arc<Journal>>,
    shutting_down: AtomicBool,
    active: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    next_op: AtomicU64,
}

/// Deregisters an operation's cancel flag when the operation ends.
struct ActiveOp<'a> {
    store: &'a Store,
    id: u64,
}

impl Drop for ActiveOp<'_> {
    fn drop(&mut self) {
        self.store.active.lock().unwrap().remove(&self.id);
    }
}

impl Store {
    /// Open `dbpath`: load data files and, when durable, recover and restart
    /// the journal.
    pub fn open(dbpath: &Path, durable: Option<Duration>) -> StoreResult<Self> {
        std::fs::create_dir_all(dbpath)?;
        let mut state = State::default();

        let Snapshot {
            databases,
            collections,
        } = datafiles::load(dbpath)?;
        state.databases = databases;
        for (ns, docs) in collections {
            let collection = state.collections.entry(ns.clone()).or_default();
            for doc in docs {
                collection.put(&ns, doc)?;
            }
        }
        info!(
            collections = state.collections.len(),
            "loaded data files from {}",
            dbpath.display()
        );

        let journal = match durable {
            Some(interval) => {
                let entries = journal::read_entries(dbpath)?;
                if !entries.is_empty() {
                    info!("recovering {} journal entries", entries.len());
                    for entry in entries {
                        state.apply(entry)?;
                    }
                    datafiles::write(dbpath, &snapshot_of(&state))?;
                }
                journal::remove(dbpath)?;
                let journal = Journal::create(dbpath)?;
                journal.start_group_commit(interval)?;
                info!(
                    interval_ms = interval.as_millis() as u64,
                    "journaling enabled"
                );
                Some(journal)
            }
            None => {
                if dbpath.join(journal::JOURNAL_DIR).exists() {
                    warn!("journal directory present but durability is off; ignoring it");
                }
                None
            }
        };

        Ok(Self {
            dbpath: dbpath.to_path_buf(),
            state: Mutex::new(state),
            journal,
            shutting_down: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// True when no operation is running.
    pub fn is_idle(&self) -> bool {
        self.active.lock().unwrap().is_empty()
    }

    /// Run one operation. `cancel` is raised by the caller when the client
    /// goes away and by [`shutdown`](Self::shutdown).
    pub fn execute(&self, op: Operation, cancel: &Arc<AtomicBool>) -> StoreResult<OpResult> {
        let _active = self.register(cancel)?;
        debug!(op = op.name(), "execute");

        match op {
            Operation::Insert { ns, documents } => self.insert(&ns, documents),
            Operation::Remove { ns, filter, atomic } => self.remove(&ns, &filter, atomic, cancel),
            Operation::Update {
                ns,
                filter,
                update,
                upsert,
                multi,
            } => self.update(&ns, &filter, &update, upsert, multi),
            Operation::Find {
                ns,
                filter,
                sort,
                spin,
                explain,
            } => self.find(&ns, &filter, sort.as_ref(), spin.as_ref(), explain, cancel),
            Operation::Count { ns, filter, spin } => {
                let scan = self.scan(&ns, &filter, spin.as_ref(), false, cancel)?;
                Ok(OpResult::Count { n: scan.n })
            }
            Operation::Drop { ns } => {
                let mut state = self.state.lock().unwrap();
                let existed = state.collections.remove(&ns).is_some();
                self.log_entry(|| JournalEntry::Drop { ns: ns.clone() });
                Ok(OpResult::Ack {
                    n: u64::from(existed),
                })
            }
            Operation::Stats { ns } => {
                let state = self.state.lock().unwrap();
                let (count, size) = state
                    .collections
                    .get(&ns)
                    .map_or((0, 0), |c| (c.records.len() as u64, c.size()));
                Ok(OpResult::Stats(CollectionStats { ns, count, size }))
            }
            Operation::Ping => Ok(OpResult::Pong),
            local @ (Operation::Sleep { .. } | Operation::Spin { .. }) => {
                let message = format!("{} runs in the client, not the server", local.name());
                Err(StoreError::BadRequest(message))
            }
        }
    }

    /// Interrupt running operations, flush the journal, write data files and
    /// remove the journal directory.
    pub fn shutdown(&self) -> StoreResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        for flag in self.active.lock().unwrap().values() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(journal) = &self.journal {
            journal.flush()?;
        }
        self.checkpoint()?;
        if self.journal.is_some() {
            journal::remove(&self.dbpath)?;
        }
        Ok(())
    }

    /// Write the current contents to data files.
    pub fn checkpoint(&self) -> StoreResult<()> {
        let snapshot = snapshot_of(&self.state.lock().unwrap());
        datafiles::write(&self.dbpath, &snapshot)?;
        Ok(())
    }

    fn register(&self, cancel: &Arc<AtomicBool>) -> StoreResult<ActiveOp<'_>> {
        let id = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.active.lock().unwrap().insert(id, Arc::clone(cancel));
        let guard = ActiveOp { store: self, id };
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StoreError::InterruptedAtShutdown);
        }
        Ok(guard)
    }

    fn interruption(&self) -> StoreError {
        if self.shutting_down.load(Ordering::SeqCst) {
            StoreError::InterruptedAtShutdown
        } else {
            StoreError::Interrupted
        }
    }

    fn check(&self, cancel: &AtomicBool) -> StoreResult<()> {
        if cancel.load(Ordering::Relaxed) {
            Err(self.interruption())
        } else {
            Ok(())
        }
    }

    fn log_entry(&self, entry: impl FnOnce() -> JournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(&entry());
        }
    }

    /// Lock the state, counting the acquisition as a yield when a writer
    /// held it.
    fn lock_counting(&self, yields: &mut u64) -> MutexGuard<'_, State> {
        match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                *yields += 1;
                self.state.lock().unwrap()
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        }
    }

    fn insert(&self, ns: &str, documents: Vec<Value>) -> StoreResult<OpResult> {
        let mut state = self.state.lock().unwrap();
        let collection = state.collection_mut(ns);
        let mut n = 0;
        for doc in documents {
            let stored = collection.insert(ns, doc)?;
            self.log_entry(|| JournalEntry::Put {
                ns: ns.to_string(),
                doc: stored,
            });
            n += 1;
        }
        Ok(OpResult::Ack { n })
    }

    fn remove(
        &self,
        ns: &str,
        filter: &Value,
        atomic: bool,
        cancel: &AtomicBool,
    ) -> StoreResult<OpResult> {
        let batch = if atomic { usize::MAX } else { REMOVE_BATCH };
        let mut position = None;
        let mut removed = 0u64;

        loop {
            self.check(cancel)?;
            let mut state = self.state.lock().unwrap();
            let Some(collection) = state.collections.get_mut(ns) else {
                break;
            };

            let mut doomed = Vec::new();
            let mut examined = 0usize;
            let mut exhausted = true;
            while let Some((record, doc)) = collection.next_after(position) {
                position = Some(record);
                if matches(filter, doc)? {
                    doomed.push(record);
                }
                examined += 1;
                if examined == batch {
                    exhausted = false;
                    break;
                }
            }
            for record in doomed {
                if let Some(doc) = collection.remove(record) {
                    removed += 1;
                    if let Some(id) = doc.get("_id") {
                        self.log_entry(|| JournalEntry::Delete {
                            ns: ns.to_string(),
                            id: id.clone(),
                        });
                    }
                }
            }
            drop(state);

            if exhausted {
                break;
            }
            std::thread::yield_now();
        }
        Ok(OpResult::Ack { n: removed })
    }

    fn update(
        &self,
        ns: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
        multi: bool,
    ) -> StoreResult<OpResult> {
        let mut state = self.state.lock().unwrap();
        let mut updated = 0u64;

        if let Some(collection) = state.collections.get_mut(ns) {
            let mut targets = Vec::new();
            for (record, doc) in &collection.records {
                if matches(filter, doc)? {
                    targets.push(*record);
                    if !multi {
                        break;
                    }
                }
            }
            for record in targets {
                let Some(doc) = collection.records.get_mut(&record) else {
                    continue;
                };
                let mut next = doc.clone();
                apply_update(&mut next, update)?;
                *doc = next.clone();
                self.log_entry(|| JournalEntry::Put {
                    ns: ns.to_string(),
                    doc: next,
                });
                updated += 1;
            }
        }

        if updated == 0 && upsert {
            let mut doc = upsert_seed(filter)?;
            apply_update(&mut doc, update)?;
            let stored = state.collection_mut(ns).insert(ns, doc)?;
            self.log_entry(|| JournalEntry::Put {
                ns: ns.to_string(),
                doc: stored,
            });
            updated = 1;
        }
        Ok(OpResult::Ack { n: updated })
    }

    fn find(
        &self,
        ns: &str,
        filter: &Value,
        sort: Option<&SortSpec>,
        spin: Option<&Spin>,
        explain: bool,
        cancel: &AtomicBool,
    ) -> StoreResult<OpResult> {
        let started = Instant::now();
        let mut scan = self.scan(ns, filter, spin, !explain, cancel)?;
        if explain {
            return Ok(OpResult::Explain(ExplainStats {
                n: scan.n,
                n_scanned: scan.scanned,
                n_yields: scan.yields,
                millis: started.elapsed().as_millis() as u64,
            }));
        }
        if let Some(sort) = sort {
            scan.docs.sort_by(|a, b| {
                let ordering = cmp_values(
                    lookup(a, &sort.field).unwrap_or(&Value::Null),
                    lookup(b, &sort.field).unwrap_or(&Value::Null),
                );
                if sort.direction < 0 {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(OpResult::Documents { docs: scan.docs })
    }

    /// Walk `ns` one document per lock hold. Documents removed after the
    /// cursor passes them are still counted; documents removed before are
    /// never seen.
    fn scan(
        &self,
        ns: &str,
        filter: &Value,
        spin: Option<&Spin>,
        collect: bool,
        cancel: &AtomicBool,
    ) -> StoreResult<ScanResult> {
        let mut result = ScanResult {
            docs: Vec::new(),
            n: 0,
            scanned: 0,
            yields: 0,
        };
        let mut position = None;

        loop {
            self.check(cancel)?;
            let next = {
                let state = self.lock_counting(&mut result.yields);
                state
                    .collections
                    .get(ns)
                    .and_then(|c| c.next_after(position))
                    .map(|(record, doc)| (record, doc.clone()))
            };
            let Some((record, doc)) = next else {
                break;
            };
            position = Some(record);
            result.scanned += 1;

            if let Some(spin) = spin
                && spin.run(cancel).is_none()
            {
                return Err(self.interruption());
            }
            if matches(filter, &doc)? {
                result.n += 1;
                if collect {
                    result.docs.push(doc);
                }
            }
        }
        Ok(result)
    }
}

fn snapshot_of(state: &State) -> Snapshot {
    Snapshot {
        databases: state.databases.clone(),
        collections: state
            .collections
            .iter()
            .map(|(ns, c)| (ns.clone(), c.records.values().cloned().collect()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn run(store: &Store, op: Operation) -> StoreResult<OpResult> {
        store.execute(op, &flag())
    }

    fn insert(store: &Store, ns: &str, docs: Vec<Value>) {
        run(
            store,
            Operation::Insert {
                ns: ns.to_string(),
                documents: docs,
            },
        )
        .unwrap();
    }

    fn count(store: &Store, ns: &str, filter: Value) -> u64 {
        run(
            store,
            Operation::Count {
                ns: ns.to_string(),
                filter,
                spin: None,
            },
        )
        .unwrap()
        .n()
        .unwrap()
    }

    fn xs(store: &Store, ns: &str) -> Vec<i64> {
        let docs = run(
            store,
            Operation::Find {
                ns: ns.to_string(),
                filter: Value::Null,
                sort: Some(SortSpec::ascending("_id")),
                spin: None,
                explain: false,
            },
        )
        .unwrap()
        .into_documents()
        .unwrap();
        docs.iter().map(|d| d["x"].as_i64().unwrap()).collect()
    }

    fn update(store: &Store, filter: Value, update: Value, multi: bool) {
        run(
            store,
            Operation::Update {
                ns: "test.update7".to_string(),
                filter,
                update,
                upsert: false,
                multi,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_insert_assigns_ids_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), None).unwrap();
        insert(&store, "test.foo", vec![json!({"x": 1}), json!({"x": 2})]);
        insert(&store, "test.foo", vec![json!({"_id": 10})]);
        insert(&store, "test.foo", vec![json!({"x": 3})]);

        let err = run(
            &store,
            Operation::Insert {
                ns: "test.foo".to_string(),
                documents: vec![json!({"_id": 1})],
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), 11000);

        let docs = run(
            &store,
            Operation::Find {
                ns: "test.foo".to_string(),
                filter: json!({"x": 3}),
                sort: None,
                spin: None,
                explain: false,
            },
        )
        .unwrap()
        .into_documents()
        .unwrap();
        assert_eq!(docs, vec![json!({"_id": 11, "x": 3})]);
    }

    #[test]
    fn test_update_operator_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), None).unwrap();
        let ns = "test.update7";
        let docs = vec![json!({"_id": 1, "x": 1}), json!({"_id": 2, "x": 5})];
        insert(&store, ns, docs);

        update(&store, json!({}), json!({"$inc": {"x": 1}}), false);
        assert_eq!(xs(&store, ns), vec![2, 5]);
        update(&store, json!({"_id": 2}), json!({"$inc": {"x": 1}}), false);
        assert_eq!(xs(&store, ns), vec![2, 6]);
        update(&store, json!({}), json!({"$inc": {"x": 1}}), true);
        assert_eq!(xs(&store, ns), vec![3, 7]);
        update(&store, json!({}), json!({"$set": {"x": 2}}), true);
        assert_eq!(xs(&store, ns), vec![2, 2]);
    }

    #[test]
    fn test_upsert_inserts_seeded_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), None).unwrap();
        let result = run(
            &store,
            Operation::Update {
                ns: "test.up".to_string(),
                filter: json!({"k": "a"}),
                update: json!({"$inc": {"n": 1}}),
                upsert: true,
                multi: false,
            },
        )
        .unwrap();
        assert_eq!(result.n(), Some(1));
        assert_eq!(count(&store, "test.up", json!({"k": "a", "n": 1})), 1);
    }

    #[test]
    fn test_remove_batches_and_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), None).unwrap();
        let docs: Vec<Value> = (0..200).map(|i| json!({"_id": i, "even": i % 2 == 0})).collect();
        insert(&store, "test.rm", docs);

        let removed = run(
            &store,
            Operation::Remove {
                ns: "test.rm".to_string(),
                filter: json!({"even": true}),
                atomic: false,
            },
        )
        .unwrap();
        assert_eq!(removed.n(), Some(100));
        let removed = run(
            &store,
            Operation::Remove {
                ns: "test.rm".to_string(),
                filter: Value::Null,
                atomic: true,
            },
        )
        .unwrap();
        assert_eq!(removed.n(), Some(100));
        assert_eq!(count(&store, "test.rm", Value::Null), 0);
    }

    #[test]
    fn test_cancel_interrupts_infinite_spin() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), None).unwrap());
        insert(&store, "test.spin", vec![json!({})]);

        let cancel = flag();
        let worker = {
            let store = Arc::clone(&store);
            let cancel = Arc::clone(&cancel);
            std::thread::spawn(move || {
                store.execute(
                    Operation::Count {
                        ns: "test.spin".to_string(),
                        filter: Value::Null,
                        spin: Some(Spin::Forever),
                    },
                    &cancel,
                )
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        // Writers still get through while the scan spins.
        let drop = Operation::Drop {
            ns: "test.spin".to_string(),
        };
        run(&store, drop).unwrap();
        cancel.store(true, Ordering::SeqCst);
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Interrupted));
    }

    #[test]
    fn test_shutdown_interrupts_and_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), None).unwrap());
        insert(&store, "test.foo", vec![json!({"x": 1})]);

        let worker = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.execute(
                    Operation::Count {
                        ns: "test.foo".to_string(),
                        filter: Value::Null,
                        spin: Some(Spin::Forever),
                    },
                    &flag(),
                )
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        store.shutdown().unwrap();
        let err = worker.join().unwrap().unwrap_err();
        assert_eq!(err.code(), 11600);
        assert!(matches!(
            run(&store, Operation::Ping),
            Err(StoreError::InterruptedAtShutdown)
        ));
        assert!(dir.path().join("test.ns").exists());
        assert!(dir.path().join("test.0").exists());
    }

    #[test]
    fn test_durable_recovery_after_hard_stop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), Some(Duration::from_millis(10))).unwrap();
            insert(&store, "test.foo", vec![json!({"x": 1})]);
            store.journal.as_ref().unwrap().flush().unwrap();
            // dropped without shutdown: no data files, journal left behind
        }
        assert!(!dir.path().join("test.0").exists());
        assert_eq!(journal::read_entries(dir.path()).unwrap().len(), 1);

        let store = Store::open(dir.path(), Some(Duration::from_millis(10))).unwrap();
        assert_eq!(count(&store, "test.foo", Value::Null), 1);
        assert!(journal::read_entries(dir.path()).unwrap().is_empty());
        assert!(dir.path().join("test.0").exists());

        store.shutdown().unwrap();
        assert!(!dir.path().join(journal::JOURNAL_DIR).exists());
    }

    #[test]
    fn test_explain_counts_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), None).unwrap();
        let docs: Vec<Value> = (0..10).map(|i| json!({"_id": i, "k": i % 3})).collect();
        insert(&store, "test.ex", docs);
        let stats = run(
            &store,
            Operation::Find {
                ns: "test.ex".to_string(),
                filter: json!({"k": 0}),
                sort: Some(SortSpec::descending("_id")),
                spin: Some(Spin::Iterations { count: 1 }),
                explain: true,
            },
        )
        .unwrap();
        let stats = stats.explain().unwrap();
        assert_eq!(stats.n, 4);
        assert_eq!(stats.n_scanned, 10);
    }

    #[test]
    fn test_local_operations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), None).unwrap();
        let err = run(&store, Operation::Sleep { millis: 1 }).unwrap_err();
        assert_eq!(err.code(), 2);
    }
}
