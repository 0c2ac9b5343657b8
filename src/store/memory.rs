//! In-process work store with optional JSON snapshots
//!
//! All state lives behind one mutex, which makes every trait method atomic
//! with respect to the others. When a snapshot path is configured, each
//! mutation is applied to a copy of the state, the copy is written to disk
//! (temp file + rename) on the blocking pool, and only then swapped in. A
//! failed write leaves the store exactly as it was, and a process restart
//! picks up the queue and in-flight set as they were after the last
//! successful mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{CounterDeltas, QueueEntry, QueueKey, WorkStore};
use crate::error::{BerthError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpiringRecord {
    body: String,
    expires_at: DateTime<Utc>,
}

impl ExpiringRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    sequence: u64,
    queue: BTreeMap<QueueKey, (String, String)>,
    index: HashMap<String, QueueKey>,
    in_flight: HashMap<String, String>,
    records: HashMap<String, ExpiringRecord>,
    /// Records by expiry, oldest first
    expiry: BTreeSet<(DateTime<Utc>, String)>,
    counters: BTreeMap<String, i64>,
}

/// On-disk form; JSON maps need string keys so the queue is a list
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    sequence: u64,
    queue: Vec<QueueEntry>,
    in_flight: BTreeMap<String, String>,
    records: BTreeMap<String, ExpiringRecord>,
    counters: BTreeMap<String, i64>,
}

impl State {
    fn insert_queued(&mut self, entry: QueueEntry) {
        self.index.insert(entry.id.clone(), entry.key);
        self.queue.insert(entry.key, (entry.id, entry.body));
    }

    fn remove_queued(&mut self, id: &str) -> Option<QueueEntry> {
        let key = self.index.remove(id)?;
        self.queue
            .remove(&key)
            .map(|(id, body)| QueueEntry { key, id, body })
    }

    fn put_record(&mut self, id: &str, body: String, ttl: Duration) {
        self.purge_expired();
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.expiry.insert((expires_at, id.to_string()));
        self.records
            .insert(id.to_string(), ExpiringRecord { body, expires_at });
    }

    /// Drop every record whose TTL has passed. Amortized by the expiry
    /// index: only expired entries are visited.
    fn purge_expired(&mut self) {
        let now = Utc::now();
        while self.expiry.first().is_some_and(|(at, _)| *at <= now) {
            let Some((at, id)) = self.expiry.pop_first() else {
                break;
            };
            // a later put for the same id has its own expiry entry
            if self.records.get(&id).is_some_and(|r| r.expires_at == at) {
                self.records.remove(&id);
            }
        }
    }

    fn add_counters(&mut self, counters: CounterDeltas<'_>) {
        for (name, delta) in counters {
            *self.counters.entry(name.to_string()).or_insert(0) += delta;
        }
    }

    fn queued(&self) -> Vec<QueueEntry> {
        self.queue
            .iter()
            .map(|(key, (id, body))| QueueEntry {
                key: *key,
                id: id.clone(),
                body: body.clone(),
            })
            .collect()
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            sequence: self.sequence,
            queue: self.queued(),
            in_flight: self
                .in_flight
                .iter()
                .map(|(id, body)| (id.clone(), body.clone()))
                .collect(),
            records: self
                .records
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            counters: self.counters.clone(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State {
            sequence: snapshot.sequence,
            in_flight: snapshot.in_flight.into_iter().collect(),
            counters: snapshot.counters,
            ..Default::default()
        };
        for entry in snapshot.queue {
            state.insert_queued(entry);
        }
        for (id, record) in snapshot.records {
            state.expiry.insert((record.expires_at, id.clone()));
            state.records.insert(id, record);
        }
        state.purge_expired();
        state
    }
}

#[derive(Debug)]
struct SnapshotFile {
    path: PathBuf,
    /// Held across a whole mutation so snapshots land in mutation order
    writer: tokio::sync::Mutex<()>,
    writes: AtomicU64,
}

/// Work store kept in memory, optionally mirrored to a JSON file
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    snapshot: Option<SnapshotFile>,
}

impl MemoryStore {
    /// Purely in-memory store; state is lost with the process
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed store, loading existing state if the file exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            tracing::info!(
                path = %path.display(),
                queued = snapshot.queue.len(),
                in_flight = snapshot.in_flight.len(),
                "Loaded work store snapshot"
            );
            State::from_snapshot(snapshot)
        } else {
            State::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(SnapshotFile {
                path,
                writer: tokio::sync::Mutex::new(()),
                writes: AtomicU64::new(0),
            }),
        })
    }

    /// Path of the snapshot file, if any
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_ref().map(|file| file.path.as_path())
    }

    /// Snapshots written since the store was opened
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot
            .as_ref()
            .map_or(0, |file| file.writes.load(Ordering::Relaxed))
    }

    /// Apply a mutation.
    ///
    /// Without a snapshot file the live state is changed in place. With one,
    /// the mutation runs on a copy that is persisted before it replaces the
    /// live state; readers keep seeing the previous state until then.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut State) -> T + Send,
    {
        let Some(file) = &self.snapshot else {
            let mut state = self.state.lock();
            state.purge_expired();
            return Ok(f(&mut state));
        };

        let _writer = file.writer.lock().await;
        let (next, out, content) = {
            let mut next = self.state.lock().clone();
            let out = f(&mut next);
            next.purge_expired();
            let content = serde_json::to_vec(&next.to_snapshot())?;
            (next, out, content)
        };

        let path = file.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &content))
            .await
            .map_err(|e| BerthError::StoreUnavailable(format!("snapshot writer: {}", e)))??;
        file.writes.fetch_add(1, Ordering::Relaxed);

        *self.state.lock() = next;
        Ok(out)
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }
}

fn write_snapshot(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        BerthError::StoreUnavailable(format!("writing snapshot {}: {}", path.display(), e))
    })
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn next_sequence(&self) -> Result<u64> {
        self.mutate(|state| {
            state.sequence += 1;
            state.sequence
        })
        .await
    }

    async fn push_bounded(
        &self,
        entry: QueueEntry,
        max_len: usize,
        counters: CounterDeltas<'_>,
    ) -> Result<bool> {
        // reject before touching the snapshot
        if self.state.lock().queue.len() >= max_len {
            return Ok(false);
        }
        self.mutate(|state| {
            if state.queue.len() >= max_len {
                return false;
            }
            state.insert_queued(entry);
            state.add_counters(counters);
            true
        })
        .await
    }

    async fn queue_len(&self) -> Result<usize> {
        Ok(self.state.lock().queue.len())
    }

    async fn queue_get(&self, id: &str) -> Result<Option<QueueEntry>> {
        let state = self.state.lock();
        Ok(state.index.get(id).and_then(|key| {
            state.queue.get(key).map(|(id, body)| QueueEntry {
                key: *key,
                id: id.clone(),
                body: body.clone(),
            })
        }))
    }

    async fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.state.lock().queued())
    }

    async fn claim_next(&self) -> Result<Option<QueueEntry>> {
        if self.state.lock().queue.is_empty() {
            return Ok(None);
        }
        self.mutate(|state| {
            let (key, (id, body)) = state.queue.pop_first()?;
            state.index.remove(&id);
            state.in_flight.insert(id.clone(), body.clone());
            Some(QueueEntry { key, id, body })
        })
        .await
    }

    async fn cancel_queued(
        &self,
        id: &str,
        record: String,
        ttl: Duration,
        counters: CounterDeltas<'_>,
    ) -> Result<bool> {
        if !self.state.lock().index.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|state| match state.remove_queued(id) {
            Some(_) => {
                state.put_record(id, record, ttl);
                state.add_counters(counters);
                true
            }
            None => false,
        })
        .await
    }

    async fn in_flight_get(&self, id: &str) -> Result<Option<String>> {
        Ok(self.state.lock().in_flight.get(id).cloned())
    }

    async fn in_flight_update(&self, id: &str, body: String) -> Result<bool> {
        if !self.state.lock().in_flight.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|state| match state.in_flight.get_mut(id) {
            Some(existing) => {
                *existing = body;
                true
            }
            None => false,
        })
        .await
    }

    async fn in_flight_entries(&self) -> Result<Vec<(String, String)>> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state
            .in_flight
            .iter()
            .map(|(id, body)| (id.clone(), body.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn in_flight_len(&self) -> Result<usize> {
        Ok(self.state.lock().in_flight.len())
    }

    async fn resolve_in_flight(
        &self,
        id: &str,
        record: String,
        ttl: Duration,
        counters: CounterDeltas<'_>,
    ) -> Result<bool> {
        if !self.state.lock().in_flight.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|state| match state.in_flight.remove(id) {
            Some(_) => {
                state.put_record(id, record, ttl);
                state.add_counters(counters);
                true
            }
            None => false,
        })
        .await
    }

    async fn requeue_in_flight(&self, entry: QueueEntry) -> Result<bool> {
        self.mutate(|state| match state.in_flight.remove(&entry.id) {
            Some(_) => {
                state.insert_queued(entry);
                true
            }
            None => false,
        })
        .await
    }

    async fn record_get(&self, id: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        let now = Utc::now();
        Ok(state
            .records
            .get(id)
            .filter(|record| record.is_live(now))
            .map(|record| record.body.clone()))
    }

    async fn counters(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self.state.lock().counters.clone())
    }
}
