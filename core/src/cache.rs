//! Per-batch snapshot cache.
//!
//! Entries expire after a TTL (checked lazily on read) and the map is
//! bounded: inserting past capacity evicts the oldest entry. A miss only
//! costs a reload from storage, so nothing depends on what is cached.

use crate::{
    error::{SimError, SimResult},
    snapshot::EventSnapshot,
    store::SimStore,
    types::BatchId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct CacheEntry {
    snapshot: Arc<EventSnapshot>,
    inserted_at: Instant,
}

pub struct SnapshotCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<BatchId, CacheEntry>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, batch_id: &str) -> Option<Arc<EventSnapshot>> {
        self.get_at(batch_id, Instant::now())
    }

    /// Lookup as of `now`. Expired entries are removed and reported absent.
    pub fn get_at(&self, batch_id: &str, now: Instant) -> Option<Arc<EventSnapshot>> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(batch_id) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.inserted_at) >= self.ttl,
        };
        if expired {
            entries.remove(batch_id);
            return None;
        }
        entries.get(batch_id).map(|e| Arc::clone(&e.snapshot))
    }

    pub fn insert(&self, batch_id: &str, snapshot: Arc<EventSnapshot>) {
        self.insert_at(batch_id, snapshot, Instant::now());
    }

    pub fn insert_at(&self, batch_id: &str, snapshot: Arc<EventSnapshot>, now: Instant) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.insert(
            batch_id.to_string(),
            CacheEntry {
                snapshot,
                inserted_at: now,
            },
        );
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached snapshot, or load and validate it from the store.
    pub fn get_or_load(&self, store: &SimStore, batch_id: &str) -> SimResult<Arc<EventSnapshot>> {
        if let Some(hit) = self.get(batch_id) {
            return Ok(hit);
        }
        let json = store.load_snapshot_json(batch_id)?;
        let snapshot = Arc::new(EventSnapshot::from_json(&json).map_err(|e| match e {
            SimError::InvalidSnapshot(msg) => {
                SimError::invalid(format!("stored snapshot for batch {batch_id}: {msg}"))
            }
            other => other,
        })?);
        self.insert(batch_id, Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
