//! Size- and TTL-bounded LRU cache of parsed source documents.
//!
//! # Policy
//!
//! - One entry per normalized key; `add` for a live key replaces it.
//! - Weight is [`SourceDocument::approximate_size`]. When an insertion would
//!   push the total over `max_bytes`, only the least recently used entry is
//!   evicted, even if that does not free enough room.
//! - Every entry has a one-shot expiry timer, restarted by `add` and `get`.
//!
//! Timers are tokio tasks holding a weak reference to the cache state, so a
//! dropped cache never keeps documents alive. Outside a runtime entries are
//! inserted without a timer.

mod lru;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::source::{normalize_key, LoadOrigin, LoadedDocument, SourceDocument};
use lru::LruList;

struct CacheEntry {
    key: String,
    document: Arc<SourceDocument>,
    weight: usize,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every touch so a timer that already fired cannot dispose
    /// a refreshed entry.
    generation: u64,
}

struct CacheState {
    entries: LruList<CacheEntry>,
    index: HashMap<String, usize>,
    total_bytes: usize,
    next_generation: u64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            entries: LruList::new(),
            index: HashMap::new(),
            total_bytes: 0,
            next_generation: 0,
        }
    }

    /// Cancel the timer, unlink, subtract the weight, drop the map entry.
    fn dispose(&mut self, idx: usize) -> Option<CacheEntry> {
        let mut entry = self.entries.remove(idx)?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        self.total_bytes = self.total_bytes.saturating_sub(entry.weight);
        self.index.remove(&entry.key);
        Some(entry)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Document cache shared by all request handlers.
pub struct DocumentCache {
    state: Arc<Mutex<CacheState>>,
    max_bytes: usize,
    entry_ttl: Duration,
}

impl DocumentCache {
    pub fn new(max_bytes: usize, entry_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::new())),
            max_bytes,
            entry_ttl,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Insert a document as most recently used.
    pub fn add(&self, document: Arc<SourceDocument>) {
        let key = document.key.clone();
        let weight = document.approximate_size();
        let mut state = self.state.lock().unwrap();

        if let Some(&existing) = state.index.get(&key) {
            state.dispose(existing);
            debug!(key = %key, "Replaced cache entry");
        }

        if state.total_bytes + weight > self.max_bytes {
            if let Some(tail) = state.entries.tail() {
                if let Some(evicted) = state.dispose(tail) {
                    info!(
                        key = %evicted.key,
                        bytes = evicted.weight,
                        total_bytes = state.total_bytes,
                        "Evicted cache entry"
                    );
                }
            }
        }

        let generation = state.bump_generation();
        let idx = state.entries.push_front(CacheEntry {
            key: key.clone(),
            document,
            weight,
            timer: None,
            generation,
        });
        state.index.insert(key.clone(), idx);
        state.total_bytes += weight;

        let timer = self.start_timer(key.clone(), generation);
        if let Some(entry) = state.entries.get_mut(idx) {
            entry.timer = timer;
        }

        debug!(key = %key, bytes = weight, total_bytes = state.total_bytes, "Cached document");
    }

    /// Look up a document, marking it most recently used and restarting
    /// its expiry timer.
    pub fn get(&self, source_id: &str) -> Option<LoadedDocument> {
        let key = normalize_key(source_id);
        let mut state = self.state.lock().unwrap();
        let idx = *state.index.get(&key)?;

        state.entries.move_to_front(idx);
        let generation = state.bump_generation();
        let timer = self.start_timer(key, generation);

        let entry = state.entries.get_mut(idx)?;
        if let Some(old) = entry.timer.take() {
            old.abort();
        }
        entry.timer = timer;
        entry.generation = generation;

        Some(LoadedDocument {
            document: entry.document.clone(),
            origin: LoadOrigin::Cached,
        })
    }

    pub fn contains(&self, source_id: &str) -> bool {
        let key = normalize_key(source_id);
        self.state.lock().unwrap().index.contains_key(&key)
    }

    /// Dispose one entry. Returns false if it was not cached.
    pub fn remove(&self, source_id: &str) -> bool {
        let key = normalize_key(source_id);
        let mut state = self.state.lock().unwrap();
        match state.index.get(&key).copied() {
            Some(idx) => state.dispose(idx).is_some(),
            None => false,
        }
    }

    /// Dispose every entry without logging each one.
    pub fn expire_all(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        while let Some(tail) = state.entries.tail() {
            if state.dispose(tail).is_none() {
                break;
            }
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().unwrap().total_bytes
    }

    /// Keys from most to least recently used.
    pub fn keys_in_lru_order(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Drop all entries and cancel their timers.
    pub fn shutdown(&self) {
        let count = self.expire_all();
        info!(entries = count, "Document cache shut down");
    }

    fn start_timer(&self, key: String, generation: u64) -> Option<JoinHandle<()>> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(key = %key, "No runtime, cache entry has no expiry timer");
                return None;
            }
        };

        let state = Arc::downgrade(&self.state);
        let ttl = self.entry_ttl;
        Some(handle.spawn(async move {
            tokio::time::sleep(ttl).await;
            expire(state, &key, generation);
        }))
    }
}

fn expire(state: Weak<Mutex<CacheState>>, key: &str, generation: u64) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock().unwrap();
    let Some(&idx) = state.index.get(key) else {
        return;
    };

    // Detach our own handle so dispose does not abort the running task.
    match state.entries.get_mut(idx) {
        Some(entry) if entry.generation == generation => {
            entry.timer.take();
        }
        _ => return,
    }

    if let Some(entry) = state.dispose(idx) {
        info!(key = %entry.key, bytes = entry.weight, "Cache entry expired");
    }
}

impl Drop for DocumentCache {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            while let Some(tail) = state.entries.tail() {
                if state.dispose(tail).is_none() {
                    break;
                }
            }
        }
    }
}
