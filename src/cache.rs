// Clima Agent -- Response cache
//
// Bounded LRU keyed by a SHA-256 of the capability name and its normalized
// params. Each entry carries its own expiry; an expired entry is never
// served and is dropped by the read that finds it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Deterministic cache key: `sha256("<capability>:<canonical json>")`.
/// Object keys are sorted so `{"a":1,"b":2}` and `{"b":2,"a":1}` collide.
pub fn cache_key(capability: &str, params: &Value) -> String {
    let mut material = String::with_capacity(64);
    material.push_str(capability);
    material.push(':');
    write_canonical(params, &mut material);
    hex::encode(Sha256::digest(material.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

struct Slot {
    value: Arc<Value>,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<String, Slot>,
    /// Recency index: use tick -> key. The first entry is the least recently used.
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.last_used);
            slot.last_used = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.last_used);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct ResponseCache {
    state: Mutex<LruState>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<Arc<Value>> {
        let mut state = self.lock();
        let lookup = state
            .entries
            .get(key)
            .map(|slot| (slot.expires_at > now).then(|| slot.value.clone()));
        let found = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                state.remove(key);
                None
            }
            None => None,
        };
        match found {
            Some(value) => {
                state.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: Arc<Value>, ttl: Duration) {
        self.insert_at(key, value, ttl, Instant::now());
    }

    pub(crate) fn insert_at(&self, key: String, value: Arc<Value>, ttl: Duration, now: Instant) {
        if self.capacity == 0 || ttl.is_zero() {
            return;
        }
        let mut state = self.lock();
        state.remove(&key);
        while state.entries.len() >= self.capacity {
            let Some((_, lru_key)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&lru_key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %lru_key, "cache: evicted least recently used entry");
        }
        state.tick += 1;
        let tick = state.tick;
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            Slot {
                value,
                expires_at: now + ttl,
                last_used: tick,
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, slot)| slot.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            capacity: self.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}
