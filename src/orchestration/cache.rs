use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    output: Map<String, Value>,
    inserted_at: Instant,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    metrics: CacheMetrics,
}

/// Capability responses shared across runs. Entries are keyed by capability
/// and resolved arguments; TTLs come from each capability's descriptor.
#[derive(Debug)]
pub struct ResponseCache {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn key(capability: &str, arguments: &Map<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(capability.as_bytes());
        hasher.update([0u8]);
        // serde_json maps serialize with sorted keys, so equal arguments hash equally.
        hasher.update(Value::Object(arguments.clone()).to_string().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn get(
        &self,
        capability: &str,
        arguments: &Map<String, Value>,
    ) -> Option<Map<String, Value>> {
        let key = Self::key(capability, arguments);
        let mut inner = self.lock();
        let now = Instant::now();
        let fresh = match inner.entries.get(&key) {
            Some(entry) if entry.expires_at > now => Some(entry.output.clone()),
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => inner.metrics.hits += 1,
            None => inner.metrics.misses += 1,
        }
        inner.metrics.entries = inner.entries.len();
        fresh
    }

    pub fn put(
        &self,
        capability: &str,
        arguments: &Map<String, Value>,
        output: Map<String, Value>,
        ttl: Duration,
    ) {
        if ttl.is_zero() {
            return;
        }
        let key = Self::key(capability, arguments);
        let mut inner = self.lock();
        let now = Instant::now();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            inner.entries.retain(|_, entry| entry.expires_at > now);
            while inner.entries.len() >= self.max_entries {
                let Some(oldest) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                inner.entries.remove(&oldest);
                inner.metrics.evictions += 1;
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                output,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
        inner.metrics.entries = inner.entries.len();
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.metrics.entries = 0;
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.lock().metrics
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
