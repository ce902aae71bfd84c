//! Content-addressed cache for idempotent generation requests.
//!
//! Keys are fingerprints: a SHA-256 over the operation name and the
//! canonical (recursively key-sorted) JSON of every input parameter that
//! affects the output. Identical requests always collide; changing any one
//! parameter diverges.
//!
//! The cache is in-memory only. Losing its contents never affects
//! correctness, only cost and latency, so expiry is passive on read with an
//! optional active sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Deterministic hash of a request's semantically relevant inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from an operation name and its normalized
    /// parameters. A pure function of its inputs: the parameter value is
    /// serialized with all object keys sorted, so field order in the
    /// caller's struct or map never changes the result.
    pub fn compute<P: Serialize>(operation: &str, params: &P) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(params)?;

        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(&value).as_bytes());

        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object keys in sorted order at every depth.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let entries: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let quoted = Value::String(key.clone()).to_string();
                    format!("{}:{}", quoted, canonical_json(&map[key]))
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}

struct CacheEntry {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: Instant,
}

/// Hit/miss counters, readable without locking the entry map.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// In-memory response cache with TTL expiry.
pub struct ResponseCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint. Expired entries behave as misses and are
    /// left for the next write or sweep to remove.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        self.get_at(fingerprint, Instant::now())
    }

    fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Option<Value> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        match entries.get(fingerprint) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "cache hit");
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "cache miss");
                None
            }
        }
    }

    /// Store a value under a fingerprint with a time-to-live.
    pub fn put(&self, fingerprint: Fingerprint, value: Value, ttl: Duration) {
        self.put_at(fingerprint, value, ttl, Instant::now());
    }

    fn put_at(&self, fingerprint: Fingerprint, value: Value, ttl: Duration, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            fingerprint,
            CacheEntry {
                value,
                created_at: Utc::now(),
                expires_at: now + ttl,
            },
        );
    }

    /// Drop a fingerprint explicitly.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(fingerprint).is_some()
    }

    /// Active expiry pass; returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: entries.len(),
        }
    }

    /// Age of an entry, for observability.
    pub fn entry_age(&self, fingerprint: &Fingerprint) -> Option<chrono::Duration> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(fingerprint)
            .map(|entry| Utc::now() - entry.created_at)
    }
}

/// Default TTLs per operation family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheTtls {
    /// Generation results (default: 1 hour)
    #[serde(default = "default_generation_ttl")]
    pub generation_ttl_seconds: u64,

    /// Analytics queries (default: 5 minutes)
    #[serde(default = "default_analytics_ttl")]
    pub analytics_ttl_seconds: u64,
}

fn default_generation_ttl() -> u64 {
    3600
}
fn default_analytics_ttl() -> u64 {
    300
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            generation_ttl_seconds: default_generation_ttl(),
            analytics_ttl_seconds: default_analytics_ttl(),
        }
    }
}

impl CacheTtls {
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_ttl_seconds)
    }

    pub fn analytics(&self) -> Duration {
        Duration::from_secs(self.analytics_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_params_same_fingerprint() {
        let a = Fingerprint::compute("generate", &json!({"tone": "casual", "topic": "launch"}))
            .unwrap();
        let b = Fingerprint::compute("generate", &json!({"topic": "launch", "tone": "casual"}))
            .unwrap();

        // Key order must not matter.
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_param_change_changes_fingerprint() {
        let base = json!({"topic": "launch", "tone": "casual", "length": 280});
        let fp = Fingerprint::compute("generate", &base).unwrap();

        let changed = [
            json!({"topic": "launch!", "tone": "casual", "length": 280}),
            json!({"topic": "launch", "tone": "formal", "length": 280}),
            json!({"topic": "launch", "tone": "casual", "length": 281}),
            json!({"topic": "launch", "tone": "casual"}),
        ];

        for params in &changed {
            assert_ne!(fp, Fingerprint::compute("generate", params).unwrap());
        }

        // Same params under a different operation must also diverge.
        assert_ne!(fp, Fingerprint::compute("analyze", &base).unwrap());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = canonical_json(&json!({"b": {"y": 1, "x": 2}, "a": [1, 2]}));
        let b = canonical_json(&json!({"a": [1, 2], "b": {"x": 2, "y": 1}}));
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":[1,2],"b":{"x":2,"y":1}}"#);
    }

    #[test]
    fn test_get_before_and_after_ttl() {
        let cache = ResponseCache::new();
        let fp = Fingerprint::compute("generate", &json!({"k": 1})).unwrap();
        let now = Instant::now();

        cache.put_at(fp.clone(), json!("result"), Duration::from_secs(60), now);

        assert_eq!(
            cache.get_at(&fp, now + Duration::from_secs(59)),
            Some(json!("result"))
        );
        assert_eq!(cache.get_at(&fp, now + Duration::from_secs(60)), None);
        assert_eq!(cache.get_at(&fp, now + Duration::from_secs(3600)), None);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = ResponseCache::new();
        let fp = Fingerprint::compute("generate", &json!({"k": 1})).unwrap();

        cache.put(fp.clone(), json!(1), Duration::from_secs(60));
        assert!(cache.invalidate(&fp));
        assert_eq!(cache.get(&fp), None);
        assert!(!cache.invalidate(&fp));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let short = Fingerprint::compute("generate", &json!({"k": "short"})).unwrap();
        let long = Fingerprint::compute("generate", &json!({"k": "long"})).unwrap();

        cache.put_at(short.clone(), json!(1), Duration::from_secs(10), now);
        cache.put_at(long.clone(), json!(2), Duration::from_secs(100), now);

        let removed = cache.sweep_at(now + Duration::from_secs(50));
        assert_eq!(removed, 1);
        assert_eq!(cache.get_at(&long, now + Duration::from_secs(50)), Some(json!(2)));
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let cache = ResponseCache::new();
        let fp = Fingerprint::compute("generate", &json!({"k": 1})).unwrap();

        cache.get(&fp);
        cache.put(fp.clone(), json!(1), Duration::from_secs(60));
        cache.get(&fp);
        cache.get(&fp);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
