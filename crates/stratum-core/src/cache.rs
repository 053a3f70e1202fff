//! Tool result cache
//!
//! Memoizes successful results of cacheable tools. Keys are the tool name plus
//! a SHA-256 fingerprint of the parameters in canonical form (object keys
//! sorted recursively, arrays kept in order), so key order in the parameter
//! object never changes the fingerprint.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use moka::Expiry;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    /// Applied when `set` is called without an explicit ttl
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            default_ttl: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cache: {} hits, {} misses, {} entries",
            self.hits, self.misses, self.entries
        )
    }
}

struct EntryExpiry;

impl Expiry<String, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Shared result cache, safe to use from concurrent tool calls.
pub struct ResultCache {
    entries: Cache<String, Arc<CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build();

        Self {
            entries,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Build the cache key for a call.
    pub fn key(tool_name: &str, parameters: &Value) -> String {
        format!("{}:{}", tool_name, fingerprint(parameters))
    }

    /// Look up an unexpired value.
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }

        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache hit");
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value. `ttl` overrides the configured default.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }

        let key = key.into();
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            value,
            timestamp: Utc::now(),
            ttl: ttl.or(self.config.default_ttl),
        });
        self.entries.insert(key, entry);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
        }
    }
}

/// SHA-256 hex digest of the canonical JSON form.
pub fn fingerprint(parameters: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(parameters, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
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
        primitive => out.push_str(&primitive.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_ignores_object_key_order() {
        let a = ResultCache::key("read", &json!({"a": 1, "b": 2}));
        let b = ResultCache::key("read", &json!({"b": 2, "a": 1}));
        let c = ResultCache::key("read", &json!({"a": 1, "b": 3}));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_sorts_nested_objects_but_not_arrays() {
        let a = ResultCache::key("t", &json!({"outer": {"y": [1, 2], "x": {"q": 1, "p": 2}}}));
        let b = ResultCache::key("t", &json!({"outer": {"x": {"p": 2, "q": 1}, "y": [1, 2]}}));
        let c = ResultCache::key("t", &json!({"outer": {"x": {"p": 2, "q": 1}, "y": [2, 1]}}));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_includes_tool_name() {
        let params = json!({"path": "src"});
        assert_ne!(
            ResultCache::key("list", &params),
            ResultCache::key("read", &params)
        );
        assert_eq!(fingerprint(&params).len(), 64);
    }

    #[test]
    fn set_then_get_and_stats() {
        let cache = ResultCache::default();
        let key = ResultCache::key("read", &json!({"file_path": "a.rs"}));

        assert!(cache.get(&key).is_none());
        cache.set(key.clone(), json!({"content": "fn main() {}"}), None);
        assert_eq!(cache.get(&key).unwrap()["content"], "fn main() {}");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ResultCache::default();
        cache.set("k", json!(1), Some(Duration::from_millis(20)));
        assert!(cache.get("k").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ResultCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.set("k", json!(1), None);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = ResultCache::default();
        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
