//! Response caches for the interception proxy
//!
//! Named in-process caches (Moka) behind a registry that speaks the
//! versioned install/activate protocol: the shell cache carries a version
//! suffix, and activation deletes every named cache that is neither the
//! current shell version nor the shared runtime cache. Storage pressure
//! triggers the same stale-cache eviction as a corrective measure.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use moka::future::Cache;

use crate::data::models::now_ms;

/// Name of the shared runtime cache (API/dynamic responses).
///
/// Distinct from the versioned shell cache and never expired on activate.
pub const RUNTIME_CACHE: &str = "outpost-runtime";

/// A cached upstream response, cloned at interception time.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
    /// Epoch ms when the clone was stored
    pub stored_at: i64,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body,
            stored_at: now_ms(),
        }
    }
}

type NamedCache = Cache<String, Arc<CachedResponse>>;

/// Registry of named response caches.
pub struct ResponseCache {
    /// Current shell version (e.g. "v3")
    shell_version: String,
    max_entries: u64,
    caches: RwLock<HashMap<String, NamedCache>>,
}

/// Cache key for a request: method + path + query.
pub fn request_key(method: &str, path_and_query: &str) -> String {
    format!("{method} {path_and_query}")
}

impl ResponseCache {
    pub fn new(shell_version: &str, max_entries: u64) -> Self {
        let registry = Self {
            shell_version: shell_version.to_string(),
            max_entries,
            caches: RwLock::new(HashMap::new()),
        };
        // The runtime cache always exists
        registry.named(RUNTIME_CACHE);
        registry
    }

    /// Name of the current versioned shell cache.
    pub fn shell_cache_name(&self) -> String {
        format!("outpost-shell-{}", self.shell_version)
    }

    /// Get or create a named cache.
    fn named(&self, name: &str) -> NamedCache {
        if let Some(cache) = self.caches.read().expect("cache registry lock").get(name) {
            return cache.clone();
        }

        let mut caches = self.caches.write().expect("cache registry lock");
        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::builder().max_capacity(self.max_entries).build())
            .clone()
    }

    /// Store a response clone in a named cache.
    pub async fn put(&self, cache_name: &str, key: String, response: CachedResponse) {
        let cache = self.named(cache_name);
        cache.insert(key, Arc::new(response)).await;

        use crate::metrics::CACHE_SIZE;
        CACHE_SIZE
            .with_label_values(&[cache_name])
            .set(cache.entry_count() as i64);
    }

    /// Look a request up in a named cache.
    pub async fn get(&self, cache_name: &str, key: &str) -> Option<Arc<CachedResponse>> {
        let cache = self.named(cache_name);
        let result = cache.get(key).await;

        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
        if result.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&[cache_name]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&[cache_name]).inc();
        }

        result
    }

    /// Cache-first lookup: the current shell cache, then the runtime cache.
    pub async fn get_any(&self, key: &str) -> Option<Arc<CachedResponse>> {
        if let Some(hit) = self.get(&self.shell_cache_name(), key).await {
            return Some(hit);
        }
        self.get(RUNTIME_CACHE, key).await
    }

    /// Activation protocol: drop every named cache that is neither the
    /// current shell version nor the shared runtime cache.
    ///
    /// # Returns
    /// Names of the caches that were deleted.
    pub fn activate(&self) -> Vec<String> {
        let current = self.shell_cache_name();
        let mut caches = self.caches.write().expect("cache registry lock");

        let stale: Vec<String> = caches
            .keys()
            .filter(|name| **name != current && **name != RUNTIME_CACHE)
            .cloned()
            .collect();

        for name in &stale {
            caches.remove(name);
            use crate::metrics::CACHE_SIZE;
            CACHE_SIZE.with_label_values(&[name.as_str()]).set(0);
        }

        if !stale.is_empty() {
            tracing::info!(deleted = ?stale, "Expired stale response caches");
        }

        stale
    }

    /// Storage-pressure corrective measure: same eviction as activation.
    pub fn handle_quota_pressure(&self) -> Vec<String> {
        tracing::warn!("Storage quota pressure; evicting stale response caches");
        self.activate()
    }

    /// Current named caches (tests, diagnostics).
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .caches
            .read()
            .expect("cache registry lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
