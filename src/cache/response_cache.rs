// src/cache/response_cache.rs
use super::entry::{compress_content, CacheEntry};
use super::key::CacheKey;
use super::pattern::escape;
use super::store::CacheStore;
use super::CacheError;
use crate::config::CacheConfig;
use crate::endpoint::{CacheStrategy, Endpoint};
use crate::events::{EventSink, TrafficEvent};
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::{Method, Request, Response};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Response header listing cache tags, comma separated.
pub const CACHE_TAG_HEADER: &str = "cache-tag";

const INVALIDATION_LOG_CAPACITY: usize = 1000;

const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationType {
    Pattern,
    Tag,
    Time,
}

impl fmt::Display for InvalidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvalidationType::Pattern => "pattern",
            InvalidationType::Tag => "tag",
            InvalidationType::Time => "time",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInvalidationRecord {
    pub id: Uuid,
    pub invalidation_type: InvalidationType,
    /// `None` when the invalidation spanned every endpoint.
    pub endpoint_id: Option<String>,
    pub pattern: String,
    pub reason: String,
    pub affected: usize,
    pub triggered_by: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub expired: u64,
    pub skipped: u64,
    pub store_errors: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub bytes_stored: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    expired: AtomicU64,
    skipped: AtomicU64,
    store_errors: AtomicU64,
    invalidations: AtomicU64,
    bytes_stored: AtomicU64,
}

/// Per-endpoint response cache over a shared [`CacheStore`].
///
/// Store failures never reach the caller: reads degrade to misses and writes
/// to no-ops. Expiry is checked on every read, so correctness does not
/// depend on the store or the sweeper having removed stale entries.
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    events: Arc<dyn EventSink>,
    metrics: Option<Arc<MetricsCollector>>,
    counters: Counters,
    sizes: DashMap<String, u64>,
    invalidation_log: RwLock<VecDeque<CacheInvalidationRecord>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ResponseCache {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        events: Arc<dyn EventSink>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            events,
            metrics,
            counters: Counters::default(),
            sizes: DashMap::new(),
            invalidation_log: RwLock::new(VecDeque::new()),
            shutdown_tx,
        }
    }

    /// Cached response for `request`, or `None` on miss, expiry or store error.
    pub async fn get<B>(&self, request: &Request<B>, endpoint: &Endpoint) -> Option<Response<Bytes>> {
        if !caches_method(endpoint, request.method()) {
            return None;
        }

        let key = CacheKey::from_request(&self.config.namespace, endpoint, request);
        let storage_key = key.storage_key();

        let raw = match self.store.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                // the store already dropped it on expiry
                if self.forget_size(&storage_key) {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
                return self.miss(&key);
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %endpoint.id, key = %key.readable, error = %e, "Cache read failed");
                return self.miss(&key);
            }
        };

        let entry = match CacheEntry::decode(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(endpoint = %endpoint.id, key = %key.readable, error = %e, "Dropping unreadable cache entry");
                self.remove(&storage_key).await;
                return self.miss(&key);
            }
        };

        if entry.is_expired(Utc::now()) {
            debug!(endpoint = %endpoint.id, key = %key.readable, "Cache entry expired");
            if self.remove(&storage_key).await {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
            }
            return self.miss(&key);
        }

        match entry.to_response() {
            Ok(response) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_lookup(&key.endpoint_id, true);
                }
                debug!(endpoint = %endpoint.id, key = %key.readable, "Cache hit");
                self.events.emit(TrafficEvent::CacheHit {
                    endpoint_id: key.endpoint_id.clone(),
                    key: key.readable.clone(),
                });
                Some(response)
            }
            Err(e) => {
                warn!(endpoint = %endpoint.id, key = %key.readable, error = %e, "Dropping corrupt cache entry");
                self.remove(&storage_key).await;
                self.miss(&key)
            }
        }
    }

    /// Stores `response` if it passes the cacheability gate. Returns whether
    /// it was written; a refusal is not an error.
    pub async fn put<B>(
        &self,
        request: &Request<B>,
        response: &Response<Bytes>,
        endpoint: &Endpoint,
    ) -> bool {
        if let Err(reason) = self.admit(request.method(), response, endpoint) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %endpoint.id, %reason, "Response not cacheable");
            return false;
        }
        let Some(headers) = stored_headers(response.headers()) else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %endpoint.id, "Response has non-text headers; not cached");
            return false;
        };

        let key = CacheKey::from_request(&self.config.namespace, endpoint, request);
        let storage_key = key.storage_key();
        let content = response.body();

        let (stored, compressed) = compress_content(
            content,
            self.config.compression_min_bytes,
            self.config.min_compression_savings,
        )
        .unwrap_or_else(|e| {
            warn!(endpoint = %endpoint.id, error = %e, "Compression failed; storing raw content");
            (content.to_vec(), false)
        });

        let now = Utc::now();
        let ttl = endpoint.cache.ttl();
        let expires_at = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now + ttl,
            Err(_) => return false,
        };
        let entry = CacheEntry {
            status: response.status().as_u16(),
            headers,
            compression_ratio: if content.is_empty() {
                1.0
            } else {
                stored.len() as f64 / content.len() as f64
            },
            content: stored,
            compressed,
            content_type: content_type(response.headers()).map(str::to_string),
            cached_at: now,
            expires_at,
            original_size: content.len(),
            tags: cache_tags(response.headers()),
        };

        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(endpoint = %endpoint.id, error = %e, "Failed to encode cache entry");
                return false;
            }
        };
        if let Err(e) = self.store.set(&storage_key, encoded, ttl).await {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %endpoint.id, key = %key.readable, error = %e, "Cache write failed");
            return false;
        }

        let stored_size = entry.stored_size() as u64;
        let previous = self.sizes.insert(storage_key, stored_size).unwrap_or(0);
        let total = self.adjust_bytes(stored_size as i64 - previous as i64);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_set(total);
        }

        debug!(
            endpoint = %endpoint.id,
            key = %key.readable,
            original_size = entry.original_size,
            stored_size,
            compressed,
            "Cached response"
        );
        self.events.emit(TrafficEvent::CacheSet {
            endpoint_id: key.endpoint_id,
            key: key.readable,
            original_size: entry.original_size,
            stored_size: entry.stored_size(),
            compressed,
        });
        true
    }

    /// Deletes entries of one endpoint whose `{METHOD}:{path}:{hash}` part
    /// matches `pattern` (glob). Returns how many were removed.
    pub async fn invalidate_by_pattern(
        &self,
        endpoint_id: &str,
        pattern: &str,
        triggered_by: &str,
    ) -> Result<usize, CacheError> {
        let glob = format!(
            "{}:{}:{}",
            escape(&self.config.namespace),
            escape(endpoint_id),
            pattern
        );
        let keys = self.store.keys(&glob).await?;
        let affected = self.remove_all(&keys).await;

        self.record_invalidation(
            InvalidationType::Pattern,
            Some(endpoint_id),
            pattern,
            format!("entries matching {pattern}"),
            affected,
            triggered_by,
        )
        .await;
        Ok(affected)
    }

    /// Deletes entries whose response carried `tag` in its `Cache-Tag` header.
    pub async fn invalidate_by_tag(
        &self,
        endpoint_id: Option<&str>,
        tag: &str,
        triggered_by: &str,
    ) -> Result<usize, CacheError> {
        let doomed = self
            .scan(endpoint_id, |entry| entry.tags.iter().any(|t| t == tag))
            .await?;
        let affected = self.remove_all(&doomed).await;

        self.record_invalidation(
            InvalidationType::Tag,
            endpoint_id,
            tag,
            format!("entries tagged {tag}"),
            affected,
            triggered_by,
        )
        .await;
        Ok(affected)
    }

    /// Deletes entries cached before `cutoff`.
    pub async fn invalidate_older_than(
        &self,
        endpoint_id: Option<&str>,
        cutoff: DateTime<Utc>,
        triggered_by: &str,
    ) -> Result<usize, CacheError> {
        let doomed = self.scan(endpoint_id, |entry| entry.cached_at < cutoff).await?;
        let affected = self.remove_all(&doomed).await;

        self.record_invalidation(
            InvalidationType::Time,
            endpoint_id,
            &cutoff.to_rfc3339(),
            format!("entries cached before {}", cutoff.to_rfc3339()),
            affected,
            triggered_by,
        )
        .await;
        Ok(affected)
    }

    pub async fn invalidation_log(&self) -> Vec<CacheInvalidationRecord> {
        self.invalidation_log.read().await.iter().cloned().collect()
    }

    /// Removes entries past their TTL from the store.
    pub async fn purge_expired(&self) -> usize {
        match self.store.purge_expired().await {
            Ok(keys) => {
                for key in &keys {
                    self.forget_size(key);
                }
                self.counters
                    .expired
                    .fetch_add(keys.len() as u64, Ordering::Relaxed);
                keys.len()
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Cache sweep failed");
                0
            }
        }
    }

    /// Starts the periodic expiry sweep when `sweep_interval_secs` is set.
    pub fn spawn_sweeper(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.sweep_interval()?;
        let mut shutdown = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "Starting cache sweeper");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = self.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "Swept expired cache entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Cache sweeper stopped");
        }))
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let hits = load(&self.counters.hits);
        let misses = load(&self.counters.misses);
        let lookups = hits + misses;

        CacheStatistics {
            hits,
            misses,
            sets: load(&self.counters.sets),
            deletes: load(&self.counters.deletes),
            expired: load(&self.counters.expired),
            skipped: load(&self.counters.skipped),
            store_errors: load(&self.counters.store_errors),
            invalidations: load(&self.counters.invalidations),
            entries: self.sizes.len(),
            bytes_stored: load(&self.counters.bytes_stored),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Why a response may not be cached, if it may not.
    fn admit(
        &self,
        method: &Method,
        response: &Response<Bytes>,
        endpoint: &Endpoint,
    ) -> Result<(), &'static str> {
        if !caches_method(endpoint, method) {
            return Err("caching disabled for endpoint or method");
        }
        if endpoint.cache.ttl_secs == 0 {
            return Err("zero ttl");
        }
        if response.status().as_u16() >= 400 {
            return Err("error status");
        }
        match content_type(response.headers()) {
            Some(content_type) if is_cacheable_type(content_type) => {}
            _ => return Err("content type not cacheable"),
        }
        if response.body().len() > self.config.max_content_bytes {
            return Err("content too large");
        }
        Ok(())
    }

    fn miss(&self, key: &CacheKey) -> Option<Response<Bytes>> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(&key.endpoint_id, false);
        }
        self.events.emit(TrafficEvent::CacheMiss {
            endpoint_id: key.endpoint_id.clone(),
            key: key.readable.clone(),
        });
        None
    }

    /// Collects keys in scope whose decoded entry satisfies `doomed`.
    async fn scan<F>(&self, endpoint_id: Option<&str>, doomed: F) -> Result<Vec<String>, CacheError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let glob = match endpoint_id {
            Some(id) => format!("{}:{}:*", escape(&self.config.namespace), escape(id)),
            None => format!("{}:*", escape(&self.config.namespace)),
        };

        let mut matched = Vec::new();
        for key in self.store.keys(&glob).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match CacheEntry::decode(&raw) {
                Ok(entry) if doomed(&entry) => matched.push(key),
                Ok(_) => {}
                Err(e) => debug!(key = %key, error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(matched)
    }

    async fn remove_all(&self, keys: &[String]) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.remove(key).await {
                removed += 1;
            }
        }
        self.counters
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    async fn remove(&self, storage_key: &str) -> bool {
        match self.store.delete(storage_key).await {
            Ok(removed) => {
                self.forget_size(storage_key);
                removed
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %storage_key, error = %e, "Cache delete failed");
                false
            }
        }
    }

    /// Returns whether the key was tracked.
    fn forget_size(&self, storage_key: &str) -> bool {
        match self.sizes.remove(storage_key) {
            Some((_, size)) => {
                self.adjust_bytes(-(size as i64));
                true
            }
            None => false,
        }
    }

    fn adjust_bytes(&self, delta: i64) -> u64 {
        let update = |current: u64| Some(current.saturating_add_signed(delta));
        match self
            .counters
            .bytes_stored
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, update)
        {
            Ok(previous) | Err(previous) => previous.saturating_add_signed(delta),
        }
    }

    async fn record_invalidation(
        &self,
        invalidation_type: InvalidationType,
        endpoint_id: Option<&str>,
        pattern: &str,
        reason: String,
        affected: usize,
        triggered_by: &str,
    ) {
        let record = CacheInvalidationRecord {
            id: Uuid::new_v4(),
            invalidation_type,
            endpoint_id: endpoint_id.map(str::to_string),
            pattern: pattern.to_string(),
            reason,
            affected,
            triggered_by: triggered_by.to_string(),
            at: Utc::now(),
        };

        let scope = endpoint_id.unwrap_or("*");
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_invalidation(scope, &invalidation_type.to_string(), affected);
        }
        info!(
            endpoint = %scope,
            kind = %invalidation_type,
            pattern = %pattern,
            affected,
            triggered_by = %triggered_by,
            "Cache invalidated"
        );
        self.events.emit(TrafficEvent::CacheInvalidated {
            endpoint_id: scope.to_string(),
            invalidation_type: invalidation_type.to_string(),
            pattern: record.pattern.clone(),
            affected,
            triggered_by: record.triggered_by.clone(),
        });

        let mut log = self.invalidation_log.write().await;
        if log.len() >= INVALIDATION_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
    }
}

fn caches_method(endpoint: &Endpoint, method: &Method) -> bool {
    endpoint.cache.enabled
        && endpoint.cache.strategy != CacheStrategy::None
        && endpoint.cache.strategy.allows_method(method)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE)?.to_str().ok()
}

/// Textual, JSON/XML and image payloads.
fn is_cacheable_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("text/")
        || essence.starts_with("image/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json" | "application/javascript" | "application/xml"
        )
}

fn stored_headers(headers: &HeaderMap) -> Option<Vec<(String, String)>> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

fn cache_tags(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CACHE_TAG_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
