// tests/cache_tests.rs
mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::RecordingSink;
use hyper::header::{CONTENT_TYPE, CONNECTION};
use hyper::{Method, Request, Response, StatusCode};
use proxy_traffic_core::cache::{
    CacheStore, InvalidationType, MemoryStore, ResponseCache, StoreError, CACHE_TAG_HEADER,
};
use proxy_traffic_core::config::CacheConfig;
use proxy_traffic_core::endpoint::{CachePolicy, CacheStrategy, Endpoint};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn cached_endpoint(id: &str, strategy: CacheStrategy, ttl_secs: u64) -> Endpoint {
    Endpoint::new(id, Url::parse("http://10.1.0.1:8080").unwrap())
        .with_cache(CachePolicy::enabled(strategy, ttl_secs))
}

fn cache_with(store: Arc<dyn CacheStore>) -> (ResponseCache, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let cache = ResponseCache::new(CacheConfig::default(), store, sink.clone(), None);
    (cache, sink)
}

fn cache() -> (ResponseCache, Arc<RecordingSink>) {
    cache_with(Arc::new(MemoryStore::new()))
}

fn get(path: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(())
        .unwrap()
}

fn response(status: u16, content_type: &str, body: impl Into<Bytes>) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap()
}

#[tokio::test]
async fn test_small_body_round_trip() {
    let (cache, sink) = cache();
    let endpoint = cached_endpoint("users", CacheStrategy::Ttl, 60);
    let request = get("/users/1?b=2&a=1");
    let body = r#"{"id":1,"name":"ada"}"#;

    assert!(cache.get(&request, &endpoint).await.is_none());
    assert!(cache.put(&request, &response(200, "application/json", body), &endpoint).await);

    // query order does not change the key
    let hit = cache.get(&get("/users/1?a=1&b=2"), &endpoint).await.unwrap();
    assert_eq!(hit.status(), StatusCode::OK);
    assert_eq!(hit.headers()[CONTENT_TYPE], "application/json");
    assert_eq!(hit.body().as_ref(), body.as_bytes());

    let stats = cache.get_statistics();
    assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hit_rate, 0.5);
    assert_eq!(sink.names(), vec!["cache_miss", "cache_set", "cache_hit"]);
}

#[tokio::test]
async fn test_large_body_is_compressed_transparently() {
    let (cache, sink) = cache();
    let endpoint = cached_endpoint("docs", CacheStrategy::Ttl, 60);
    let request = get("/docs/guide");
    let body = "lorem ipsum dolor sit amet ".repeat(400);

    assert!(cache.put(&request, &response(200, "text/html; charset=utf-8", body.clone()), &endpoint).await);

    let hit = cache.get(&request, &endpoint).await.unwrap();
    assert_eq!(hit.body().as_ref(), body.as_bytes());

    let stored = sink.events().into_iter().find_map(|event| match event {
        proxy_traffic_core::events::TrafficEvent::CacheSet {
            original_size,
            stored_size,
            compressed,
            ..
        } => Some((original_size, stored_size, compressed)),
        _ => None,
    });
    let (original_size, stored_size, compressed) = stored.unwrap();
    assert!(compressed);
    assert_eq!(original_size, body.len());
    assert!(stored_size < original_size);
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let (cache, _) = cache();
    let endpoint = cached_endpoint("feed", CacheStrategy::Ttl, 1);
    let request = get("/feed");

    assert!(cache.put(&request, &response(200, "text/plain", "fresh"), &endpoint).await);
    assert!(cache.get(&request, &endpoint).await.is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.get(&request, &endpoint).await.is_none());

    let stats = cache.get_statistics();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.bytes_stored, 0);
    assert_eq!(stats.expired, 1);
}

#[tokio::test]
async fn test_gate_rejects_uncacheable_responses() {
    let (cache, _) = cache();
    let endpoint = cached_endpoint("api", CacheStrategy::Ttl, 60);
    let request = get("/things");

    assert!(!cache.put(&request, &response(500, "application/json", "{}"), &endpoint).await);
    assert!(!cache.put(&request, &response(200, "application/octet-stream", "raw"), &endpoint).await);
    let untyped = Response::builder().status(200).body(Bytes::from("x")).unwrap();
    assert!(!cache.put(&request, &untyped, &endpoint).await);

    let post = Request::builder().method(Method::POST).uri("/things").body(()).unwrap();
    assert!(!cache.put(&post, &response(200, "application/json", "{}"), &endpoint).await);

    let zero_ttl = cached_endpoint("api", CacheStrategy::Ttl, 0);
    assert!(!cache.put(&request, &response(200, "application/json", "{}"), &zero_ttl).await);

    let disabled = Endpoint::new("api", Url::parse("http://10.1.0.1:8080").unwrap());
    assert!(!cache.put(&request, &response(200, "application/json", "{}"), &disabled).await);

    let stats = cache.get_statistics();
    assert_eq!(stats.skipped, 6);
    assert_eq!(stats.sets, 0);
}

#[tokio::test]
async fn test_aggressive_strategy_caches_any_method() {
    let (cache, _) = cache();
    let endpoint = cached_endpoint("search", CacheStrategy::Aggressive, 60);
    let post = Request::builder().method(Method::POST).uri("/search").body(()).unwrap();

    assert!(cache.put(&post, &response(200, "application/json", "[]"), &endpoint).await);
    assert!(cache.get(&post, &endpoint).await.is_some());
    assert!(cache.get(&get("/search"), &endpoint).await.is_none());
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_not_replayed() {
    let (cache, _) = cache();
    let endpoint = cached_endpoint("users", CacheStrategy::Ttl, 60);
    let request = get("/users");
    let upstream = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/json")
        .header(CONNECTION, "keep-alive")
        .header("x-upstream", "node-3")
        .body(Bytes::from_static(b"[]"))
        .unwrap();

    assert!(cache.put(&request, &upstream, &endpoint).await);
    let hit = cache.get(&request, &endpoint).await.unwrap();
    assert!(hit.headers().get(CONNECTION).is_none());
    assert_eq!(hit.headers()["x-upstream"], "node-3");
}

#[tokio::test]
async fn test_invalidation_by_pattern_tag_and_age() {
    let (cache, sink) = cache();
    let users = cached_endpoint("users", CacheStrategy::Ttl, 60);
    let orders = cached_endpoint("orders", CacheStrategy::Ttl, 60);

    for path in ["/users/1", "/users/2", "/profile"] {
        assert!(cache.put(&get(path), &response(200, "application/json", "{}"), &users).await);
    }
    let tagged = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/json")
        .header(CACHE_TAG_HEADER, "orders, invoices")
        .body(Bytes::from_static(b"{}"))
        .unwrap();
    assert!(cache.put(&get("/orders/9"), &tagged, &orders).await);

    assert_eq!(cache.invalidate_by_pattern("users", "GET:/users/*", "deploy").await.unwrap(), 2);
    assert!(cache.get(&get("/users/1"), &users).await.is_none());
    assert!(cache.get(&get("/profile"), &users).await.is_some());

    assert_eq!(cache.invalidate_by_tag(None, "invoices", "billing").await.unwrap(), 1);
    assert!(cache.get(&get("/orders/9"), &orders).await.is_none());

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(cache.invalidate_older_than(Some("users"), cutoff, "ops").await.unwrap(), 1);
    assert_eq!(cache.get_statistics().entries, 0);

    let log = cache.invalidation_log().await;
    let kinds: Vec<InvalidationType> = log.iter().map(|r| r.invalidation_type).collect();
    assert_eq!(
        kinds,
        vec![InvalidationType::Pattern, InvalidationType::Tag, InvalidationType::Time]
    );
    assert_eq!(log[0].affected, 2);
    assert_eq!(log[1].triggered_by, "billing");
    assert_eq!(sink.names().iter().filter(|n| **n == "cache_invalidated").count(), 3);
}

#[tokio::test]
async fn test_sweeper_purges_expired_entries() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let config = CacheConfig {
        sweep_interval_secs: Some(1),
        ..CacheConfig::default()
    };
    let cache = Arc::new(ResponseCache::new(config, store.clone(), sink, None));
    let endpoint = cached_endpoint("feed", CacheStrategy::Ttl, 1);

    assert!(cache.put(&get("/feed"), &response(200, "text/plain", "x"), &endpoint).await);
    let sweeper = cache.clone().spawn_sweeper().unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(store.is_empty());
    assert_eq!(cache.get_statistics().entries, 0);
    assert_eq!(cache.get_statistics().expired, 1);

    cache.shutdown();
    tokio::time::timeout(Duration::from_secs(5), sweeper)
        .await
        .unwrap()
        .unwrap();
}

struct UnavailableStore;

#[async_trait]
impl CacheStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn purge_expired(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn test_store_outage_degrades_to_pass_through() {
    let (cache, _) = cache_with(Arc::new(UnavailableStore));
    let endpoint = cached_endpoint("users", CacheStrategy::Ttl, 60);
    let request = get("/users");

    assert!(cache.get(&request, &endpoint).await.is_none());
    assert!(!cache.put(&request, &response(200, "application/json", "[]"), &endpoint).await);
    assert_eq!(cache.purge_expired().await, 0);
    assert!(cache.invalidate_by_tag(None, "users", "ops").await.is_err());

    let stats = cache.get_statistics();
    assert_eq!(stats.store_errors, 3);
    assert_eq!(stats.misses, 1);
}
