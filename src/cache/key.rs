// src/cache/key.rs
use crate::endpoint::Endpoint;
use chrono::{DateTime, Utc};
use hyper::Request;
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Request headers that take part in the key. Everything else is ignored so
/// unrelated headers do not fragment the cache.
pub const KEY_HEADERS: [&str; 5] = [
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
    "user-agent",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheKey {
    /// SHA-256 (hex) of the canonical request description.
    pub hash: String,
    pub readable: String,
    pub namespace: String,
    pub endpoint_id: String,
    pub method: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub priority: i32,
}

impl CacheKey {
    pub fn from_request<B>(namespace: &str, endpoint: &Endpoint, request: &Request<B>) -> Self {
        let method = request.method().as_str().to_ascii_uppercase();
        let path = request.uri().path().to_string();
        let query = canonical_query(request.uri().query());
        let headers = canonical_headers(request);

        let canonical = [
            endpoint.id.as_str(),
            method.as_str(),
            path.as_str(),
            query.as_str(),
            headers.as_str(),
            endpoint.cache.strategy.as_str(),
        ]
        .join("\n");
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));

        let readable = if query.is_empty() {
            format!("{method} {path}")
        } else {
            format!("{method} {path}?{query}")
        };

        Self {
            hash,
            readable,
            namespace: namespace.to_string(),
            endpoint_id: endpoint.id.clone(),
            method,
            path,
            created_at: Utc::now(),
            ttl_secs: endpoint.cache.ttl_secs,
            priority: endpoint.priority,
        }
    }

    /// Location in the store: `{namespace}:{endpoint}:{METHOD}:{path}:{hash}`.
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.namespace, self.endpoint_id, self.method, self.path, self.hash
        )
    }
}

fn canonical_query(query: Option<&str>) -> String {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return String::new();
    };

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn canonical_headers<B>(request: &Request<B>) -> String {
    KEY_HEADERS
        .iter()
        .filter_map(|name| {
            let values: Vec<&str> = request
                .headers()
                .get_all(*name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::trim)
                .collect();
            (!values.is_empty()).then(|| format!("{name}={}", values.join(",")))
        })
        .collect::<Vec<_>>()
        .join("&")
}
