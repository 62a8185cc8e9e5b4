// src/cache/store.rs
use super::pattern::glob_match;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache store rejected {key}: {reason}")]
    Rejected { key: String, reason: String },
}

/// Shared key-value store holding encoded cache entries. Implementations
/// must be safe for concurrent use; the cache adds no locking of its own.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys matching a glob (`*`, `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Drops entries past their TTL and returns their keys.
    async fn purge_expired(&self) -> Result<Vec<String>, StoreError>;
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process store with per-key TTL.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(stored) if stored.expires_at > now => return Ok(Some(stored.value.clone())),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, stored| stored.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::Rejected {
                key: key.to_string(),
                reason: "zero ttl".into(),
            });
        }
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.expires_at > now && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, stored| stored.expires_at <= now)
                .is_some()
            {
                removed.push(key);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store.set("a", b"1".to_vec(), Duration::from_millis(20)).await.unwrap();
        store.set("b", b"2".to_vec(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.purge_expired().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_by_glob() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        for key in ["ns:a:GET:/x:1", "ns:a:GET:/y:2", "ns:b:GET:/x:3"] {
            store.set(key, Vec::new(), ttl).await.unwrap();
        }

        let mut keys = store.keys("ns:a:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns:a:GET:/x:1", "ns:a:GET:/y:2"]);
        assert!(store.delete("ns:b:GET:/x:3").await.unwrap());
        assert!(!store.delete("ns:b:GET:/x:3").await.unwrap());
    }
}
