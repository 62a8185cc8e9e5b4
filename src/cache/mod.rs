// src/cache/mod.rs
mod entry;
mod key;
mod pattern;
mod response_cache;
mod store;

pub use entry::{compress_content, CacheEntry};
pub use key::{CacheKey, KEY_HEADERS};
pub use pattern::{escape as escape_glob, glob_match};
pub use response_cache::{
    CacheInvalidationRecord, CacheStatistics, InvalidationType, ResponseCache, CACHE_TAG_HEADER,
};
pub use store::{CacheStore, MemoryStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to encode cache entry: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),
}
