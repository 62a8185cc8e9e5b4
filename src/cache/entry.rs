// src/cache/entry.rs
use super::CacheError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::Response;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A cached response as written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_content")]
    pub content: Vec<u8>,
    pub compressed: bool,
    pub content_type: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Stored size over original size; 1.0 when stored as-is.
    pub compression_ratio: f64,
    pub original_size: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn stored_size(&self) -> usize {
        self.content.len()
    }

    /// Original bytes, decompressed if needed.
    pub fn body(&self) -> Result<Bytes, CacheError> {
        if !self.compressed {
            return Ok(Bytes::from(self.content.clone()));
        }

        let mut decoded = Vec::with_capacity(self.original_size);
        GzDecoder::new(self.content.as_slice()).read_to_end(&mut decoded)?;
        if decoded.len() != self.original_size {
            return Err(CacheError::InvalidEntry(format!(
                "decompressed {} bytes, expected {}",
                decoded.len(),
                self.original_size
            )));
        }
        Ok(Bytes::from(decoded))
    }

    pub fn to_response(&self) -> Result<Response<Bytes>, CacheError> {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(self.body()?)
            .map_err(|e| CacheError::InvalidEntry(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Gzips `content` when it is at least `min_size` bytes and the result saves
/// at least `min_savings` of the original. Returns the bytes to store and
/// whether they are compressed.
pub fn compress_content(
    content: &[u8],
    min_size: usize,
    min_savings: f64,
) -> Result<(Vec<u8>, bool), CacheError> {
    if content.len() < min_size || content.is_empty() {
        return Ok((content.to_vec(), false));
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(content.len() / 2), Compression::default());
    encoder.write_all(content)?;
    let compressed = encoder.finish()?;

    let limit = content.len() as f64 * (1.0 - min_savings);
    if (compressed.len() as f64) <= limit {
        Ok((compressed, true))
    } else {
        Ok((content.to_vec(), false))
    }
}

mod base64_content {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: Vec<u8>, compressed: bool, original_size: usize) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            content,
            compressed,
            content_type: Some("application/json".into()),
            cached_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            compression_ratio: 1.0,
            original_size,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_small_content_is_left_alone() {
        let (stored, compressed) = compress_content(b"{\"ok\":true}", 1024, 0.1).unwrap();
        assert!(!compressed);
        assert_eq!(stored, b"{\"ok\":true}");
    }

    #[test]
    fn test_repetitive_content_is_compressed() {
        let body = "{\"value\":\"abcdef\"},".repeat(200).into_bytes();
        let (stored, compressed) = compress_content(&body, 1024, 0.1).unwrap();

        assert!(compressed);
        assert!(stored.len() < body.len() / 2);
        assert_eq!(entry(stored, true, body.len()).body().unwrap(), Bytes::from(body));
    }

    #[test]
    fn test_incompressible_content_is_stored_raw() {
        // pseudo-random bytes from a simple LCG do not gzip well
        let mut state: u32 = 0x1234_5678;
        let body: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();

        let (stored, compressed) = compress_content(&body, 1024, 0.1).unwrap();
        assert!(!compressed);
        assert_eq!(stored, body);
    }

    #[test]
    fn test_encoded_entry_survives_the_store() {
        let original = entry(b"hello".to_vec(), false, 5);
        let decoded = CacheEntry::decode(&original.encode().unwrap()).unwrap();

        assert_eq!(decoded, original);
        let response = decoded.to_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.body(), &Bytes::from_static(b"hello"));
    }
}
