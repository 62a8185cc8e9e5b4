// src/endpoint/descriptor.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

pub const DEFAULT_GROUP: &str = "default";

/// Probes never wait longer than this, whatever the check interval says.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint id must not be empty")]
    EmptyId,

    #[error("endpoint id {id:?} must not contain ':'")]
    InvalidId { id: String },

    #[error("endpoint {id}: {field} must be greater than zero")]
    ZeroValue { id: String, field: &'static str },

    #[error("endpoint {id}: expected status list must not be empty")]
    NoExpectedStatus { id: String },

    #[error("endpoint {id}: invalid health check method {method}")]
    InvalidMethod { id: String, method: String },
}

/// An upstream target. Only `weight` and `priority` change after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub url: Url,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            group: default_group(),
            weight: default_weight(),
            priority: 0,
            cache: CachePolicy::default(),
            health_check: HealthCheckSettings::default(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckSettings) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.id.trim().is_empty() {
            return Err(EndpointError::EmptyId);
        }
        // ':' separates cache key segments
        if self.id.contains(':') {
            return Err(EndpointError::InvalidId {
                id: self.id.clone(),
            });
        }

        let hc = &self.health_check;
        let zero = |field| EndpointError::ZeroValue {
            id: self.id.clone(),
            field,
        };
        if hc.failure_threshold == 0 {
            return Err(zero("failure_threshold"));
        }
        if hc.recovery_threshold == 0 {
            return Err(zero("recovery_threshold"));
        }
        if hc.check_interval_secs == 0 {
            return Err(zero("check_interval_secs"));
        }
        if hc.expected_status.is_empty() {
            return Err(EndpointError::NoExpectedStatus {
                id: self.id.clone(),
            });
        }
        if reqwest::Method::from_bytes(hc.method.as_bytes()).is_err() {
            return Err(EndpointError::InvalidMethod {
                id: self.id.clone(),
                method: hc.method.clone(),
            });
        }

        Ok(())
    }
}

/// Per-endpoint caching policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: CacheStrategy,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl CachePolicy {
    pub fn enabled(strategy: CacheStrategy, ttl_secs: u64) -> Self {
        Self {
            enabled: true,
            strategy,
            ttl_secs,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: CacheStrategy::default(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Caching disabled regardless of `enabled`.
    None,
    /// Cache safe methods (GET, HEAD) for the configured TTL.
    #[default]
    Ttl,
    /// Cache any method; the method is part of the key.
    Aggressive,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::None => "none",
            CacheStrategy::Ttl => "ttl",
            CacheStrategy::Aggressive => "aggressive",
        }
    }

    pub fn allows_method(&self, method: &hyper::Method) -> bool {
        match self {
            CacheStrategy::None => false,
            CacheStrategy::Ttl => *method == hyper::Method::GET || *method == hyper::Method::HEAD,
            CacheStrategy::Aggressive => true,
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an endpoint is probed and how its failure streaks are judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_expected_status")]
    pub expected_status: Vec<u16>,
    #[serde(default = "default_expected_max_latency_ms")]
    pub expected_max_latency_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl HealthCheckSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        self.check_interval().min(MAX_PROBE_TIMEOUT)
    }
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            method: default_health_method(),
            headers: BTreeMap::new(),
            body: None,
            expected_status: default_expected_status(),
            expected_max_latency_ms: default_expected_max_latency_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> Vec<u16> {
    vec![200]
}

fn default_expected_max_latency_ms() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

fn default_check_interval_secs() -> u64 {
    30
}
