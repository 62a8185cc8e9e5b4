// src/config/models.rs
use crate::endpoint::Endpoint;
use crate::failover::FailoverStrategy;
use crate::load_balancer::LoadBalancingAlgorithm;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint
                .validate()
                .with_context(|| format!("Invalid endpoint {:?}", endpoint.id))?;
            if !ids.insert(endpoint.id.as_str()) {
                bail!("Duplicate endpoint id {:?}", endpoint.id);
            }
        }

        let mut primaries = HashSet::new();
        for chain in &self.chains {
            if !chain.strategy.is_supported() {
                bail!(
                    "Chain for {:?} uses strategy {}, which is not supported",
                    chain.primary,
                    chain.strategy
                );
            }
            if !primaries.insert(chain.primary.as_str()) {
                bail!("Duplicate failover chain for {:?}", chain.primary);
            }
            for id in std::iter::once(&chain.primary).chain(&chain.fallbacks) {
                if !ids.contains(id.as_str()) {
                    bail!(
                        "Failover chain for {:?} references unknown endpoint {:?}",
                        chain.primary,
                        id
                    );
                }
            }
        }

        self.failover.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub primary: String,
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub strategy: FailoverStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_recovery_check_interval_secs")]
    pub recovery_check_interval_secs: u64,
    #[serde(default = "default_statistics_interval_secs")]
    pub statistics_interval_secs: u64,
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_true")]
    pub probe_offline_in_recovery: bool,
}

impl FailoverConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_check_interval_secs)
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_secs(self.statistics_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval_secs == 0
            || self.recovery_check_interval_secs == 0
            || self.statistics_interval_secs == 0
        {
            bail!("Failover loop intervals must be greater than zero");
        }
        if self.max_concurrent_checks == 0 {
            bail!("failover.max_concurrent_checks must be greater than zero");
        }
        Ok(())
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            recovery_check_interval_secs: default_recovery_check_interval_secs(),
            statistics_interval_secs: default_statistics_interval_secs(),
            max_concurrent_checks: default_max_concurrent_checks(),
            history_size: default_history_size(),
            probe_offline_in_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub algorithm: LoadBalancingAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
    #[serde(default = "default_compression_min_bytes")]
    pub compression_min_bytes: usize,
    /// Fraction of the original size compression must save to be kept.
    #[serde(default = "default_min_compression_savings")]
    pub min_compression_savings: f64,
    /// Background sweep of expired entries; lazy expiration always applies.
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            bail!("cache.namespace must be non-empty and must not contain ':'");
        }
        if !(0.0..1.0).contains(&self.min_compression_savings) {
            bail!("cache.min_compression_savings must be in [0, 1)");
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_content_bytes: default_max_content_bytes(),
            compression_min_bytes: default_compression_min_bytes(),
            min_compression_savings: default_min_compression_savings(),
            sweep_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_stats_path")]
    pub stats_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
            stats_path: default_stats_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_recovery_check_interval_secs() -> u64 {
    60
}

fn default_statistics_interval_secs() -> u64 {
    300
}

fn default_max_concurrent_checks() -> usize {
    10
}

fn default_history_size() -> usize {
    crate::health::DEFAULT_HISTORY_SIZE
}

fn default_namespace() -> String {
    "proxy_cache".to_string()
}

fn default_max_content_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_compression_min_bytes() -> usize {
    1024
}

fn default_min_compression_savings() -> f64 {
    0.10
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_stats_path() -> String {
    "/stats".to_string()
}
