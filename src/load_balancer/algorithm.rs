// src/load_balancer/algorithm.rs
use super::BalancerError;
use crate::endpoint::{Endpoint, EndpointLoad};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    WeightedLeastConnections,
    IpHash,
    Random,
    HealthBased,
}

impl LoadBalancingAlgorithm {
    pub const ALL: [LoadBalancingAlgorithm; 7] = [
        LoadBalancingAlgorithm::RoundRobin,
        LoadBalancingAlgorithm::LeastConnections,
        LoadBalancingAlgorithm::WeightedRoundRobin,
        LoadBalancingAlgorithm::WeightedLeastConnections,
        LoadBalancingAlgorithm::IpHash,
        LoadBalancingAlgorithm::Random,
        LoadBalancingAlgorithm::HealthBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingAlgorithm::RoundRobin => "round_robin",
            LoadBalancingAlgorithm::LeastConnections => "least_connections",
            LoadBalancingAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancingAlgorithm::WeightedLeastConnections => "weighted_least_connections",
            LoadBalancingAlgorithm::IpHash => "ip_hash",
            LoadBalancingAlgorithm::Random => "random",
            LoadBalancingAlgorithm::HealthBased => "health_based",
        }
    }
}

impl fmt::Display for LoadBalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingAlgorithm {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| BalancerError::UnknownAlgorithm(s.to_string()))
    }
}

/// An eligible endpoint with a snapshot of its load taken for this selection.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub endpoint: Arc<Endpoint>,
    pub load: EndpointLoad,
}

impl Candidate {
    pub fn new(endpoint: Arc<Endpoint>, load: EndpointLoad) -> Self {
        Self { endpoint, load }
    }

    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn weight(&self) -> u32 {
        self.endpoint.weight
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub group: &'a str,
    pub client_ip: Option<IpAddr>,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    /// Picks an index into `candidates`. Callers never pass an empty slice.
    async fn select(&self, candidates: &[Candidate], ctx: &SelectionContext<'_>) -> Option<usize>;

    /// Drops algorithm-local state such as counters or cached rings.
    async fn reset(&self) {}

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for algorithm in LoadBalancingAlgorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<LoadBalancingAlgorithm>().unwrap(), algorithm);
        }
        assert!(matches!(
            "fastest".parse::<LoadBalancingAlgorithm>(),
            Err(BalancerError::UnknownAlgorithm(name)) if name == "fastest"
        ));
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&LoadBalancingAlgorithm::WeightedLeastConnections).unwrap();
        assert_eq!(json, "\"weighted_least_connections\"");
    }
}
