// src/load_balancer/mod.rs
mod algorithm;
mod balancer;
mod health_based;
mod ip_hash;
mod least_connections;
mod random;
mod round_robin;
mod weighted_round_robin;

pub use algorithm::{Candidate, LoadBalancingAlgorithm, SelectionContext, SelectionStrategy};
pub use balancer::{GroupStatistics, LoadBalancer, LoadBalancerStatistics, SelectedEndpoint};
pub use health_based::{selection_score, HealthBasedStrategy};
pub use ip_hash::IpHashStrategy;
pub use least_connections::{LeastConnectionsStrategy, WeightedLeastConnectionsStrategy};
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use weighted_round_robin::WeightedRoundRobinStrategy;

use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BalancerError {
    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(String),

    #[error("Endpoint {0} is already registered")]
    DuplicateEndpoint(String),

    #[error("Invalid endpoint {id}: {reason}")]
    InvalidEndpoint { id: String, reason: String },

    #[error("Unknown load balancing algorithm {0:?}")]
    UnknownAlgorithm(String),
}

pub fn create_strategy(algorithm: LoadBalancingAlgorithm) -> Arc<dyn SelectionStrategy> {
    match algorithm {
        LoadBalancingAlgorithm::RoundRobin => Arc::new(RoundRobinStrategy::new()),
        LoadBalancingAlgorithm::LeastConnections => Arc::new(LeastConnectionsStrategy),
        LoadBalancingAlgorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobinStrategy::new()),
        LoadBalancingAlgorithm::WeightedLeastConnections => {
            Arc::new(WeightedLeastConnectionsStrategy)
        }
        LoadBalancingAlgorithm::IpHash => Arc::new(IpHashStrategy::new()),
        LoadBalancingAlgorithm::Random => Arc::new(RandomStrategy),
        LoadBalancingAlgorithm::HealthBased => Arc::new(HealthBasedStrategy),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Candidate, SelectionContext};
    use crate::endpoint::{Endpoint, EndpointLoad};
    use chrono::Utc;
    use std::sync::Arc;
    use url::Url;

    pub fn candidates(weights: &[(&str, u32)]) -> Vec<Candidate> {
        weights
            .iter()
            .map(|(id, weight)| {
                let url = Url::parse(&format!("http://{id}.internal")).unwrap();
                Candidate::new(
                    Arc::new(Endpoint::new(*id, url).with_weight(*weight)),
                    EndpointLoad::new(*id),
                )
            })
            .collect()
    }

    pub fn ctx(group: &str) -> SelectionContext<'_> {
        SelectionContext {
            group,
            client_ip: None,
            now: Utc::now(),
        }
    }
}
