// src/load_balancer/least_connections.rs
use super::{Candidate, SelectionContext, SelectionStrategy};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct LeastConnectionsStrategy;

#[async_trait]
impl SelectionStrategy for LeastConnectionsStrategy {
    async fn select(&self, candidates: &[Candidate], _ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.load.current_connections)
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Minimizes `connections / max(weight, 1)`.
#[derive(Debug, Default)]
pub struct WeightedLeastConnectionsStrategy;

#[async_trait]
impl SelectionStrategy for WeightedLeastConnectionsStrategy {
    async fn select(&self, candidates: &[Candidate], _ctx: &SelectionContext<'_>) -> Option<usize> {
        let ratio = |c: &Candidate| c.load.current_connections as f64 / c.weight().max(1) as f64;
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| ratio(a).total_cmp(&ratio(b)))
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "weighted_least_connections"
    }
}
