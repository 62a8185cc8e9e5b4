// src/load_balancer/weighted_round_robin.rs
use super::{Candidate, SelectionContext, SelectionStrategy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

/// Smooth weighted round robin.
///
/// Every pick adds each endpoint's weight to its running weight, chooses the
/// largest and subtracts the total from the winner. Weight-0 endpoints are
/// skipped unless every candidate has weight 0, in which case all count as 1.
#[derive(Default)]
pub struct WeightedRoundRobinStrategy {
    current: DashMap<String, HashMap<String, i64>>,
}

impl WeightedRoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionStrategy for WeightedRoundRobinStrategy {
    async fn select(&self, candidates: &[Candidate], ctx: &SelectionContext<'_>) -> Option<usize> {
        let uniform = candidates.iter().all(|c| c.weight() == 0);
        let weight = |c: &Candidate| if uniform { 1 } else { i64::from(c.weight()) };
        let total: i64 = candidates.iter().map(weight).sum();
        if total == 0 {
            return None;
        }

        let mut state = self.current.entry(ctx.group.to_string()).or_default();
        state.retain(|id, _| candidates.iter().any(|c| c.id() == id));

        let mut best: Option<(usize, i64)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let w = weight(candidate);
            if w == 0 {
                continue;
            }
            let running = state.entry(candidate.id().to_string()).or_insert(0);
            *running += w;
            if best.map_or(true, |(_, top)| *running > top) {
                best = Some((index, *running));
            }
        }

        let (index, _) = best?;
        if let Some(running) = state.get_mut(candidates[index].id()) {
            *running -= total;
        }
        Some(index)
    }

    async fn reset(&self) {
        self.current.clear();
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{candidates, ctx};

    async fn picks(strategy: &WeightedRoundRobinStrategy, list: &[Candidate], n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let index = strategy.select(list, &ctx("web")).await.unwrap();
            out.push(list[index].id().to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_smooth_sequence() {
        let strategy = WeightedRoundRobinStrategy::new();
        let list = candidates(&[("a", 5), ("b", 1), ("c", 1)]);

        // a is spread out rather than picked five times in a row
        assert_eq!(
            picks(&strategy, &list, 7).await,
            vec!["a", "a", "b", "a", "c", "a", "a"]
        );
    }

    #[tokio::test]
    async fn test_zero_weight_is_skipped() {
        let strategy = WeightedRoundRobinStrategy::new();
        let list = candidates(&[("a", 0), ("b", 2)]);

        assert!(picks(&strategy, &list, 10).await.iter().all(|id| id == "b"));
    }

    #[tokio::test]
    async fn test_all_zero_weights_behave_as_equal() {
        let strategy = WeightedRoundRobinStrategy::new();
        let list = candidates(&[("a", 0), ("b", 0)]);

        assert_eq!(picks(&strategy, &list, 4).await, vec!["a", "b", "a", "b"]);
    }
}
