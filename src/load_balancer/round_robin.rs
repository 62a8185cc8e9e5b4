// src/load_balancer/round_robin.rs
use super::{Candidate, SelectionContext, SelectionStrategy};
use async_trait::async_trait;
use dashmap::DashMap;

/// Cycles through the active list, one counter per group.
#[derive(Default)]
pub struct RoundRobinStrategy {
    counters: DashMap<String, usize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionStrategy for RoundRobinStrategy {
    async fn select(&self, candidates: &[Candidate], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let mut counter = self.counters.entry(ctx.group.to_string()).or_insert(0);
        let index = *counter % candidates.len();
        *counter = counter.wrapping_add(1);
        Some(index)
    }

    async fn reset(&self) {
        self.counters.clear();
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
