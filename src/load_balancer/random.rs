// src/load_balancer/random.rs
use super::{Candidate, SelectionContext, SelectionStrategy};
use async_trait::async_trait;
use rand::Rng;

#[derive(Debug, Default)]
pub struct RandomStrategy;

#[async_trait]
impl SelectionStrategy for RandomStrategy {
    async fn select(&self, candidates: &[Candidate], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
