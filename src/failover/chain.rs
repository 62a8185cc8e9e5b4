// src/failover/chain.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    #[default]
    Sequential,
    /// Reserved; rejected at configuration time.
    Parallel,
    /// Reserved; rejected at configuration time.
    Priority,
}

impl FailoverStrategy {
    pub fn is_supported(&self) -> bool {
        matches!(self, FailoverStrategy::Sequential)
    }
}

impl fmt::Display for FailoverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverStrategy::Sequential => "sequential",
            FailoverStrategy::Parallel => "parallel",
            FailoverStrategy::Priority => "priority",
        };
        f.write_str(name)
    }
}

/// Ordered fallback list behind one primary.
///
/// `current_index` points into `[primary, fallbacks...]`; index 0 is the
/// primary itself. An exhausted chain has no effective endpoint until one of
/// its members recovers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverChain {
    pub primary_id: String,
    pub fallback_ids: Vec<String>,
    pub current_index: usize,
    pub strategy: FailoverStrategy,
    pub total_failovers: u64,
    pub successful_failovers: u64,
    pub exhausted: bool,
    pub last_failover_at: Option<DateTime<Utc>>,
}

impl FailoverChain {
    pub fn new(
        primary_id: impl Into<String>,
        fallback_ids: Vec<String>,
        strategy: FailoverStrategy,
    ) -> Self {
        Self {
            primary_id: primary_id.into(),
            fallback_ids,
            current_index: 0,
            strategy,
            total_failovers: 0,
            successful_failovers: 0,
            exhausted: false,
            last_failover_at: None,
        }
    }

    pub fn member_count(&self) -> usize {
        1 + self.fallback_ids.len()
    }

    pub fn member(&self, index: usize) -> Option<&str> {
        match index {
            0 => Some(self.primary_id.as_str()),
            n => self.fallback_ids.get(n - 1).map(String::as_str),
        }
    }

    pub fn position(&self, endpoint_id: &str) -> Option<usize> {
        (0..self.member_count()).find(|&i| self.member(i) == Some(endpoint_id))
    }

    pub fn effective_endpoint(&self) -> Option<&str> {
        if self.exhausted {
            None
        } else {
            self.member(self.current_index)
        }
    }

    /// Moves to the first healthy member after the current one. When none
    /// qualifies the index wraps to 0 and the chain is marked exhausted.
    pub fn advance<F>(&mut self, is_healthy: F, now: DateTime<Utc>) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        self.total_failovers += 1;
        self.last_failover_at = Some(now);

        let next = (self.current_index + 1..self.member_count())
            .find(|&i| self.member(i).map(&is_healthy).unwrap_or(false));

        match next {
            Some(index) => {
                self.current_index = index;
                self.exhausted = false;
                self.successful_failovers += 1;
                self.member(index).map(str::to_string)
            }
            None => {
                self.current_index = 0;
                self.exhausted = true;
                None
            }
        }
    }

    /// Points the chain back at `index`, clearing exhaustion. Returns `false`
    /// when it was already there.
    pub fn restore(&mut self, index: usize) -> bool {
        if index >= self.member_count() || (!self.exhausted && self.current_index == index) {
            return false;
        }
        self.current_index = index;
        self.exhausted = false;
        true
    }

    /// Drops a fallback that is no longer registered.
    pub fn remove_fallback(&mut self, endpoint_id: &str) -> bool {
        let Some(index) = self.position(endpoint_id).filter(|&i| i > 0) else {
            return false;
        };
        self.fallback_ids.remove(index - 1);
        if self.current_index == index {
            self.current_index = 0;
        } else if self.current_index > index {
            self.current_index -= 1;
        }
        true
    }
}
