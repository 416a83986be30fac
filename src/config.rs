//! Scheduler construction parameters.
//!
//! The crate performs no file or environment parsing; embedding applications
//! deserialize [`SchedulerConfig`] from whatever source they use and hand it
//! to [`PrioritizedQueue::from_config`](crate::scheduler::PrioritizedQueue::from_config).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Construction parameters for a [`PrioritizedQueue`](crate::scheduler::PrioritizedQueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total system capacity in requests per virtual tick. Also serves as
    /// the token cap of each weighted subqueue.
    pub system_throughput: u64,
    /// Minimum cost attributed to a weighted item; smaller costs are raised.
    pub min_cost: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            system_throughput: 1000,
            min_cost: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system_throughput == 0 {
            return Err(ConfigError::ZeroThroughput);
        }
        if self.min_cost > self.system_throughput {
            return Err(ConfigError::MinCostAboveCap {
                min_cost: self.min_cost,
                cap: self.system_throughput,
            });
        }
        Ok(())
    }
}

/// Validation failures for a [`SchedulerConfig`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("system throughput must be non-zero")]
    ZeroThroughput,
    #[error("min cost ({min_cost}) exceeds the per-subqueue token cap ({cap})")]
    MinCostAboveCap { min_cost: u64, cap: u64 },
}
