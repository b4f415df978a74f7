//! Scheduler configuration.
//!
//! A plain struct with explicit validation; [`SchedulerConfig::default`]
//! sizes the pools for a frame's worth of short tasks and picks a worker
//! count from the machine's available parallelism.

use crate::handle::Handle;
use crate::scheduler::{DEP_INDEX_BITS, MAX_WORKERS, TASK_INDEX_BITS};
use std::time::Duration;
use thiserror::Error;

/// Construction-time parameters for a [`crate::Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker thread count, `1..=16`.
    pub workers: u16,
    /// Capacity of the task pool.
    pub max_tasks: u32,
    /// Capacity of the dependent-edge pool.
    pub max_dependents: u32,
    /// Per-worker deque ring size as a power of two; one slot stays unused.
    pub deque_capacity_bits: u32,
    /// Bound on a thief's wait for the deque mutex. Zero degenerates to a
    /// try-lock, which keeps the steal rotation fully non-blocking.
    pub steal_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map_or(4, |n| n.get().min(MAX_WORKERS) as u16);
        Self {
            workers,
            max_tasks: 1 << 17,
            max_dependents: 1 << 17,
            deque_capacity_bits: 8,
            steal_timeout: Duration::ZERO,
        }
    }
}

impl SchedulerConfig {
    /// Checks the guardrail invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.workers as usize > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers(self.workers));
        }
        if self.max_tasks == 0 || self.max_tasks > Handle::<TASK_INDEX_BITS>::MAX_CAPACITY {
            return Err(ConfigError::TaskPoolOutOfRange(self.max_tasks));
        }
        if self.max_dependents == 0 || self.max_dependents > Handle::<DEP_INDEX_BITS>::MAX_CAPACITY
        {
            return Err(ConfigError::DependentPoolOutOfRange(self.max_dependents));
        }
        if self.deque_capacity_bits == 0 || self.deque_capacity_bits > 16 {
            return Err(ConfigError::DequeBitsOutOfRange(self.deque_capacity_bits));
        }
        Ok(())
    }
}

/// A configuration value outside its guardrails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// At least one worker is required.
    #[error("at least one worker is required")]
    NoWorkers,
    /// Worker ids are packed into 16 slots.
    #[error("{0} workers exceeds the maximum of 16")]
    TooManyWorkers(u16),
    /// Task pool capacity must fit the handle index space.
    #[error("task pool capacity {0} out of range")]
    TaskPoolOutOfRange(u32),
    /// Dependent pool capacity must fit the handle index space.
    #[error("dependent pool capacity {0} out of range")]
    DependentPoolOutOfRange(u32),
    /// Deque rings are kept between 2 and 65536 slots.
    #[error("deque capacity bits {0} out of range")]
    DequeBitsOutOfRange(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.workers >= 1);
        assert!(config.workers as usize <= MAX_WORKERS);
    }

    #[test]
    fn worker_bounds_are_enforced() {
        let mut config = SchedulerConfig::default();
        config.workers = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));
        config.workers = 17;
        assert_eq!(config.validate(), Err(ConfigError::TooManyWorkers(17)));
        config.workers = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pool_capacities_must_fit_the_index_space() {
        let mut config = SchedulerConfig::default();
        config.max_tasks = Handle::<TASK_INDEX_BITS>::MAX_CAPACITY + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TaskPoolOutOfRange(_))
        ));

        let mut config = SchedulerConfig::default();
        config.max_dependents = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DependentPoolOutOfRange(0))
        ));
    }

    #[test]
    fn deque_bits_are_bounded() {
        let mut config = SchedulerConfig::default();
        config.deque_capacity_bits = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DequeBitsOutOfRange(0))
        );
        config.deque_capacity_bits = 17;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DequeBitsOutOfRange(17))
        );
    }
}
