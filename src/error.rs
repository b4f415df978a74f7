//! Error types.
//!
//! The scheduler reports exactly two submission failures; everything else is
//! either a programming error (asserted) or the task body's own business.
//! Task closures have no error channel: a panic inside a task terminates
//! the process.

use thiserror::Error;

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The task or dependent pool has no free slot. Transient: callers may
    /// retry once in-flight tasks complete.
    #[error("task pool is full")]
    PoolFull,
    /// The scheduler was closed; no further tasks are admitted.
    #[error("scheduler is closed")]
    Closed,
}
