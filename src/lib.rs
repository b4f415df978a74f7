//! In-process task scheduler for frame-oriented workloads.
//!
//! `weft` drives a real-time application in which every frame is a
//! dependency graph of short work items spread across a small fixed set of
//! worker threads. Tasks are submitted with zero or more predecessors and an
//! optional worker affinity; they run as soon as every predecessor has
//! completed, workers keep each other busy by stealing, idle workers park
//! without losing wakeups, and shutdown is deterministic.
//!
//! The concurrency primitives the scheduler is built from are exported as
//! reusable pieces:
//!
//! - [`SlotPool`]: a recycling slot table handing out generation-tagged
//!   [`Handle`]s, safe against stale-handle aliasing.
//! - [`WorkStealingDeque`]: a single-owner, many-thief deque of POD handles.
//! - [`Pulse`]: a one-shot latching park/unpark primitive.
//! - [`WaitCounter`]: a count-to-zero latch with RAII units.
//! - [`TaskFn`]: a small-buffer-optimized type-erased closure.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let scheduler = weft::Scheduler::new(4);
//! let ran = Arc::new(AtomicU32::new(0));
//! let observed = Arc::clone(&ran);
//! scheduler.run(move |ctx| {
//!     let done = ctx.clone();
//!     let ran = Arc::clone(&observed);
//!     ctx.submit(
//!         move || {
//!             ran.fetch_add(1, Ordering::SeqCst);
//!             done.stop();
//!         },
//!         &[],
//!         None,
//!     )
//!     .expect("fresh scheduler admits tasks");
//! });
//! assert_eq!(ran.load(Ordering::SeqCst), 1);
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod closure;
pub mod config;
pub mod deque;
pub mod error;
pub mod handle;
pub mod pool;
pub mod pulse;
pub mod ring;
pub mod scheduler;
pub mod wait_counter;

pub use closure::TaskFn;
pub use config::{ConfigError, SchedulerConfig};
pub use deque::WorkStealingDeque;
pub use error::SubmitError;
pub use handle::Handle;
pub use pool::SlotPool;
pub use pulse::Pulse;
pub use ring::BoundedRing;
pub use scheduler::{Ctx, Scheduler, TaskId, WorkerId, MAX_WORKERS, NO_AFFINITY};
pub use wait_counter::{WaitCounter, WaitGuard};
