//! Worker thread loop: drain, steal, park.

use super::graph::TaskId;
use super::{CurrentWorkerGuard, Shared, WorkerId, WorkerShared};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, trace};

/// One scheduler worker; `run` is its thread body.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    id: WorkerId,
}

/// Aborts the process if a task closure unwinds.
///
/// Task bodies are assumed not to panic; a worker that unwound mid-task
/// would strand its queues and the in-flight accounting, so the contract is
/// to bring the process down instead.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("task closure panicked; aborting");
            std::process::abort();
        }
    }
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, id: WorkerId) -> Self {
        Self { shared, id }
    }

    fn me(&self) -> &WorkerShared {
        &self.shared.workers[self.id as usize]
    }

    /// The worker loop.
    ///
    /// Drains local work, then rotates through peers stealing; after a full
    /// empty rotation the worker parks on its pulse. A wakeup carries a
    /// `steal_from` hint that is tried once before scanning resumes.
    pub(crate) fn run(self) {
        let _unit = self.shared.workers_active.adopt();
        let _identity = CurrentWorkerGuard::set(&self.shared, self.id);
        let me = self.me();
        let n = self.shared.workers.len() as WorkerId;
        trace!(worker = self.id, "worker starting");

        self.drain_local();
        me.available.store(true, Ordering::Release);

        let mut empty_runs: u16 = 0;
        let mut steal_id = me.steal_from.load(Ordering::Acquire);
        while !me.stop.load(Ordering::Acquire) {
            let stole = if n > 1 {
                steal_id = Self::next_target(steal_id, self.id, n);
                self.steal_and_execute(steal_id)
            } else {
                false
            };

            if stole {
                if !me.available.swap(false, Ordering::AcqRel) {
                    // A delegator claimed us while we were busy stealing;
                    // honor its hint before resuming the scan.
                    let hint = me.steal_from.load(Ordering::Acquire);
                    if hint != steal_id && self.steal_and_execute(hint) {
                        trace!(worker = self.id, from = hint, "handled interleaved wakeup");
                        steal_id = hint;
                    }
                }
                empty_runs = 0;
            } else {
                empty_runs += 1;
                if empty_runs >= n {
                    trace!(worker = self.id, "parking");
                    me.pulse.wait();
                    if me.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let hint = me.steal_from.load(Ordering::Acquire);
                    trace!(worker = self.id, from = hint, "woken");
                    self.steal_and_execute(hint);
                    empty_runs = 0;
                } else {
                    continue;
                }
            }

            self.drain_local();
            me.available.store(true, Ordering::Release);
        }

        me.available.store(false, Ordering::Release);
        trace!(worker = self.id, "worker exiting");
    }

    fn next_target(mut target: WorkerId, own: WorkerId, n: WorkerId) -> WorkerId {
        loop {
            target = (target + 1) % n;
            if target != own {
                return target;
            }
        }
    }

    /// Runs everything locally visible: own deque first (newest-first,
    /// cache-hot), then the affine and global FIFOs, whose heads compete by
    /// stamp.
    fn drain_local(&self) {
        loop {
            if let Some(id) = self.me().deque.pop() {
                self.execute(id);
                continue;
            }
            let queued = {
                let mut graph = self.shared.graph.lock();
                graph.pop_next(self.id)
            };
            match queued {
                Some(id) => self.execute(id),
                None => break,
            }
        }
    }

    /// Steals one task from `from`'s deque and runs it.
    fn steal_and_execute(&self, from: WorkerId) -> bool {
        if from == self.id || from as usize >= self.shared.workers.len() {
            return false;
        }
        match self.shared.workers[from as usize]
            .deque
            .steal(self.shared.steal_timeout)
        {
            Some(id) => {
                trace!(worker = self.id, from, task = ?id, "stole task");
                self.execute(id);
                true
            }
            None => false,
        }
    }

    /// Runs one task and signals its dependents.
    ///
    /// The graph lock is taken twice (closure take-out, completion) and is
    /// never held while the closure runs, so tasks are free to submit.
    fn execute(&self, id: TaskId) {
        let closure = {
            let mut graph = self.shared.graph.lock();
            if !graph.is_task(id) {
                // A stale handle can surface from the deques' POD slots
                // around shutdown races; skip it, but return the unit that
                // was acquired when the entry was scheduled.
                drop(graph);
                self.shared.tasks_inflight.decrement(1);
                return;
            }
            graph.take_closure(id)
        };

        trace!(worker = self.id, task = ?id, "running task");
        {
            let _abort = AbortOnPanic;
            closure.invoke();
        }

        let completion = {
            let mut graph = self.shared.graph.lock();
            graph.complete(id)
        };

        let readied = completion.generic.len() + completion.affine_wakes.len();
        if readied > 0 {
            self.shared.tasks_inflight.increment(readied as u32);
        }
        for &worker in &completion.affine_wakes {
            self.shared.workers[worker as usize].pulse.pulse();
        }
        for &task in &completion.generic {
            self.shared.push_generic_as(self.id, task);
        }
        self.shared.tasks_inflight.decrement(1);
    }
}
