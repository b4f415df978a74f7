//! Dependency-aware work-stealing scheduler.
//!
//! The scheduler drives a fixed set of worker threads over a shared task
//! graph. Ready tasks with no affinity flow through the submitting
//! worker's lock-free deque (stealable by peers) or, for external
//! submitters, through the global FIFO; affine tasks are queued on their
//! worker's FIFO and that worker is pulsed directly. Idle workers rotate
//! through their peers stealing work, and park on their [`Pulse`] after a
//! full empty rotation; every wakeup carries a `steal_from` hint naming the
//! peer to try first.

mod graph;
mod worker;

pub use graph::{TaskId, DEP_INDEX_BITS, TASK_INDEX_BITS};

use crate::closure::TaskFn;
use crate::config::SchedulerConfig;
use crate::deque::WorkStealingDeque;
use crate::error::SubmitError;
use crate::pulse::Pulse;
use crate::wait_counter::WaitCounter;
use graph::TaskGraph;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use worker::Worker;

/// Identifier of a scheduler worker, dense in `[0, worker_count)`.
pub type WorkerId = u16;

/// Affinity sentinel: the task may run on any worker.
pub const NO_AFFINITY: WorkerId = WorkerId::MAX;

/// Upper bound on the worker count.
pub const MAX_WORKERS: usize = 16;

thread_local! {
    /// The worker identity of the current thread, tagged with the owning
    /// scheduler so nested schedulers cannot confuse each other.
    static CURRENT_WORKER: Cell<Option<(usize, WorkerId)>> = const { Cell::new(None) };
}

/// Per-worker state shared between the worker thread and submitters.
pub(crate) struct WorkerShared {
    /// Stealable queue of no-affinity tasks submitted by this worker.
    deque: WorkStealingDeque<TaskId>,
    /// Park/unpark latch.
    pulse: Pulse,
    /// Tells the worker loop to exit.
    stop: AtomicBool,
    /// True while the worker is a candidate for being woken to steal.
    available: AtomicBool,
    /// Peer to steal from after the next wakeup.
    steal_from: AtomicU16,
}

pub(crate) struct Shared {
    graph: Mutex<TaskGraph>,
    workers: Box<[WorkerShared]>,
    /// One unit per running worker loop.
    workers_active: WaitCounter,
    /// One unit per scheduled-but-not-completed task.
    tasks_inflight: WaitCounter,
    /// Guards against starting the worker threads twice.
    started: AtomicBool,
    steal_timeout: Duration,
}

impl Shared {
    /// Claims an available worker, installs the steal hint, and pulses it.
    fn wake_worker_to_steal(&self, target: WorkerId, steal_from: WorkerId) -> bool {
        let worker = &self.workers[target as usize];
        if worker
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            worker.steal_from.store(steal_from, Ordering::Release);
            worker.pulse.pulse();
            true
        } else {
            false
        }
    }

    /// Wakes one available worker after a push to the global FIFO.
    ///
    /// The hint points the woken worker at itself, which the steal path
    /// skips; its local drain then claims the queued task. When no worker
    /// can be claimed (all busy or mid-transition), every pulse is latched
    /// instead so the push cannot be lost between a worker's last drain and
    /// its park.
    fn wake_any(&self) {
        let n = self.workers.len() as WorkerId;
        for target in 0..n {
            if self.wake_worker_to_steal(target, target) {
                trace!(worker = target, "woke worker for global work");
                return;
            }
        }
        for worker in self.workers.iter() {
            worker.pulse.pulse();
        }
    }

    /// Offers surplus work on `from`'s deque to an available peer.
    fn delegate(&self, from: WorkerId) {
        let n = self.workers.len() as WorkerId;
        let mut target = (from + 1) % n;
        while self.workers[from as usize].deque.len() > 1 && target != from {
            if self.wake_worker_to_steal(target, from) {
                trace!(from, to = target, "delegated surplus work");
                return;
            }
            target = (target + 1) % n;
        }
    }

    /// Pushes a ready no-affinity task as worker `worker`, overflowing to
    /// the global FIFO when the deque is full.
    pub(crate) fn push_generic_as(&self, worker: WorkerId, id: TaskId) {
        let slot = &self.workers[worker as usize];
        if slot.deque.push(id) {
            if slot.deque.len() > 1 {
                self.delegate(worker);
            }
        } else {
            let mut graph = self.graph.lock();
            graph.push_global(id);
            drop(graph);
            self.wake_any();
        }
    }

    /// Worker id of the calling thread, if it belongs to this scheduler.
    fn current_worker(self: &Arc<Self>) -> Option<WorkerId> {
        let tag = Arc::as_ptr(self) as usize;
        CURRENT_WORKER.with(|cell| {
            cell.get()
                .and_then(|(owner, worker)| (owner == tag).then_some(worker))
        })
    }

    fn stop_workers(&self) {
        for worker in self.workers.iter() {
            worker.stop.store(true, Ordering::Release);
            worker.pulse.pulse();
        }
    }
}

/// Restores the previous thread-local worker identity on drop.
pub(crate) struct CurrentWorkerGuard {
    prev: Option<(usize, WorkerId)>,
}

impl CurrentWorkerGuard {
    pub(crate) fn set(shared: &Arc<Shared>, worker: WorkerId) -> Self {
        let tag = Arc::as_ptr(shared) as usize;
        let prev = CURRENT_WORKER.with(|cell| cell.replace(Some((tag, worker))));
        Self { prev }
    }
}

impl Drop for CurrentWorkerGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_WORKER.with(|cell| cell.set(prev));
    }
}

/// A cloneable handle to the scheduler; all clones drive the same workers.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler with `workers` threads and default pool sizes.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or above [`MAX_WORKERS`].
    #[must_use]
    pub fn new(workers: u16) -> Self {
        let config = SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        };
        Self::with_config(config).expect("worker count out of range")
    }

    /// Creates a scheduler from a validated configuration.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let workers = (0..config.workers)
            .map(|id| WorkerShared {
                deque: WorkStealingDeque::new(config.deque_capacity_bits),
                pulse: Pulse::new(),
                stop: AtomicBool::new(false),
                available: AtomicBool::new(false),
                steal_from: AtomicU16::new((id + 1) % config.workers),
            })
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(TaskGraph::new(config.max_tasks, config.max_dependents)),
                workers,
                workers_active: WaitCounter::new(),
                tasks_inflight: WaitCounter::new(),
                started: AtomicBool::new(false),
                steal_timeout: config.steal_timeout,
            }),
        })
    }

    /// Number of workers this scheduler was built with.
    #[must_use]
    pub fn worker_count(&self) -> u16 {
        self.shared.workers.len() as u16
    }

    /// Submits a task.
    ///
    /// The task becomes ready once every still-valid predecessor has
    /// completed; predecessors that already completed are ignored. With an
    /// affinity, only that worker will run the task.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` is out of `[0, worker_count)`.
    pub fn submit<F>(
        &self,
        task: F,
        predecessors: &[TaskId],
        affinity: Option<WorkerId>,
    ) -> Result<TaskId, SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_closure(TaskFn::new(task), predecessors, affinity)
    }

    /// Submits an empty task that acts as a pure join node.
    pub fn submit_join(&self, predecessors: &[TaskId]) -> Result<TaskId, SubmitError> {
        self.submit_closure(TaskFn::none(), predecessors, None)
    }

    fn submit_closure(
        &self,
        closure: TaskFn,
        predecessors: &[TaskId],
        affinity: Option<WorkerId>,
    ) -> Result<TaskId, SubmitError> {
        let affinity = affinity.map_or(NO_AFFINITY, |a| {
            assert!(
                a < self.worker_count(),
                "affinity {a} out of range for {} workers",
                self.worker_count()
            );
            a
        });

        let shared = &self.shared;
        enum Route {
            None,
            PulseAffine(WorkerId),
            OwnDeque(WorkerId),
            WakeAny,
        }
        let mut route = Route::None;

        let id = {
            let mut graph = shared.graph.lock();
            if graph.closed {
                return Err(SubmitError::Closed);
            }
            let (id, ready) = graph.add(closure, affinity, predecessors)?;
            if ready {
                shared.tasks_inflight.increment(1);
                route = match graph.mark_ready(id) {
                    Some(worker) => Route::PulseAffine(worker),
                    None => match shared.current_worker() {
                        Some(worker) => Route::OwnDeque(worker),
                        None => {
                            graph.push_global(id);
                            Route::WakeAny
                        }
                    },
                };
            }
            id
        };

        match route {
            Route::None => {}
            Route::PulseAffine(worker) => {
                trace!(task = ?id, worker, "submitted affine task");
                shared.workers[worker as usize].pulse.pulse();
            }
            Route::OwnDeque(worker) => {
                trace!(task = ?id, worker, "submitted task on own deque");
                shared.push_generic_as(worker, id);
            }
            Route::WakeAny => {
                trace!(task = ?id, "submitted task on global queue");
                shared.wake_any();
            }
        }
        Ok(id)
    }

    /// Starts all worker threads in the background.
    ///
    /// Pair with [`Scheduler::close_and_wait`] to shut them down.
    ///
    /// # Panics
    ///
    /// Panics if the workers were already started.
    pub fn start(&self) {
        self.claim_start();
        for id in 0..self.worker_count() {
            self.shared.workers_active.increment(1);
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || Worker::new(shared, id).run())
                .expect("failed to spawn worker thread");
        }
    }

    /// Runs the scheduler to completion on the calling thread.
    ///
    /// Spawns `worker_count() - 1` extra threads, seeds `root` as a task
    /// pinned to worker 0, and runs worker 0 here. Returns once a task has
    /// called [`Ctx::stop`] (or [`Scheduler::close`] was called), after all
    /// workers exited and the queues were drained of leftovers.
    pub fn run<F>(&self, root: F)
    where
        F: FnOnce(&Ctx) + Send + 'static,
    {
        self.claim_start();
        let started_at = Instant::now();
        let ctx = Ctx {
            scheduler: self.clone(),
        };
        for _ in 0..self.worker_count() {
            self.shared.workers_active.increment(1);
        }
        std::thread::scope(|scope| {
            for id in 1..self.worker_count() {
                let shared = Arc::clone(&self.shared);
                scope.spawn(move || Worker::new(shared, id).run());
            }
            self.submit(move || root(&ctx), &[], Some(0))
                .expect("root submission on a fresh scheduler");
            Worker::new(Arc::clone(&self.shared), 0).run();
        });
        self.close_and_wait();
        debug!(elapsed = ?started_at.elapsed(), "scheduler run finished");
    }

    fn claim_start(&self) {
        assert!(
            !self.shared.started.swap(true, Ordering::AcqRel),
            "scheduler workers already started"
        );
    }

    /// Stops the scheduler: no further submissions are admitted and workers
    /// exit at their next loop top or wakeup.
    ///
    /// Tasks already running finish; tasks still in ready queues are dropped
    /// without running and without signalling their dependents (the frame is
    /// dropped). Callable from inside a task. Idempotent.
    pub fn close(&self) {
        {
            let mut graph = self.shared.graph.lock();
            if graph.closed {
                return;
            }
            graph.closed = true;
        }
        debug!("scheduler closing");
        self.shared.stop_workers();
    }

    /// [`Scheduler::close`], then blocks until every worker loop has exited
    /// and reclaims all queued and pending records.
    ///
    /// Queued tasks are dropped without running; dependents of dropped tasks
    /// are never signalled and are reclaimed wholesale here. Must not be
    /// called from a worker thread.
    pub fn close_and_wait(&self) {
        debug_assert!(
            self.shared.current_worker().is_none(),
            "close_and_wait would deadlock on a worker thread"
        );
        self.close();
        self.shared.workers_active.wait_and_disable();

        let shared = &self.shared;
        let mut graph = shared.graph.lock();
        let mut dropped = graph.clear_queues();
        for worker in shared.workers.iter() {
            while let Some(id) = worker.deque.steal(Duration::ZERO) {
                graph.drop_task(id);
                dropped += 1;
            }
        }
        let stamps = graph.stamps_issued();
        let (leaked_tasks, leaked_dependents) = graph.reclaim();
        drop(graph);

        if dropped > 0 {
            shared.tasks_inflight.decrement(dropped);
        }
        shared.tasks_inflight.wait_and_disable();
        debug!(
            dropped,
            leaked_tasks, leaked_dependents, stamps, "scheduler drained"
        );
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

/// Submission context handed to the root closure of [`Scheduler::run`].
///
/// Cloneable and cheap; nested tasks capture a clone to submit follow-up
/// work or stop the scheduler.
#[derive(Clone, Debug)]
pub struct Ctx {
    scheduler: Scheduler,
}

impl Ctx {
    /// Submits a task; see [`Scheduler::submit`].
    pub fn submit<F>(
        &self,
        task: F,
        predecessors: &[TaskId],
        affinity: Option<WorkerId>,
    ) -> Result<TaskId, SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.submit(task, predecessors, affinity)
    }

    /// Submits a join node; see [`Scheduler::submit_join`].
    pub fn submit_join(&self, predecessors: &[TaskId]) -> Result<TaskId, SubmitError> {
        self.scheduler.submit_join(predecessors)
    }

    /// Stops the scheduler; see [`Scheduler::close`].
    pub fn stop(&self) {
        self.scheduler.close();
    }

    /// Worker id of the calling thread, when it is one of this scheduler's
    /// workers.
    #[must_use]
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.scheduler.shared.current_worker()
    }

    /// The scheduler this context is bound to.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
