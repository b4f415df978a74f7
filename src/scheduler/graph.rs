//! Task records, dependent lists, and the intrusive ready queues.
//!
//! The graph owns every `Task` and `Dependent` record in two slot pools and
//! threads the ready FIFOs (one global, one affine list per worker) through
//! the tasks' `next_in_queue` links. All operations here run under the
//! scheduler's graph mutex; the lock is never held while a task closure
//! runs.

use crate::closure::TaskFn;
use crate::error::SubmitError;
use crate::handle::Handle;
use crate::pool::SlotPool;
use smallvec::SmallVec;

use super::{WorkerId, MAX_WORKERS, NO_AFFINITY};

/// Index width of task handles; the remaining high bits are the generation.
pub const TASK_INDEX_BITS: u32 = 20;
/// Index width of dependent-node handles.
pub const DEP_INDEX_BITS: u32 = 20;

/// Identifier of a submitted task.
pub type TaskId = Handle<TASK_INDEX_BITS>;
pub(crate) type DependentId = Handle<DEP_INDEX_BITS>;

/// One interned task.
pub(crate) struct Task {
    /// The work item; empty for pure join nodes.
    closure: TaskFn,
    /// Predecessors that have not completed yet. The task becomes ready when
    /// this reaches zero.
    unmet_deps: u16,
    /// Head of the list of tasks depending on this one.
    first_dependent: DependentId,
    /// FIFO link; only meaningful while the task sits in a ready list.
    next_in_queue: TaskId,
    /// Worker this task is pinned to, or `NO_AFFINITY`.
    affinity: WorkerId,
    /// Scheduling-time stamp for cross-queue ordering.
    stamp: u64,
}

impl Task {
    fn new(closure: TaskFn, affinity: WorkerId) -> Self {
        Self {
            closure,
            unmet_deps: 0,
            first_dependent: DependentId::INVALID,
            next_in_queue: TaskId::INVALID,
            affinity,
            stamp: 0,
        }
    }
}

/// Forward adjacency node: `to` depends on the task whose list this is on.
pub(crate) struct Dependent {
    to: TaskId,
    next: DependentId,
}

/// An intrusive FIFO of ready tasks, linked through `Task::next_in_queue`.
#[derive(Clone, Copy)]
pub(crate) struct TaskFifo {
    head: TaskId,
    tail: TaskId,
}

impl TaskFifo {
    const EMPTY: Self = Self {
        head: TaskId::INVALID,
        tail: TaskId::INVALID,
    };

    pub(crate) fn is_empty(self) -> bool {
        debug_assert_eq!(self.head.is_invalid(), self.tail.is_invalid());
        self.head.is_invalid()
    }
}

/// Tasks that became ready when a predecessor completed, already routed.
#[derive(Default)]
pub(crate) struct Completion {
    /// No-affinity tasks; the caller pushes them on its own deque.
    pub(crate) generic: SmallVec<[TaskId; 8]>,
    /// Workers whose affine FIFO received a task and need a pulse.
    pub(crate) affine_wakes: SmallVec<[WorkerId; 4]>,
}

/// The shared task store behind the scheduler mutex.
pub(crate) struct TaskGraph {
    tasks: SlotPool<Task, TASK_INDEX_BITS>,
    dependents: SlotPool<Dependent, DEP_INDEX_BITS>,
    global: TaskFifo,
    affine: [TaskFifo; MAX_WORKERS],
    next_stamp: u64,
    /// Set by `close()`; checked under this same lock by every submission.
    pub(crate) closed: bool,
}

impl TaskGraph {
    pub(crate) fn new(max_tasks: u32, max_dependents: u32) -> Self {
        Self {
            tasks: SlotPool::new(max_tasks),
            dependents: SlotPool::new(max_dependents),
            global: TaskFifo::EMPTY,
            affine: [TaskFifo::EMPTY; MAX_WORKERS],
            next_stamp: 0,
            closed: false,
        }
    }

    /// Returns true if `id` names a live task (pending, ready, or running).
    pub(crate) fn is_task(&self, id: TaskId) -> bool {
        self.tasks.is_valid(id)
    }

    /// Total stamps issued so far; equals the number of tasks ever scheduled.
    pub(crate) fn stamps_issued(&self) -> u64 {
        self.next_stamp
    }

    /// Interns a task and links it under each still-valid predecessor.
    ///
    /// Predecessors whose handle no longer validates have already completed
    /// and are skipped; this is the defined way to depend on a task that may
    /// be done. Returns the handle and whether the task is immediately
    /// ready.
    pub(crate) fn add(
        &mut self,
        closure: TaskFn,
        affinity: WorkerId,
        predecessors: &[TaskId],
    ) -> Result<(TaskId, bool), SubmitError> {
        let id = self
            .tasks
            .emplace(Task::new(closure, affinity))
            .ok_or(SubmitError::PoolFull)?;

        let mut unmet: u16 = 0;
        for (done, &pred) in predecessors.iter().enumerate() {
            if !self.tasks.is_valid(pred) {
                continue;
            }
            // SAFETY: validity checked above; `&mut self` serializes access.
            let head = unsafe { self.tasks.get(pred) }.first_dependent;
            let Some(node) = self.dependents.emplace(Dependent { to: id, next: head }) else {
                self.unwind_partial(id, &predecessors[..done]);
                return Err(SubmitError::PoolFull);
            };
            // SAFETY: as above.
            unsafe { self.tasks.get_mut(pred) }.first_dependent = node;
            unmet += 1;
        }

        // SAFETY: freshly emplaced handle under `&mut self`.
        unsafe { self.tasks.get_mut(id) }.unmet_deps = unmet;
        Ok((id, unmet == 0))
    }

    /// Rolls back a half-linked `add` after dependent-pool exhaustion.
    fn unwind_partial(&mut self, id: TaskId, linked: &[TaskId]) {
        for &pred in linked {
            if !self.tasks.is_valid(pred) {
                continue;
            }
            loop {
                // SAFETY: validity checked; `&mut self` serializes access.
                let head = unsafe { self.tasks.get(pred) }.first_dependent;
                if head.is_invalid() {
                    break;
                }
                // SAFETY: list heads always name live dependent nodes.
                if unsafe { self.dependents.get(head) }.to != id {
                    break;
                }
                let node = self
                    .dependents
                    .move_out(head)
                    .expect("dependent list corrupted");
                // SAFETY: as above.
                unsafe { self.tasks.get_mut(pred) }.first_dependent = node.next;
            }
        }
        self.tasks.erase(id);
    }

    /// Stamps a ready task and, for affine tasks, enqueues it on its
    /// worker's FIFO. Returns the worker to pulse, or `None` when the caller
    /// routes the task itself (no affinity).
    pub(crate) fn mark_ready(&mut self, id: TaskId) -> Option<WorkerId> {
        debug_assert!(self.tasks.is_valid(id));
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        // SAFETY: caller passes live ready tasks; `&mut self` serializes.
        let task = unsafe { self.tasks.get_mut(id) };
        debug_assert_eq!(task.unmet_deps, 0, "scheduling a task with unmet deps");
        task.stamp = stamp;
        let affinity = task.affinity;
        if affinity == NO_AFFINITY {
            None
        } else {
            Self::fifo_push(&self.tasks, &mut self.affine[affinity as usize], id);
            Some(affinity)
        }
    }

    /// Pushes a ready no-affinity task on the global FIFO.
    pub(crate) fn push_global(&mut self, id: TaskId) {
        Self::fifo_push(&self.tasks, &mut self.global, id);
    }

    /// Claims the oldest task visible to `worker` across the global FIFO and
    /// its affine FIFO, breaking ties by stamp.
    pub(crate) fn pop_next(&mut self, worker: WorkerId) -> Option<TaskId> {
        let global_stamp = Self::fifo_peek_stamp(&self.tasks, &self.global);
        let affine_stamp = Self::fifo_peek_stamp(&self.tasks, &self.affine[worker as usize]);
        let take_affine = match (global_stamp, affine_stamp) {
            (None, None) => return None,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            // Equal stamps cannot happen; prefer the worker's own queue.
            (Some(global), Some(affine)) => affine <= global,
        };
        if take_affine {
            Self::fifo_pop(&self.tasks, &mut self.affine[worker as usize])
        } else {
            Self::fifo_pop(&self.tasks, &mut self.global)
        }
    }

    /// Moves the closure out of a task about to run.
    pub(crate) fn take_closure(&mut self, id: TaskId) -> TaskFn {
        debug_assert!(self.tasks.is_valid(id));
        // SAFETY: validity is checked by the caller under this same lock.
        std::mem::take(&mut unsafe { self.tasks.get_mut(id) }.closure)
    }

    /// Signals the dependents of a finished task and erases it.
    ///
    /// Newly-ready affine tasks are enqueued here; newly-ready generic tasks
    /// are returned for the calling worker to push on its deque.
    pub(crate) fn complete(&mut self, id: TaskId) -> Completion {
        debug_assert!(self.tasks.is_valid(id));
        let mut completion = Completion::default();
        // SAFETY: validity asserted; `&mut self` serializes access.
        let mut dep = unsafe { self.tasks.get(id) }.first_dependent;
        while !dep.is_invalid() {
            let node = self
                .dependents
                .move_out(dep)
                .expect("dependent list corrupted");
            if self.tasks.is_valid(node.to) {
                // SAFETY: validity checked on the line above.
                let waiter = unsafe { self.tasks.get_mut(node.to) };
                waiter.unmet_deps -= 1;
                if waiter.unmet_deps == 0 {
                    match self.mark_ready(node.to) {
                        Some(worker) => completion.affine_wakes.push(worker),
                        None => completion.generic.push(node.to),
                    }
                }
            }
            dep = node.next;
        }
        self.tasks.erase(id);
        completion
    }

    /// Erases a task that is being dropped without running.
    pub(crate) fn drop_task(&mut self, id: TaskId) -> bool {
        self.tasks.erase(id)
    }

    /// Empties every ready FIFO, erasing the queued tasks without running
    /// them or signalling their dependents. Returns how many were dropped.
    pub(crate) fn clear_queues(&mut self) -> u32 {
        let mut dropped = 0;
        while let Some(id) = Self::fifo_pop(&self.tasks, &mut self.global) {
            self.tasks.erase(id);
            dropped += 1;
        }
        for fifo in &mut self.affine {
            while let Some(id) = Self::fifo_pop(&self.tasks, fifo) {
                self.tasks.erase(id);
                dropped += 1;
            }
        }
        dropped
    }

    /// Reclaims every remaining record (orphaned pending tasks and their
    /// dependent nodes). Returns the (task, dependent) counts reclaimed.
    ///
    /// Caller must guarantee worker quiescence on top of the graph lock.
    pub(crate) fn reclaim(&mut self) -> (u32, u32) {
        let leaked = (self.tasks.len(), self.dependents.len());
        // SAFETY: `&mut self` plus the caller's quiescence guarantee; all
        // outstanding handles are dead after shutdown.
        unsafe {
            self.tasks.unsafe_clear();
            self.dependents.unsafe_clear();
        }
        self.global = TaskFifo::EMPTY;
        self.affine = [TaskFifo::EMPTY; MAX_WORKERS];
        leaked
    }

    fn fifo_push(tasks: &SlotPool<Task, TASK_INDEX_BITS>, fifo: &mut TaskFifo, id: TaskId) {
        debug_assert!(tasks.is_valid(id));
        // SAFETY: all fifo helpers run under the graph mutex on live tasks.
        unsafe { tasks.get_mut(id) }.next_in_queue = TaskId::INVALID;
        if fifo.is_empty() {
            fifo.head = id;
        } else {
            // SAFETY: a non-empty fifo's tail is a live queued task.
            unsafe { tasks.get_mut(fifo.tail) }.next_in_queue = id;
        }
        fifo.tail = id;
    }

    fn fifo_pop(tasks: &SlotPool<Task, TASK_INDEX_BITS>, fifo: &mut TaskFifo) -> Option<TaskId> {
        if fifo.is_empty() {
            return None;
        }
        let id = fifo.head;
        // SAFETY: queued tasks are live until popped and erased.
        let next = unsafe { tasks.get(id) }.next_in_queue;
        fifo.head = next;
        if next.is_invalid() {
            fifo.tail = TaskId::INVALID;
        }
        Some(id)
    }

    fn fifo_peek_stamp(
        tasks: &SlotPool<Task, TASK_INDEX_BITS>,
        fifo: &TaskFifo,
    ) -> Option<u64> {
        if fifo.is_empty() {
            return None;
        }
        // SAFETY: as in `fifo_pop`.
        Some(unsafe { tasks.get(fifo.head) }.stamp)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.tasks.len())
            .field("dependents", &self.dependents.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> TaskGraph {
        TaskGraph::new(64, 64)
    }

    fn join_node() -> TaskFn {
        TaskFn::none()
    }

    #[test]
    fn task_with_no_predecessors_is_ready() {
        let mut graph = graph();
        let (id, ready) = graph
            .add(join_node(), NO_AFFINITY, &[])
            .expect("pool has room");
        assert!(ready);
        assert!(graph.is_task(id));
    }

    #[test]
    fn invalid_predecessors_are_skipped() {
        let mut graph = graph();
        let (a, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        graph.take_closure(a);
        let completion = graph.complete(a);
        assert!(completion.generic.is_empty());
        assert!(!graph.is_task(a), "completed task is erased");

        // Depending on the dead handle must not block the new task.
        let (b, ready) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");
        assert!(ready, "stale predecessor must be ignored");
        assert!(graph.is_task(b));
    }

    #[test]
    fn completion_readies_dependents_in_both_routes() {
        let mut graph = graph();
        let (a, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        let (b, b_ready) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");
        let (c, c_ready) = graph.add(join_node(), 3, &[a]).expect("room");
        assert!(!b_ready && !c_ready);

        let completion = graph.complete(a);
        assert_eq!(completion.generic.as_slice(), &[b]);
        assert_eq!(completion.affine_wakes.as_slice(), &[3]);
        assert_eq!(graph.pop_next(3), Some(c), "affine task queued on worker 3");
        assert_eq!(graph.pop_next(3), None);
    }

    #[test]
    fn diamond_counts_unmet_dependencies() {
        let mut graph = graph();
        let (a, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        let (b, _) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");
        let (c, _) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");
        let (d, d_ready) = graph.add(join_node(), NO_AFFINITY, &[b, c]).expect("room");
        assert!(!d_ready);

        let after_a = graph.complete(a);
        assert_eq!(after_a.generic.len(), 2, "b and c become ready together");

        let after_b = graph.complete(b);
        assert!(after_b.generic.is_empty(), "d still waits on c");
        let after_c = graph.complete(c);
        assert_eq!(after_c.generic.as_slice(), &[d]);
    }

    #[test]
    fn duplicate_predecessors_count_twice_and_resolve() {
        let mut graph = graph();
        let (a, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        let (b, ready) = graph.add(join_node(), NO_AFFINITY, &[a, a]).expect("room");
        assert!(!ready);
        let completion = graph.complete(a);
        assert_eq!(
            completion.generic.as_slice(),
            &[b],
            "both dependent edges resolve in one completion"
        );
    }

    #[test]
    fn global_fifo_preserves_submission_order() {
        let mut graph = graph();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (id, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
            assert!(graph.mark_ready(id).is_none());
            graph.push_global(id);
            ids.push(id);
        }
        for expected in ids {
            assert_eq!(graph.pop_next(0), Some(expected));
        }
        assert_eq!(graph.pop_next(0), None);
    }

    #[test]
    fn stamp_tie_break_prefers_older_queue_head() {
        let mut graph = graph();

        // Older stamp lands on the affine queue of worker 1.
        let (affine_task, _) = graph.add(join_node(), 1, &[]).expect("room");
        assert_eq!(graph.mark_ready(affine_task), Some(1));

        let (global_task, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        assert!(graph.mark_ready(global_task).is_none());
        graph.push_global(global_task);

        assert_eq!(
            graph.pop_next(1),
            Some(affine_task),
            "older affine head wins the tie-break"
        );
        assert_eq!(graph.pop_next(1), Some(global_task));

        // And the other way around: older global head wins.
        let (global_first, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        assert!(graph.mark_ready(global_first).is_none());
        graph.push_global(global_first);
        let (affine_second, _) = graph.add(join_node(), 1, &[]).expect("room");
        assert_eq!(graph.mark_ready(affine_second), Some(1));

        assert_eq!(graph.pop_next(1), Some(global_first));
        assert_eq!(graph.pop_next(1), Some(affine_second));
    }

    #[test]
    fn workers_only_see_their_own_affine_queue() {
        let mut graph = graph();
        let (task, _) = graph.add(join_node(), 2, &[]).expect("room");
        assert_eq!(graph.mark_ready(task), Some(2));
        assert_eq!(graph.pop_next(0), None, "worker 0 must not see it");
        assert_eq!(graph.pop_next(2), Some(task));
    }

    #[test]
    fn dependent_pool_exhaustion_unwinds_the_submission() {
        let mut graph = TaskGraph::new(16, 2);
        let (a, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        let (b, _) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");
        let (_c, _) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");

        // Third edge cannot allocate; the new task must vanish entirely.
        let err = graph
            .add(join_node(), NO_AFFINITY, &[a, b])
            .expect_err("dependent pool is exhausted");
        assert_eq!(err, SubmitError::PoolFull);

        // The earlier dependents are intact: completing a readies b and c.
        let completion = graph.complete(a);
        assert_eq!(completion.generic.len(), 2);
    }

    #[test]
    fn clear_queues_drops_without_signalling() {
        let mut graph = graph();
        let (a, _) = graph.add(join_node(), NO_AFFINITY, &[]).expect("room");
        assert!(graph.mark_ready(a).is_none());
        graph.push_global(a);
        let (b, _) = graph.add(join_node(), 1, &[]).expect("room");
        assert_eq!(graph.mark_ready(b), Some(1));
        let (c, _) = graph.add(join_node(), NO_AFFINITY, &[a]).expect("room");

        assert_eq!(graph.clear_queues(), 2);
        assert!(!graph.is_task(a) && !graph.is_task(b));
        assert!(graph.is_task(c), "pending dependent is left in place");

        let (tasks, deps) = graph.reclaim();
        assert_eq!((tasks, deps), (1, 1), "orphaned dependent is reclaimed");
        assert!(!graph.is_task(c));
    }
}
