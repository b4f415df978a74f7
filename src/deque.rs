//! Single-owner, many-thief work-stealing deque.
//!
//! The owning worker pushes and pops at the tail (LIFO); thieves take a
//! short-duration mutex and pop at the head (FIFO). Elements are POD
//! handles, so a handle stolen just as its task is claimed elsewhere may be
//! stale; executors re-detect this through generation validation before use.
//!
//! The owner's fast paths touch only the atomic indices. The owner falls
//! back to the thief mutex only when a pop collides with a concurrent steal
//! on the last element.
//!
//! One slot of the ring is intentionally left unused by the capacity bound,
//! so a deque built with `capacity_bits` holds `2^capacity_bits - 1`
//! elements.

use crate::ring::BoundedRing;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Returns true if `a` is at or before `b` in wrapping index order.
#[inline]
fn reaches(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// A fixed-capacity work-stealing deque of `Copy` elements.
pub struct WorkStealingDeque<T> {
    ring: BoundedRing<T>,
    /// Thief index; advanced under `thief_lock`.
    head: CachePadded<AtomicU32>,
    /// Owner index; only the owner stores it.
    tail: CachePadded<AtomicU32>,
    thief_lock: Mutex<()>,
}

impl<T: Copy + Default + Send> WorkStealingDeque<T> {
    /// Creates a deque backed by a ring of `1 << capacity_bits` slots, of
    /// which `2^capacity_bits - 1` are usable.
    #[must_use]
    pub fn new(capacity_bits: u32) -> Self {
        Self {
            ring: BoundedRing::new(capacity_bits),
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            thief_lock: Mutex::new(()),
        }
    }

    /// Usable capacity (one ring slot is reserved by the push bound).
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.ring.mask()
    }

    /// Approximate element count; may transiently be off by one around a
    /// speculating thief.
    #[must_use]
    pub fn len(&self) -> u32 {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        let size = tail.wrapping_sub(head) as i32;
        if size > 0 { size as u32 } else { 0 }
    }

    /// Approximate emptiness check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes `value` at the tail. Owner thread only.
    ///
    /// Returns false if the deque is full.
    pub fn push(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.ring.mask() {
            return false;
        }
        // SAFETY: the capacity bound keeps this slot at least one position
        // away from anything a thief can read.
        unsafe { self.ring.write(tail, value) };
        // Release publishes the slot write to thieves that acquire `tail`.
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pops the most recently pushed element. Owner thread only.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if !reaches(head.wrapping_add(1), tail) {
            return None;
        }

        // Claim the tail element speculatively, then re-check whether a
        // thief passed us.
        let new_tail = tail.wrapping_sub(1);
        self.tail.store(new_tail, Ordering::SeqCst);
        let head = self.head.load(Ordering::SeqCst);

        if reaches(head, new_tail) {
            // The head has not passed our claim: any thief racing for this
            // element will observe the lowered tail and back off.
            // SAFETY: element at `new_tail` was written by this thread.
            return Some(unsafe { self.ring.read(new_tail) });
        }

        // Possibly racing a thief for the last element; resolve under the
        // thief mutex.
        let guard = self.thief_lock.lock();
        let result = if reaches(self.head.load(Ordering::SeqCst), new_tail) {
            // SAFETY: under the lock the head cannot advance past us.
            Some(unsafe { self.ring.read(new_tail) })
        } else {
            // The thief won; undo the speculative claim.
            self.tail.store(new_tail.wrapping_add(1), Ordering::SeqCst);
            None
        };
        drop(guard);
        result
    }

    /// Steals the oldest element. Any thread.
    ///
    /// Gives up and returns `None` if the thief mutex cannot be acquired
    /// within `timeout` (a zero timeout degenerates to a try-lock).
    pub fn steal(&self, timeout: Duration) -> Option<T> {
        let guard = if timeout.is_zero() {
            self.thief_lock.try_lock()?
        } else {
            self.thief_lock.try_lock_for(timeout)?
        };

        let head = self.head.load(Ordering::Relaxed);
        // Claim speculatively so a concurrent owner pop of the same element
        // backs off into the mutex path.
        self.head.store(head.wrapping_add(1), Ordering::SeqCst);
        let result = if reaches(head.wrapping_add(1), self.tail.load(Ordering::SeqCst)) {
            // SAFETY: `head < tail` was observed after the claim; the owner
            // cannot overwrite this slot while it is below the tail.
            Some(unsafe { self.ring.read(head) })
        } else {
            self.head.store(head, Ordering::SeqCst);
            None
        };
        drop(guard);
        result
    }
}

impl<T> std::fmt::Debug for WorkStealingDeque<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingDeque")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
