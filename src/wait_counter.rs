//! Count-to-zero latch with RAII units.
//!
//! A [`WaitCounter`] tracks outstanding units of work. The counter itself
//! owns one unit, so a freshly constructed counter has count 1; that unit is
//! released by [`WaitCounter::wait_and_disable`], which then blocks until
//! every other unit has been returned. Units are usually held through the
//! RAII [`WaitGuard`], which guarantees the decrement on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An atomic counter with "wait until zero, then disable" semantics.
#[derive(Debug)]
pub struct WaitCounter {
    alive: AtomicBool,
    count: Mutex<u32>,
    zero: Condvar,
}

impl WaitCounter {
    /// Creates a counter holding its own unit (count 1).
    #[must_use]
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            count: Mutex::new(1),
            zero: Condvar::new(),
        }
    }

    #[inline]
    fn lock_unpoisoned(&self) -> MutexGuard<'_, u32> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current count, including the counter's own unit while alive.
    #[must_use]
    pub fn count(&self) -> u32 {
        *self.lock_unpoisoned()
    }

    /// Adds `by` units.
    pub fn increment(&self, by: u32) {
        debug_assert!(
            self.alive.load(Ordering::Acquire),
            "increment on a disabled WaitCounter"
        );
        *self.lock_unpoisoned() += by;
    }

    /// Returns `by` units, waking the waiter when the count reaches zero.
    pub fn decrement(&self, by: u32) {
        let mut count = self.lock_unpoisoned();
        if by >= *count {
            *count = 0;
            drop(count);
            self.zero.notify_all();
        } else {
            *count -= by;
        }
    }

    /// Acquires one unit, returned when the guard drops.
    ///
    /// # Panics
    ///
    /// Panics if the counter has been disabled.
    #[must_use]
    pub fn guard(&self) -> WaitGuard<'_> {
        assert!(
            self.alive.load(Ordering::Acquire),
            "guard on a disabled WaitCounter"
        );
        self.increment(1);
        WaitGuard {
            counter: Some(self),
        }
    }

    /// Wraps one unit previously added with [`WaitCounter::increment`] so a
    /// different thread can own the decrement.
    ///
    /// The caller must have added the unit; adopting without a matching
    /// increment releases someone else's unit.
    #[must_use]
    pub fn adopt(&self) -> WaitGuard<'_> {
        WaitGuard {
            counter: Some(self),
        }
    }

    /// Releases the counter's own unit and blocks until the count reaches
    /// zero, then leaves the counter disabled.
    ///
    /// Only the first call waits; subsequent calls return immediately.
    pub fn wait_and_disable(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let mut count = self.lock_unpoisoned();
            *count -= 1;
            while *count > 0 {
                count = self
                    .zero
                    .wait(count)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

impl Default for WaitCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitCounter {
    fn drop(&mut self) {
        self.wait_and_disable();
    }
}

/// RAII unit of a [`WaitCounter`]; decrements exactly once on drop.
#[derive(Debug)]
pub struct WaitGuard<'a> {
    counter: Option<&'a WaitCounter>,
}

impl WaitGuard<'_> {
    /// Returns the unit early.
    pub fn release(&mut self) {
        if let Some(counter) = self.counter.take() {
            counter.decrement(1);
        }
    }
}

impl Clone for WaitGuard<'_> {
    fn clone(&self) -> Self {
        if let Some(counter) = self.counter {
            counter.increment(1);
        }
        Self {
            counter: self.counter,
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
