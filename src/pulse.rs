//! One-shot park/unpark primitive.
//!
//! A [`Pulse`] never loses a wakeup: a `pulse()` delivered before the waiter
//! arrives is latched and consumed by the next `wait()`. Unlike a binary
//! semaphore, pulses collapse; any number of `pulse()` calls between two
//! waits produce exactly one wakeup. At most one thread may wait at a time.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct PulseState {
    pulsed: bool,
    asleep: bool,
}

/// A latching single-waiter park/unpark primitive.
#[derive(Debug)]
pub struct Pulse {
    state: Mutex<PulseState>,
    condvar: Condvar,
}

impl Pulse {
    /// Creates an un-pulsed instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PulseState {
                pulsed: false,
                asleep: false,
            }),
            condvar: Condvar::new(),
        }
    }

    #[inline]
    fn lock_unpoisoned(&self) -> MutexGuard<'_, PulseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers a pulse.
    ///
    /// Wakes the waiter if one is parked; otherwise latches so the next
    /// [`Pulse::wait`] returns immediately. Pulses collapse: repeated calls
    /// with no intervening wait count as one.
    pub fn pulse(&self) {
        let mut state = self.lock_unpoisoned();
        state.pulsed = true;
        if state.asleep {
            state.asleep = false;
            drop(state);
            self.condvar.notify_one();
        }
    }

    /// Blocks until a pulse has been delivered, then consumes it.
    ///
    /// Returns immediately if a pulse is already latched. Only one thread
    /// may wait at a time (debug-asserted).
    pub fn wait(&self) {
        let mut state = self.lock_unpoisoned();
        debug_assert!(!state.asleep, "Pulse supports at most one waiter");
        state.asleep = true;
        while !state.pulsed {
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.pulsed = false;
        state.asleep = false;
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn pulse_before_wait_returns_immediately() {
        let pulse = Pulse::new();
        pulse.pulse();

        let start = Instant::now();
        pulse.wait();
        assert!(
            start.elapsed() < Duration::from_millis(50),
            "latched pulse should satisfy wait immediately"
        );
    }

    #[test]
    fn pulse_wakes_a_parked_waiter() {
        let pulse = Arc::new(Pulse::new());
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pulse = Arc::clone(&pulse);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                pulse.wait();
                woke.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(10));
        pulse.pulse();
        waiter.join().expect("waiter join");
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn pulses_collapse_to_one_wakeup() {
        let pulse = Arc::new(Pulse::new());
        pulse.pulse();
        pulse.pulse();
        pulse.pulse();

        // First wait consumes the single latched pulse.
        pulse.wait();

        // A second wait must block until a fresh pulse arrives.
        let blocked = Arc::new(AtomicBool::new(true));
        let waiter = {
            let pulse = Arc::clone(&pulse);
            let blocked = Arc::clone(&blocked);
            thread::spawn(move || {
                pulse.wait();
                blocked.store(false, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(
            blocked.load(Ordering::SeqCst),
            "second wait must not consume an already-spent pulse"
        );
        pulse.pulse();
        waiter.join().expect("waiter join");
        assert!(!blocked.load(Ordering::SeqCst));
    }

    #[test]
    fn no_lost_wakeup_under_racing_pulse() {
        for _ in 0..200 {
            let pulse = Arc::new(Pulse::new());
            let barrier = Arc::new(Barrier::new(2));

            let waiter = {
                let pulse = Arc::clone(&pulse);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pulse.wait();
                })
            };

            barrier.wait();
            if fastrand_bool() {
                thread::yield_now();
            }
            pulse.pulse();
            waiter.join().expect("wakeup must not be lost");
        }
    }

    #[test]
    fn pulse_is_reusable_across_cycles() {
        let pulse = Pulse::new();
        for i in 0..5 {
            pulse.pulse();
            let start = Instant::now();
            pulse.wait();
            assert!(
                start.elapsed() < Duration::from_millis(50),
                "cycle {i}: reused pulse should wake immediately"
            );
        }
    }

    // Cheap schedule jitter without pulling in an RNG crate for tests.
    fn fastrand_bool() -> bool {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() & 1 == 1)
            .unwrap_or(false)
    }
}
