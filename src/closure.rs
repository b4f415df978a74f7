//! Type-erased task closures.
//!
//! [`TaskFn`] is a small-buffer-optimized `FnOnce() + Send` container sized
//! for closures of up to three machine words; larger (or over-aligned)
//! captures are moved to the heap instead of being rejected. An empty
//! `TaskFn` is valid and runs nothing, which is how pure join nodes are
//! represented.

use std::mem::{self, MaybeUninit};
use std::ptr;

const INLINE_WORDS: usize = 3;

type Storage = [MaybeUninit<usize>; INLINE_WORDS];

/// A nullary one-shot callable, inline up to three words.
pub struct TaskFn {
    /// `None` marks the empty (join-node) closure.
    call: Option<unsafe fn(*mut Storage)>,
    /// Destructor for a stored-but-never-invoked closure.
    drop_fn: Option<unsafe fn(*mut Storage)>,
    storage: Storage,
}

// SAFETY: construction requires `F: Send`, and the vtable entries are plain
// function pointers; moving the container moves the captured state with it.
unsafe impl Send for TaskFn {}

impl TaskFn {
    /// The empty closure; invoking it is a no-op.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            call: None,
            drop_fn: None,
            storage: [MaybeUninit::uninit(); INLINE_WORDS],
        }
    }

    /// Wraps `f`, storing it inline when it fits in three words.
    #[must_use]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut storage: Storage = [MaybeUninit::uninit(); INLINE_WORDS];
        if Self::inlineable::<F>() {
            // SAFETY: size and alignment were just checked against the
            // inline buffer.
            unsafe { ptr::write(storage.as_mut_ptr().cast::<F>(), f) };
            Self {
                call: Some(Self::call_inline::<F>),
                drop_fn: Some(Self::drop_inline::<F>),
                storage,
            }
        } else {
            let raw = Box::into_raw(Box::new(f));
            // SAFETY: a thin pointer always fits the first storage word.
            unsafe { ptr::write(storage.as_mut_ptr().cast::<*mut F>(), raw) };
            Self {
                call: Some(Self::call_boxed::<F>),
                drop_fn: Some(Self::drop_boxed::<F>),
                storage,
            }
        }
    }

    const fn inlineable<F>() -> bool {
        mem::size_of::<F>() <= mem::size_of::<Storage>()
            && mem::align_of::<F>() <= mem::align_of::<Storage>()
    }

    /// Returns true for the empty closure.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.call.is_none()
    }

    /// Runs the closure, consuming it. A no-op when empty.
    pub fn invoke(mut self) {
        if let Some(call) = self.call.take() {
            // The call takes ownership of the capture; disarm the dtor
            // before running so a panic cannot double-drop it.
            self.drop_fn = None;
            // SAFETY: storage holds the capture this vtable entry expects.
            unsafe { call(&mut self.storage) };
        }
    }

    unsafe fn call_inline<F: FnOnce()>(storage: *mut Storage) {
        // SAFETY: per contract, storage holds an initialized `F`; reading it
        // moves the capture out.
        let f = unsafe { ptr::read(storage.cast::<F>()) };
        f();
    }

    unsafe fn drop_inline<F>(storage: *mut Storage) {
        // SAFETY: per contract, storage holds an initialized `F`.
        unsafe { ptr::drop_in_place(storage.cast::<F>()) };
    }

    unsafe fn call_boxed<F: FnOnce()>(storage: *mut Storage) {
        // SAFETY: per contract, the first word is the Box'd capture.
        let boxed = unsafe { Box::from_raw(ptr::read(storage.cast::<*mut F>())) };
        boxed();
    }

    unsafe fn drop_boxed<F>(storage: *mut Storage) {
        // SAFETY: as in `call_boxed`.
        drop(unsafe { Box::from_raw(ptr::read(storage.cast::<*mut F>())) });
    }
}

impl Default for TaskFn {
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for TaskFn {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn.take() {
            // SAFETY: the closure was stored and never invoked.
            unsafe { drop_fn(&mut self.storage) };
        }
    }
}

impl std::fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_empty() { "empty" } else { "set" };
        write!(f, "TaskFn({kind})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn small_closure_runs_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        let f = TaskFn::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!f.is_empty());
        f.invoke();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn large_closure_spills_to_heap_and_runs_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        let payload = [7u64; 16];
        assert!(!TaskFn::inlineable::<[u64; 16]>(), "capture must exceed the buffer");
        let f = TaskFn::new(move || {
            assert_eq!(payload, [7u64; 16]);
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        f.invoke();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_closure_is_a_no_op() {
        let f = TaskFn::none();
        assert!(f.is_empty());
        f.invoke();
        let g = TaskFn::default();
        assert!(g.is_empty());
    }

    #[test]
    fn dropping_uninvoked_closure_drops_captures_once() {
        struct CountsDrops(Arc<AtomicU32>);
        impl Drop for CountsDrops {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicU32::new(0));

        // Inline capture (Arc + marker fits in three words).
        {
            let marker = CountsDrops(Arc::clone(&drops));
            let f = TaskFn::new(move || {
                let _keep = &marker;
            });
            drop(f);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // Boxed capture.
        {
            let marker = CountsDrops(Arc::clone(&drops));
            let bulk = [0u64; 16];
            let f = TaskFn::new(move || {
                let _keep = (&marker, &bulk);
            });
            drop(f);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invoked_closure_drops_captures_once() {
        struct CountsDrops(Arc<AtomicU32>);
        impl Drop for CountsDrops {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicU32::new(0));
        let marker = CountsDrops(Arc::clone(&drops));
        let f = TaskFn::new(move || {
            let _keep = &marker;
        });
        f.invoke();
        assert_eq!(drops.load(Ordering::SeqCst), 1, "capture dropped by the call only");
    }
}
