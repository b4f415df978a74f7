//! Fixed-capacity slot pool with generation-tagged handles.
//!
//! [`SlotPool`] hands out compact [`Handle`]s for stored values and recycles
//! slots through a lock-free free list. Erasing a slot bumps its generation,
//! so stale handles fail [`SlotPool::is_valid`] instead of aliasing the
//! slot's next occupant.
//!
//! # Concurrency
//!
//! `emplace` and `erase` race through CAS on the tagged free-list head (the
//! generation bits of the head word double as an ABA counter) and on each
//! slot's own atomic id. Validity observed by `is_valid` is only a snapshot:
//! callers that need a handle to stay valid across a check-and-use sequence
//! must synchronize externally, which is why [`SlotPool::get`] and
//! [`SlotPool::get_mut`] are `unsafe`.
//!
//! Destruction and [`SlotPool::unsafe_clear`] require external quiescence.

use crate::handle::{raw, Handle};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// One slot of storage plus its atomic id.
///
/// The slot is occupied iff the id's index field equals the slot's own
/// position; for a free slot the index field is the next free-list link.
/// The generation field survives both transitions.
struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    id: AtomicU32,
}

/// A recycling slot table with generation-tagged handles.
///
/// Capacity is fixed at construction. The only reported failure is "pool
/// full", signalled by [`SlotPool::emplace`] returning `None`.
pub struct SlotPool<T, const BITS: u32> {
    slots: Box<[Slot<T>]>,
    free_head: AtomicU32,
    len: AtomicU32,
}

// SAFETY: values are only reached through the acquire/erase protocol on the
// slot ids; `get`/`get_mut` push the remaining aliasing obligations onto the
// caller via their `unsafe` contracts.
unsafe impl<T: Send, const BITS: u32> Send for SlotPool<T, BITS> {}
unsafe impl<T: Send, const BITS: u32> Sync for SlotPool<T, BITS> {}

impl<T, const BITS: u32> SlotPool<T, BITS> {
    /// Creates a pool with room for `capacity` values.
    ///
    /// Initial generations are randomized (seeded from the pool's address)
    /// to make handles from unrelated pools unlikely to validate against
    /// each other.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds the index space minus the
    /// reserved invalid index.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "zero-capacity pool");
        assert!(
            capacity <= Handle::<BITS>::MAX_CAPACITY,
            "capacity {capacity} exceeds index space"
        );

        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                id: AtomicU32::new(0),
            });
        }
        let pool = Self {
            slots: slots.into_boxed_slice(),
            free_head: AtomicU32::new(0),
            len: AtomicU32::new(0),
        };
        pool.link_free_list();
        pool
    }

    /// Rebuilds the free list over all slots with fresh random generations.
    fn link_free_list(&self) {
        // Knuth's MMIX constants; the pool address seeds the stream so two
        // pools constructed back-to-back still start from different tags.
        let mut lcg_state = self.slots.as_ptr() as u64;
        let mut next_tag = || {
            lcg_state = lcg_state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (lcg_state >> 32) as u32 & Handle::<BITS>::GENERATION_MASK
        };

        let capacity = self.slots.len() as u32;
        for (i, slot) in self.slots.iter().enumerate() {
            let link = if i as u32 + 1 == capacity {
                Handle::<BITS>::INVALID_INDEX
            } else {
                i as u32 + 1
            };
            slot.id.store(link | next_tag(), Ordering::Relaxed);
        }
        self.free_head.store(next_tag(), Ordering::Release);
    }

    /// Number of slots this pool can hold.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Approximate number of occupied slots.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if no slot is occupied (approximate under races).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `handle` currently names an occupied slot.
    ///
    /// The answer is a snapshot: a concurrent `erase` may invalidate the
    /// handle immediately after this returns.
    #[must_use]
    pub fn is_valid(&self, handle: Handle<BITS>) -> bool {
        let index = handle.index();
        if index >= self.capacity() {
            return false;
        }
        self.slots[index as usize].id.load(Ordering::Acquire) == handle.to_raw()
    }

    /// Stores `value` and returns its handle, or `None` if the pool is full.
    pub fn emplace(&self, value: T) -> Option<Handle<BITS>> {
        let index = self.acquire_slot()?;
        Some(self.install(index, value))
    }

    /// Stores `value`, spinning until a slot becomes free.
    ///
    /// Never parks; pair with capacities sized for the workload.
    pub fn spin_emplace(&self, value: T) -> Handle<BITS> {
        let index = loop {
            if let Some(index) = self.acquire_slot() {
                break index;
            }
            std::hint::spin_loop();
        };
        self.install(index, value)
    }

    fn install(&self, index: u32, value: T) -> Handle<BITS> {
        let slot = &self.slots[index as usize];
        // SAFETY: `acquire_slot` unlinked this slot from the free list, so no
        // other thread can reach its storage until the handle is published.
        unsafe { (*slot.value.get()).write(value) };
        self.len.fetch_add(1, Ordering::Relaxed);
        Handle::from_raw(slot.id.load(Ordering::Acquire))
    }

    /// Pops a slot off the free list and marks it occupied.
    fn acquire_slot(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let head_index = raw::index::<BITS>(head);
            if head_index == Handle::<BITS>::INVALID_INDEX {
                return None;
            }
            let link = raw::index::<BITS>(self.slots[head_index as usize].id.load(Ordering::Acquire));
            let new_head = raw::bump_generation_with_index::<BITS>(head, link);
            match self.free_head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Point the slot id back at its own index, keeping the
                    // generation: this is what makes the handle validate.
                    let slot = &self.slots[head_index as usize];
                    let id = slot.id.load(Ordering::Acquire);
                    slot.id
                        .store(raw::with_index::<BITS>(id, head_index), Ordering::Release);
                    return Some(head_index);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Wins exclusive ownership of a still-valid slot by bumping its
    /// generation in place. Loses the race (and returns `None`) if another
    /// thread invalidated the handle first.
    fn lock_slot(&self, handle: Handle<BITS>) -> Option<u32> {
        let index = handle.index();
        if index >= self.capacity() {
            return None;
        }
        let invalidated = raw::bump_generation::<BITS>(handle.to_raw());
        self.slots[index as usize]
            .id
            .compare_exchange(
                handle.to_raw(),
                invalidated,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()?;
        Some(index)
    }

    /// Pushes a locked slot back onto the free list.
    fn release_slot(&self, index: u32) {
        let slot = &self.slots[index as usize];
        let released = slot.id.load(Ordering::Relaxed);
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            // Link this slot at the current head before publishing it.
            slot.id.store(
                raw::with_index::<BITS>(released, raw::index::<BITS>(head)),
                Ordering::Release,
            );
            let new_head = raw::bump_generation_with_index::<BITS>(head, index);
            match self.free_head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Destroys the value named by `handle` and recycles its slot.
    ///
    /// Idempotent: erasing an invalid (or already-erased) handle is a no-op.
    /// Returns true if this call performed the erase.
    pub fn erase(&self, handle: Handle<BITS>) -> bool {
        let Some(index) = self.lock_slot(handle) else {
            return false;
        };
        let slot = &self.slots[index as usize];
        // SAFETY: `lock_slot` won the CAS, so this thread exclusively owns
        // the still-initialized value.
        unsafe { (*slot.value.get()).assume_init_drop() };
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.release_slot(index);
        true
    }

    /// Like [`SlotPool::erase`], but moves the stored value out first.
    pub fn move_out(&self, handle: Handle<BITS>) -> Option<T> {
        let index = self.lock_slot(handle)?;
        let slot = &self.slots[index as usize];
        // SAFETY: as in `erase`; the value is read exactly once and its slot
        // storage is treated as uninitialized afterwards.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.release_slot(index);
        Some(value)
    }

    /// Returns a reference to the value named by `handle`.
    ///
    /// # Safety
    ///
    /// `is_valid(handle)` must hold and the caller must guarantee no
    /// concurrent `erase`/`move_out` of this handle for the reference's
    /// lifetime (typically by an outer lock).
    #[must_use]
    pub unsafe fn get(&self, handle: Handle<BITS>) -> &T {
        debug_assert!(self.is_valid(handle), "stale handle: {handle:?}");
        let slot = &self.slots[handle.index() as usize];
        unsafe { (*slot.value.get()).assume_init_ref() }
    }

    /// Returns a mutable reference to the value named by `handle`.
    ///
    /// # Safety
    ///
    /// As [`SlotPool::get`], and additionally the caller must guarantee the
    /// reference is unique for its lifetime.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, handle: Handle<BITS>) -> &mut T {
        debug_assert!(self.is_valid(handle), "stale handle: {handle:?}");
        let slot = &self.slots[handle.index() as usize];
        unsafe { (*slot.value.get()).assume_init_mut() }
    }

    fn occupied(&self, index: u32) -> bool {
        raw::index::<BITS>(self.slots[index as usize].id.load(Ordering::Acquire)) == index
    }

    /// Drops every stored value and resets the pool to empty.
    ///
    /// # Safety
    ///
    /// Requires external quiescence: no other thread may be calling any
    /// method of this pool, and all outstanding handles become invalid.
    pub unsafe fn unsafe_clear(&self) {
        self.destroy_occupied();
        self.len.store(0, Ordering::Relaxed);
        self.link_free_list();
    }

    fn destroy_occupied(&self) {
        for index in 0..self.capacity() {
            if self.occupied(index) {
                let slot = &self.slots[index as usize];
                // SAFETY: occupied slots hold initialized values; quiescence
                // is guaranteed by the caller (or by `&mut self` in drop).
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}

impl<T, const BITS: u32> Drop for SlotPool<T, BITS> {
    fn drop(&mut self) {
        self.destroy_occupied();
    }
}

impl<T, const BITS: u32> std::fmt::Debug for SlotPool<T, BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
