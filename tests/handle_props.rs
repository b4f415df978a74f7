//! Property tests for handle packing and pool round-trips.

use proptest::prelude::*;
use weft::{Handle, SlotPool};

const BITS: u32 = 12;
type H = Handle<BITS>;

proptest! {
    #[test]
    fn pack_unpack_round_trips(index in 0u32..(1 << BITS) - 1, generation in 0u32..(1 << (32 - BITS))) {
        let handle = H::from_parts(index, generation);
        prop_assert_eq!(handle.index(), index);
        prop_assert_eq!(handle.generation(), generation);
        prop_assert!(!handle.is_invalid());
    }

    #[test]
    fn handles_differ_when_any_field_differs(
        a_index in 0u32..(1 << BITS) - 1,
        b_index in 0u32..(1 << BITS) - 1,
        a_generation in 0u32..(1 << (32 - BITS)),
        b_generation in 0u32..(1 << (32 - BITS)),
    ) {
        let a = H::from_parts(a_index, a_generation);
        let b = H::from_parts(b_index, b_generation);
        prop_assert_eq!(a == b, a_index == b_index && a_generation == b_generation);
    }

    #[test]
    fn pool_round_trip_respects_validity(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..200)) {
        let pool: SlotPool<u32, BITS> = SlotPool::new(16);
        let mut live: Vec<(weft::Handle<BITS>, u32)> = Vec::new();
        let mut next_value = 0u32;

        for (is_erase, pick) in ops {
            if is_erase && !live.is_empty() {
                let (handle, _) = live.swap_remove(pick as usize % live.len());
                prop_assert!(pool.erase(handle), "live handle erases exactly once");
                prop_assert!(!pool.is_valid(handle), "erased handle is stale");
            } else if let Some(handle) = pool.emplace(next_value) {
                // A fresh handle must not alias any live one.
                for (other, _) in &live {
                    prop_assert_ne!(handle, *other);
                }
                live.push((handle, next_value));
                next_value += 1;
            } else {
                prop_assert_eq!(live.len(), 16, "emplace only fails when full");
            }

            for (handle, value) in &live {
                prop_assert!(pool.is_valid(*handle));
                // SAFETY: single-threaded proptest body; handles in `live`
                // are not erased while borrowed.
                prop_assert_eq!(unsafe { *pool.get(*handle) }, *value);
            }
        }
        prop_assert_eq!(pool.len() as usize, live.len());
    }
}
