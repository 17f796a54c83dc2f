//! This module services the public allocate, release, and reallocate
//! calls: it folds the back-reference overhead into the request,
//! picks a size class, and hands the work to the bucketed engine or
//! the large-allocation path.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;

use crate::arena;
use crate::chunk::Slot;
use crate::chunk::BACKREF_SIZE;
use crate::chunk::CHUNK_HEADER_SIZE;
use crate::class;
use crate::class::LARGE_CLASS;
use crate::class::SIZE_CLASSES;
use crate::huge;
use crate::map;

/// Reads the owning chunk's class for contract checks.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
pub(crate) fn block_class(block: &NonNull<c_void>) -> u32 {
    unsafe { Slot::resolve(*block).class_id() }
}

/// Allocates `request` bytes.  Never returns NULL: a refused mapping
/// aborts the process.
///
/// The returned pointer carries the fundamental alignment of the
/// platform and stays valid until passed to `release` (or consumed
/// by `reallocate`).
#[ensures(debug_allocation_map::mark_allocated(&ret, block_class(&ret)).is_ok(),
          "Successful allocations are fresh and tracked.")]
pub fn allocate(request: usize) -> NonNull<c_void> {
    let footprint = request
        .checked_add(BACKREF_SIZE)
        .unwrap_or_else(|| map::die("allocation size overflows", libc::ENOMEM));

    let slot = match class::class_for_footprint(footprint) {
        Some(class_idx) => arena::allocate_bucketed(class_idx),
        None => huge::allocate_huge(request),
    };

    slot.into_block()
}

/// Releases a block previously returned by `allocate`.  The slot's
/// back-reference names the owning chunk, which decides between the
/// bucketed and large paths.
///
/// Releasing a pointer this allocator did not return, or releasing
/// the same block twice, is undefined behavior and is not detected.
#[requires(debug_allocation_map::mark_released(&block, block_class(&block)).is_ok(),
           "Released blocks are live and match their owning class.")]
pub fn release(block: NonNull<c_void>) {
    let slot = unsafe { Slot::resolve(block) };

    if slot.class_id() == LARGE_CLASS {
        huge::release_huge(slot);
    } else {
        arena::release_bucketed(slot);
    }
}

/// Resizes `block` to `request` bytes with the classic aliases: a
/// `None` block allocates, a zero `request` releases and returns
/// `None`.  Otherwise the contents move: allocate fresh, copy the
/// smaller of the old capacity and `request`, release the original.
#[ensures(ret.is_some() -> debug_allocation_map::is_live(ret.as_ref().unwrap()).is_ok(),
          "A returned block is live.")]
pub fn reallocate(block: Option<NonNull<c_void>>, request: usize) -> Option<NonNull<c_void>> {
    let old = match block {
        None => return Some(allocate(request)),
        Some(old) => old,
    };

    if request == 0 {
        release(old);
        return None;
    }

    let preserved = usable_capacity(old).min(request);
    let fresh = allocate(request);
    unsafe {
        std::ptr::copy_nonoverlapping(
            old.as_ptr() as *const u8,
            fresh.as_ptr() as *mut u8,
            preserved,
        );
    }
    release(old);

    Some(fresh)
}

/// Bytes the caller may use at `block`: the slot footprint net of
/// the back-reference for a bucketed block, the mapping net of the
/// header and back-reference for a large one.
#[requires(debug_allocation_map::is_live(&block).is_ok(), "The block is live.")]
pub fn usable_capacity(block: NonNull<c_void>) -> usize {
    let slot = unsafe { Slot::resolve(block) };

    if slot.class_id() == LARGE_CLASS {
        let chunk_size = unsafe { (*slot.chunk()).chunk_size };

        chunk_size - CHUNK_HEADER_SIZE - BACKREF_SIZE
    } else {
        SIZE_CLASSES[slot.class_id() as usize].slot_size - BACKREF_SIZE
    }
}

#[cfg(test)]
mod test {
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::ffi::c_void;
    use std::ptr;
    use std::ptr::NonNull;

    use super::*;

    #[test]
    fn smoke_test() {
        for _ in 0..10_000 {
            let block = allocate(16);

            unsafe { ptr::write_bytes(block.as_ptr() as *mut u8, 0xA5, 16) };
            release(block);
        }
    }

    // Every small block is distinct, and a class outgrows a single
    // chunk.
    #[test]
    fn distinct_small_blocks() {
        let blocks: Vec<NonNull<c_void>> = (0..10_000).map(|_| allocate(24)).collect();

        let distinct: HashSet<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        assert_eq!(distinct.len(), blocks.len());

        let chunks: HashSet<usize> = blocks
            .iter()
            .map(|b| unsafe { Slot::resolve(*b).chunk() as usize })
            .collect();
        assert!(chunks.len() > 1);

        for block in blocks {
            release(block);
        }
    }

    #[test]
    fn zero_size_blocks_are_distinct() {
        let a = allocate(0);
        let b = allocate(0);

        assert_ne!(a.as_ptr(), b.as_ptr());

        release(a);
        release(b);
    }

    #[test]
    fn fundamental_alignment() {
        for &size in &[0usize, 1, 8, 13, 16, 24, 100, 500, 4096, 100_000] {
            let block = allocate(size);

            assert_eq!(block.as_ptr() as usize % std::mem::size_of::<usize>(), 0);
            release(block);
        }
    }

    #[test]
    fn capacity_matches_class() {
        let block = allocate(16);
        assert_eq!(usable_capacity(block), 24 - BACKREF_SIZE);
        release(block);

        let block = allocate(30);
        assert_eq!(usable_capacity(block), 48 - BACKREF_SIZE);
        release(block);

        let block = allocate(1 << 20);
        assert!(usable_capacity(block) >= 1 << 20);
        release(block);
    }

    // A request beyond the largest class takes the dedicated-mapping
    // path and comes back wholesale.
    #[test]
    fn large_allocation_roundtrip() {
        let block = allocate(1 << 20);

        assert_eq!(unsafe { Slot::resolve(block).class_id() }, LARGE_CLASS);

        unsafe {
            ptr::write_bytes(block.as_ptr() as *mut u8, 0x42, 1 << 20);
            assert_eq!(ptr::read(block.as_ptr() as *const u8), 0x42);
        }

        release(block);
    }

    #[test]
    fn realloc_grows_and_preserves() {
        let block = allocate(24);
        unsafe {
            ptr::copy_nonoverlapping(b"hello\0".as_ptr(), block.as_ptr() as *mut u8, 6);
        }

        let grown = reallocate(Some(block), 64).expect("non-zero reallocate returns a block");
        unsafe {
            assert_eq!(
                std::slice::from_raw_parts(grown.as_ptr() as *const u8, 6),
                b"hello\0"
            );
        }

        release(grown);
    }

    #[test]
    fn realloc_shrinks_and_preserves() {
        let block = allocate(64);
        unsafe { ptr::write_bytes(block.as_ptr() as *mut u8, 0x7F, 64) };

        let shrunk = reallocate(Some(block), 16).expect("non-zero reallocate returns a block");
        unsafe {
            for i in 0..16 {
                assert_eq!(ptr::read((shrunk.as_ptr() as *const u8).add(i)), 0x7F);
            }
        }

        release(shrunk);
    }

    // Crossing the class boundary in both directions preserves the
    // overlapping prefix.
    #[test]
    fn realloc_across_large_boundary() {
        let block = allocate(100);
        unsafe { ptr::write_bytes(block.as_ptr() as *mut u8, 0x33, 100) };

        let grown = reallocate(Some(block), 2 << 20).expect("non-zero reallocate returns a block");
        unsafe {
            for i in 0..100 {
                assert_eq!(ptr::read((grown.as_ptr() as *const u8).add(i)), 0x33);
            }
        }

        let shrunk = reallocate(Some(grown), 32).expect("non-zero reallocate returns a block");
        unsafe {
            for i in 0..32 {
                assert_eq!(ptr::read((shrunk.as_ptr() as *const u8).add(i)), 0x33);
            }
        }

        release(shrunk);
    }

    #[test]
    fn realloc_aliases() {
        // reallocate(None, n) is allocate(n).
        let block = reallocate(None, 40).expect("allocating alias returns a block");

        // reallocate(p, 0) is release(p).
        assert_eq!(reallocate(Some(block), 0), None);
    }

    // Eight threads hammering allocate/release across the size mix,
    // including the large path.
    #[test]
    fn concurrent_hammer() {
        const THREADS: usize = 8;
        const CYCLES: usize = 10_000;
        const SIZES: [usize; 6] = [16, 24, 40, 64, 500, 1000];

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                std::thread::spawn(move || {
                    let mut live: Vec<NonNull<c_void>> = Vec::new();

                    for i in 0..CYCLES {
                        let size = SIZES[(i + t) % SIZES.len()];
                        let block = allocate(size);

                        unsafe { ptr::write_bytes(block.as_ptr() as *mut u8, t as u8, size) };
                        live.push(block);

                        if live.len() >= 16 {
                            release(live.remove(0));
                        }
                    }

                    for block in live.drain(..) {
                        release(block);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker should not panic");
        }
    }

    proptest! {
        // Bulk allocate, then deallocate and re-allocate in
        // random-ish order, checking freshness against the live set.
        #[test]
        fn random_order(indices in vec(0..20usize, 1..50)) {
            let sizes = [8usize, 16, 40, 120];

            // If a slot is None, we will allocate in there the next
            // time we hit it.  If it holds a pointer, we will instead
            // consume and free its contents.
            //
            // Let the vec leak because we do not want to drop its
            // contents on panic.
            let slots: &mut Vec<Option<NonNull<c_void>>> = Box::leak(Box::new(Vec::new()));
            slots.resize_with(20, || None);

            for index in indices.iter().cloned() {
                if let Some(block) = slots[index].take() {
                    release(block);
                } else {
                    let block = allocate(sizes[index % sizes.len()]);

                    let fresh = slots.iter().all(|x| {
                        match x {
                            Some(p) => p.as_ptr() != block.as_ptr(),
                            None => true,
                        }
                    });
                    prop_assert!(fresh);
                    slots[index] = Some(block);
                }
            }

            for slot in slots.iter_mut() {
                if let Some(block) = slot.take() {
                    release(block);
                }
            }

            // Reacquire the vector to avoid leaking on success.
            unsafe { Box::from_raw(slots as *mut _); }
        }
    }
}
