//! Allocator state is sharded into a fixed set of arenas.  Each arena
//! owns one chunk ring per size class, all guarded by a single mutex.
//! Threads stick to a preferred arena while it is uncontended and
//! spread out automatically when it is not.
use std::cell::Cell;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::chunk::ChunkHeader;
use crate::chunk::OccupancyMap;
use crate::chunk::Slot;
use crate::class::ClassShape;
use crate::class::CLASS_COUNT;
use crate::class::SIZE_CLASSES;

pub const ARENA_COUNT: usize = 4;

/// A cyclic doubly-linked ring of chunks for one size class.  The
/// sentinel head is an ordinary chunk header whose occupancy map is
/// permanently full, so the search for a free slot only ever compares
/// against the head after finding a full map.
struct ClassList {
    sentinel: ChunkHeader,
}

impl ClassList {
    fn new(class_id: u32, arena_id: u32) -> ClassList {
        ClassList {
            sentinel: ChunkHeader {
                chunk_size: 0,
                class_id,
                arena_id,
                occupancy: OccupancyMap::FULL,
                next: std::ptr::null_mut(),
                prev: std::ptr::null_mut(),
            },
        }
    }
}

/// The mutex-guarded contents of one arena.
pub struct ArenaShard {
    // Boxed so the sentinels' addresses survive moves of the shard
    // itself; the ring links point into this storage.
    lists: Box<[ClassList]>,
}

// The shard only holds pointers to chunks the arena owns; the arena
// mutex serializes all access to them.
unsafe impl Send for ArenaShard {}

pub struct Arena {
    shard: Mutex<ArenaShard>,
}

impl ArenaShard {
    fn new(arena_id: u32) -> ArenaShard {
        let mut lists: Box<[ClassList]> = (0..CLASS_COUNT)
            .map(|class_id| ClassList::new(class_id as u32, arena_id))
            .collect();

        // The list storage is final: close each ring on itself.
        for list in lists.iter_mut() {
            let sentinel = &mut list.sentinel as *mut ChunkHeader;
            unsafe {
                (*sentinel).next = sentinel;
                (*sentinel).prev = sentinel;
            }
        }

        ArenaShard { lists }
    }
}

lazy_static::lazy_static! {
    static ref ARENAS: Box<[Arena]> = (0..ARENA_COUNT)
        .map(|arena_id| Arena {
            shard: Mutex::new(ArenaShard::new(arena_id as u32)),
        })
        .collect();
}

fn arenas() -> &'static [Arena] {
    &ARENAS
}

// A thread keeps allocating from the arena it last acquired without
// waiting.
thread_local!(static PREFERRED_ARENA: Cell<usize> = Cell::new(0));

/// Serves one slot of size class `class_idx` from some arena: every
/// arena is probed with a non-blocking acquisition starting at the
/// thread's preferred index, and the first success wins and becomes
/// the new preference.  If the whole sweep fails, the thread waits on
/// its preferred arena.
pub fn allocate_bucketed(class_idx: usize) -> Slot {
    let arenas = arenas();
    let start = PREFERRED_ARENA.try_with(|cell| cell.get()).unwrap_or(0);

    for offset in 0..ARENA_COUNT {
        let index = (start + offset) % ARENA_COUNT;
        if let Ok(shard) = arenas[index].shard.try_lock() {
            let _ = PREFERRED_ARENA.try_with(|cell| cell.set(index));

            return allocate_locked(shard, class_idx, index as u32);
        }
    }

    allocate_locked(
        arenas[start].shard.lock().unwrap(),
        class_idx,
        start as u32,
    )
}

fn allocate_locked(
    mut shard: MutexGuard<'_, ArenaShard>,
    class_idx: usize,
    arena_id: u32,
) -> Slot {
    let shape = SIZE_CLASSES[class_idx];
    let sentinel = &mut shard.lists[class_idx].sentinel as *mut ChunkHeader;

    unsafe {
        let mut cursor = (*sentinel).next;
        while (*cursor).occupancy.is_full() {
            if cursor == sentinel {
                // Walked the whole ring without finding space.
                cursor = grow(sentinel, class_idx, shape, arena_id);
                break;
            }
            cursor = (*cursor).next;
        }

        (*cursor)
            .carve_slot(shape.slot_size)
            .expect("a non-full chunk always has a slot to carve")
    }
}

/// Maps a fresh chunk and links it at the head of the ring.
unsafe fn grow(
    sentinel: *mut ChunkHeader,
    class_idx: usize,
    shape: ClassShape,
    arena_id: u32,
) -> *mut ChunkHeader {
    let fresh = ChunkHeader::new_bucketed(class_idx, shape, arena_id);

    (*fresh).next = (*sentinel).next;
    (*fresh).prev = sentinel;
    (*(*fresh).next).prev = fresh;
    (*sentinel).next = fresh;

    fresh
}

/// Returns `slot` to the bucketed chunk that owns it.  This blocks on
/// the owner arena's mutex: a slot must go back to exactly the chunk
/// it was carved from, so there is no arena to choose.  A chunk left
/// with no live slot is unlinked and unmapped.
pub fn release_bucketed(slot: Slot) {
    let chunk = slot.chunk();

    // Immutable after chunk initialization, so safe to read before
    // taking the lock.
    let (arena_id, class_idx) =
        unsafe { ((*chunk).arena_id as usize, (*chunk).class_id as usize) };
    let shape = SIZE_CLASSES[class_idx];

    let _shard = arenas()[arena_id].shard.lock().unwrap();

    unsafe {
        if (*chunk).release_slot(slot, shape) {
            (*(*chunk).prev).next = (*chunk).next;
            (*(*chunk).next).prev = (*chunk).prev;
            ChunkHeader::destroy(chunk);
        }
    }
}
