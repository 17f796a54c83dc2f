//! A chunk is one OS mapping: a header, then either an array of
//! equal-sized slots (bucketed chunks) or a single large allocation.
//! The first word of every slot is a back-reference to the owning
//! chunk's header, which is how `release` finds its way home in O(1).
use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::ptr::NonNull;

use crate::class::ClassShape;
use crate::map;

pub const OCCUPANCY_WORDS: usize = 4;
pub const OCCUPANCY_BITS: usize = 64 * OCCUPANCY_WORDS;

/// The back-reference word prefixed to every slot.
pub const BACKREF_SIZE: usize = mem::size_of::<usize>();

/// Chunk headers occupy a fixed prefix of the mapping; the slot array
/// starts at this offset.
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Per-slot liveness for a bucketed chunk: bit `i` is 1 iff slot `i`
/// is handed out.  Bits at `slot_count` and beyond are permanently 1,
/// so "find a free slot" never needs a bounds check.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct OccupancyMap {
    words: [u64; OCCUPANCY_WORDS],
}

impl OccupancyMap {
    /// The pattern conventionally stored in list sentinels: nothing
    /// to carve, ever.
    pub const FULL: OccupancyMap = OccupancyMap {
        words: [u64::MAX; OCCUPANCY_WORDS],
    };

    /// The canonical empty pattern for a class with `slot_count`
    /// slots: in-range bits clear, out-of-range bits set.
    pub const fn empty(slot_count: usize) -> OccupancyMap {
        let mut words = [0u64; OCCUPANCY_WORDS];
        let mut idx = slot_count;
        while idx < OCCUPANCY_BITS {
            words[idx / 64] |= 1u64 << (idx % 64);
            idx += 1;
        }

        OccupancyMap { words }
    }

    /// Returns the index of a free slot, or `None` when every slot is
    /// taken.  Words are scanned from the end of the map toward the
    /// beginning; within a word, the hardware bit scan picks the
    /// lowest clear bit.  The order is arbitrary but deterministic.
    #[inline]
    pub fn find_free(&self) -> Option<usize> {
        for word_idx in (0..OCCUPANCY_WORDS).rev() {
            let word = self.words[word_idx];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                return Some(word_idx * 64 + bit);
            }
        }

        None
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < OCCUPANCY_BITS);
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    pub fn clear(&mut self, idx: usize) {
        debug_assert!(idx < OCCUPANCY_BITS);
        self.words[idx / 64] &= !(1u64 << (idx % 64));
    }

    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        debug_assert!(idx < OCCUPANCY_BITS);
        (self.words[idx / 64] & (1u64 << (idx % 64))) != 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.words == [u64::MAX; OCCUPANCY_WORDS]
    }

    /// Number of live slots, i.e. 1-bits net of the out-of-range
    /// sentinel bits.
    pub fn live_slots(&self, slot_count: usize) -> usize {
        let ones: u32 = self.words.iter().map(|w| w.count_ones()).sum();

        ones as usize - (OCCUPANCY_BITS - slot_count)
    }
}

/// Every chunk begins with this header.  `class_id` is an index into
/// the size-class table, or `LARGE_CLASS` for a chunk that serves a
/// single large allocation; `arena_id` names the arena whose mutex
/// guards the chunk (meaningless for large chunks).  `next`/`prev`
/// link bucketed chunks into their class's ring.
#[repr(C)]
pub struct ChunkHeader {
    pub chunk_size: usize,
    pub class_id: u32,
    pub arena_id: u32,
    pub occupancy: OccupancyMap,
    pub next: *mut ChunkHeader,
    pub prev: *mut ChunkHeader,
}

static_assertions::const_assert_eq!(mem::size_of::<ChunkHeader>(), CHUNK_HEADER_SIZE);
static_assertions::const_assert_eq!(CHUNK_HEADER_SIZE % BACKREF_SIZE, 0);
static_assertions::const_assert!(mem::align_of::<ChunkHeader>() <= CHUNK_HEADER_SIZE);

/// A slot in flight between the engine and the public surface: the
/// caller-visible block paired with the chunk that owns it.
///
/// A `Slot` only comes into existence when a chunk carves one out, or
/// when `resolve` re-derives ownership from a block's back-reference
/// at the release boundary.  It cannot be cloned, so the engine hands
/// out exactly one per live slot, and the owning chunk travels with
/// the block instead of being re-read at every layer.
pub struct Slot {
    chunk: *mut ChunkHeader,
    block: NonNull<c_void>,
}

impl Slot {
    /// Recovers the `Slot` for a pointer the caller gave back, by
    /// reading the back-reference just before it.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator and not yet
    /// freed.
    #[inline]
    pub unsafe fn resolve(block: NonNull<c_void>) -> Slot {
        let addr = block.as_ptr() as usize - BACKREF_SIZE;
        let chunk = ptr::read(addr as *const usize) as *mut ChunkHeader;

        Slot { chunk, block }
    }

    /// The owning chunk's header.
    #[inline]
    pub fn chunk(&self) -> *mut ChunkHeader {
        self.chunk
    }

    /// The owning chunk's class, `LARGE_CLASS` for a dedicated
    /// mapping.
    #[inline]
    pub fn class_id(&self) -> u32 {
        unsafe { (*self.chunk).class_id }
    }

    /// Only used by tests: the caller-visible address, without
    /// giving up the slot.
    #[cfg(test)]
    pub(crate) fn block(&self) -> NonNull<c_void> {
        self.block
    }

    /// Surrenders the slot as a bare pointer, e.g. to return it from
    /// the public allocate call.
    #[inline]
    pub fn into_block(self) -> NonNull<c_void> {
        self.block
    }
}

impl ChunkHeader {
    /// Maps a fresh chunk for size class `class_idx` and initializes
    /// its header.  The chunk is not linked anywhere yet.  Aborts if
    /// the kernel refuses the mapping.
    pub fn new_bucketed(class_idx: usize, shape: ClassShape, arena_id: u32) -> *mut ChunkHeader {
        let bytes = shape.chunk_bytes();
        let region =
            map::map_region(bytes).unwrap_or_else(|errno| map::die("unable to map chunk", errno));

        let header = region.as_ptr() as *mut ChunkHeader;
        unsafe {
            ptr::write(
                header,
                ChunkHeader {
                    chunk_size: bytes,
                    class_id: class_idx as u32,
                    arena_id,
                    occupancy: OccupancyMap::empty(shape.slot_count),
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                },
            );
        }

        header
    }

    /// Returns the mapping behind `header` to the OS.
    ///
    /// # Safety
    ///
    /// `header` must point at a live chunk that is not linked into
    /// any list and owns no live slots.
    pub unsafe fn destroy(header: *mut ChunkHeader) {
        let size = (*header).chunk_size;
        let base = NonNull::new(header as *mut c_void).expect("chunk headers are never NULL");

        if let Err(errno) = map::unmap_region(base, size) {
            map::die("unable to unmap chunk", errno);
        }
    }

    /// Address of the first slot.
    #[inline]
    pub fn slot_base(header: *const ChunkHeader) -> usize {
        header as usize + CHUNK_HEADER_SIZE
    }

    /// Takes the next free slot: flips its occupancy bit, writes the
    /// back-reference, and returns the slot with its caller-visible
    /// address just past that word.  Returns `None` when the chunk is
    /// full.
    ///
    /// # Safety
    ///
    /// The caller must hold the owning arena's lock and `self` must
    /// live inside a mapping of `chunk_size` bytes.
    pub unsafe fn carve_slot(&mut self, slot_size: usize) -> Option<Slot> {
        let idx = self.occupancy.find_free()?;
        self.occupancy.set(idx);

        let chunk = self as *mut ChunkHeader;
        let addr = ChunkHeader::slot_base(chunk) + idx * slot_size;
        ptr::write(addr as *mut usize, chunk as usize);

        Some(Slot {
            chunk,
            block: NonNull::new_unchecked((addr + BACKREF_SIZE) as *mut c_void),
        })
    }

    /// Takes `slot` back: clears its occupancy bit and reports
    /// whether the chunk is now entirely empty (canonical empty
    /// pattern).
    ///
    /// # Safety
    ///
    /// The caller must hold the owning arena's lock; `slot` must be
    /// live and owned by this chunk.
    pub unsafe fn release_slot(&mut self, slot: Slot, shape: ClassShape) -> bool {
        debug_assert!(ptr::eq(slot.chunk(), self as *mut ChunkHeader));

        let addr = slot.into_block().as_ptr() as usize - BACKREF_SIZE;
        let idx = (addr - ChunkHeader::slot_base(self)) / shape.slot_size;

        debug_assert!(idx < shape.slot_count);
        debug_assert!(self.occupancy.is_set(idx));
        self.occupancy.clear(idx);

        let now_empty = self.occupancy == OccupancyMap::empty(shape.slot_count);
        debug_assert_eq!(now_empty, self.occupancy.live_slots(shape.slot_count) == 0);

        now_empty
    }
}
