//! The size-class table.  Every allocation that fits one of these
//! classes is served from that class's chunk pool; anything larger
//! goes to the one-mapping-per-allocation path in `huge`.
//!
//! The table is a compile-time constant: the allocator has no
//! configuration surface, so tuning happens here and nowhere else.
use crate::chunk::CHUNK_HEADER_SIZE;
use crate::chunk::OCCUPANCY_BITS;

/// Chunk page counts are expressed against this page size.
pub const PAGE_BYTES: usize = 4096;

/// `class_id` value marking a chunk that serves a single large
/// allocation and belongs to no class list.
pub const LARGE_CLASS: u32 = u32::MAX;

/// One entry in the size-class table.
///
/// `slot_size` is the full slot footprint, back-reference word
/// included.  A chunk for this class occupies `chunk_pages` pages and
/// carries `slot_count` slots after its header.
#[derive(Clone, Copy, Debug)]
pub struct ClassShape {
    pub slot_size: usize,
    pub chunk_pages: usize,
    pub slot_count: usize,
}

impl ClassShape {
    /// Total bytes in a mapping backing a chunk of this class.
    #[inline]
    pub const fn chunk_bytes(&self) -> usize {
        self.chunk_pages * PAGE_BYTES
    }
}

const fn shape(slot_size: usize, chunk_pages: usize, slot_count: usize) -> ClassShape {
    ClassShape {
        slot_size,
        chunk_pages,
        slot_count,
    }
}

pub const CLASS_COUNT: usize = 12;

/// Slot sizes cover common small-object footprints and several powers
/// of two; the top class fits a 4 KiB request plus its back-reference.
/// Counts are chosen to fill the chunk's pages after the 64-byte
/// header.
#[cfg(not(feature = "test_only_small_constants"))]
pub const SIZE_CLASSES: [ClassShape; CLASS_COUNT] = [
    shape(24, 1, 168),
    shape(32, 2, 254),
    shape(48, 2, 169),
    shape(64, 4, 255),
    shape(96, 4, 170),
    shape(128, 8, 255),
    shape(192, 8, 170),
    shape(256, 16, 255),
    shape(512, 16, 127),
    shape(1024, 32, 127),
    shape(2048, 32, 63),
    shape(4160, 36, 35),
];

/// Same slot sizes, eight slots per chunk: chunks fill up and empty
/// out constantly, which exercises the spill and release paths.
#[cfg(feature = "test_only_small_constants")]
pub const SIZE_CLASSES: [ClassShape; CLASS_COUNT] = [
    shape(24, 1, 8),
    shape(32, 1, 8),
    shape(48, 1, 8),
    shape(64, 1, 8),
    shape(96, 1, 8),
    shape(128, 1, 8),
    shape(192, 1, 8),
    shape(256, 1, 8),
    shape(512, 2, 8),
    shape(1024, 3, 8),
    shape(2048, 5, 8),
    shape(4160, 9, 8),
];

/// Largest footprint the bucketed path can serve.
pub const MAX_SLOT_SIZE: usize = SIZE_CLASSES[CLASS_COUNT - 1].slot_size;

const fn table_is_valid() -> bool {
    let mut i = 0;
    let mut prev = 0;
    while i < CLASS_COUNT {
        let c = SIZE_CLASSES[i];

        // Strictly ascending, and a multiple of the fundamental
        // alignment so slot boundaries stay aligned.
        if c.slot_size <= prev || c.slot_size % 8 != 0 {
            return false;
        }

        // The occupancy map must cover every slot.
        if c.slot_count == 0 || c.slot_count > OCCUPANCY_BITS {
            return false;
        }

        // Header plus slot array must fit the mapping.
        if CHUNK_HEADER_SIZE + c.slot_size * c.slot_count > c.chunk_bytes() {
            return false;
        }

        prev = c.slot_size;
        i += 1;
    }
    true
}

const _: () = assert!(table_is_valid());
static_assertions::const_assert!(CLASS_COUNT < 16);

/// Returns the index of the smallest class whose slots hold
/// `footprint` bytes, or `None` when the request is too big for any
/// class.  The table has fewer than 16 entries; a linear scan is the
/// whole search.
#[inline]
pub fn class_for_footprint(footprint: usize) -> Option<usize> {
    if footprint > MAX_SLOT_SIZE {
        return None;
    }

    for (i, class) in SIZE_CLASSES.iter().enumerate() {
        if class.slot_size >= footprint {
            return Some(i);
        }
    }

    None
}
