//! Requests too large for any size class get a mapping of their own:
//! one chunk, one slot, no occupancy tracking, no list membership.
//! Since each mapping is self-describing, this path touches no shared
//! state and needs no lock.
use std::ptr;
use std::ptr::NonNull;

use crate::chunk::ChunkHeader;
use crate::chunk::OccupancyMap;
use crate::chunk::Slot;
use crate::chunk::BACKREF_SIZE;
use crate::chunk::CHUNK_HEADER_SIZE;
use crate::class::LARGE_CLASS;
use crate::class::PAGE_BYTES;
use crate::map;

/// Smallest page multiple that holds the chunk header, the
/// back-reference, and `request` payload bytes.
fn mapping_bytes(request: usize) -> usize {
    request
        .checked_add(CHUNK_HEADER_SIZE + BACKREF_SIZE)
        .and_then(|total| total.checked_add(PAGE_BYTES - 1))
        .map(|padded| (padded / PAGE_BYTES) * PAGE_BYTES)
        .unwrap_or_else(|| map::die("allocation size overflows", libc::ENOMEM))
}

/// Serves `request` bytes from a dedicated mapping.  Aborts if the
/// kernel refuses the mapping.
pub fn allocate_huge(request: usize) -> Slot {
    let bytes = mapping_bytes(request);
    let region = map::map_region(bytes)
        .unwrap_or_else(|errno| map::die("unable to map large allocation", errno));

    let header = region.as_ptr() as *mut ChunkHeader;
    unsafe {
        ptr::write(
            header,
            ChunkHeader {
                chunk_size: bytes,
                class_id: LARGE_CLASS,
                arena_id: 0,
                occupancy: OccupancyMap::FULL,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
            },
        );

        let addr = ChunkHeader::slot_base(header);
        ptr::write(addr as *mut usize, header as usize);

        Slot::resolve(NonNull::new_unchecked(
            (addr + BACKREF_SIZE) as *mut std::ffi::c_void,
        ))
    }
}

/// Releases a large allocation: the whole mapping goes back to the
/// OS at once.
pub fn release_huge(slot: Slot) {
    debug_assert_eq!(slot.class_id(), LARGE_CLASS);

    let chunk = slot.chunk();
    unsafe { ChunkHeader::destroy(chunk) };
}
