//! This module tracks the liveness of allocated blocks in contract
//! builds: double allocations, double frees, and back-references that
//! stop matching their allocation-time class all surface here.
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

struct AllocationInfo {
    class_id: u32,
    live: bool, // True if owned by the mutator
}

lazy_static::lazy_static! {
    static ref ALLOCATION_STATE_MAP: Mutex<HashMap<usize, AllocationInfo>> = Default::default();
}

/// Marks this block as returned to the mutator.
pub fn mark_allocated(block: &NonNull<c_void>, class_id: u32) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .entry(block.as_ptr() as usize)
        .or_insert(AllocationInfo {
            class_id,
            live: false,
        });

    if info.live {
        return Err("double allocation");
    }

    // Chunks are transient mappings, so the OS may hand a released
    // address back to a different class; the stale class is not an
    // error.
    info.class_id = class_id;
    info.live = true;
    Ok(())
}

/// Marks this block as released by the mutator.
pub fn mark_released(block: &NonNull<c_void>, class_id: u32) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .get_mut(&(block.as_ptr() as usize))
        .ok_or("released unknown address")?;

    if info.class_id != class_id {
        return Err("class mismatch");
    }

    if !info.live {
        return Err("double free");
    }

    info.live = false;
    Ok(())
}

/// Confirms that the block is currently owned by the mutator.
pub fn is_live(block: &NonNull<c_void>) -> Result<(), &'static str> {
    let map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .get(&(block.as_ptr() as usize))
        .ok_or("unknown address")?;

    if !info.live {
        return Err("address is not live");
    }

    Ok(())
}
