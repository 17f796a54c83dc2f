mod arena;
mod chunk;
mod class;
mod dispatch;
mod huge;
mod map;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;

use std::ffi::c_void;
use std::ptr::NonNull;

pub use dispatch::allocate;
pub use dispatch::reallocate;
pub use dispatch::release;
pub use dispatch::usable_capacity;

/// Allocates `size` bytes and returns a pointer with fundamental
/// alignment.  Never returns NULL: a refused mapping aborts.
#[no_mangle]
pub extern "C" fn quarry_allocate(size: usize) -> *mut c_void {
    dispatch::allocate(size).as_ptr()
}

/// Releases an allocation returned by `quarry_allocate` or
/// `quarry_reallocate`.  NULL is a no-op.
///
/// # Safety
///
/// `ptr` must be NULL or a live allocation from this allocator;
/// anything else is undefined behavior.
#[no_mangle]
pub unsafe extern "C" fn quarry_release(ptr: *mut c_void) {
    if let Some(block) = NonNull::new(ptr) {
        dispatch::release(block);
    }
}

/// Resizes an allocation, with the classic aliases: a NULL `ptr`
/// allocates, a zero `size` releases and returns NULL.  The first
/// `min(old capacity, size)` bytes are preserved; the old pointer is
/// invalid after a successful call.
///
/// # Safety
///
/// `ptr` must be NULL or a live allocation from this allocator.
#[no_mangle]
pub unsafe extern "C" fn quarry_reallocate(ptr: *mut c_void, size: usize) -> *mut c_void {
    match dispatch::reallocate(NonNull::new(ptr), size) {
        Some(block) => block.as_ptr(),
        None => std::ptr::null_mut(),
    }
}
