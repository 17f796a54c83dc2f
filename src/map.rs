//! Thin wrappers around the kernel's anonymous page-mapping calls.
//! Every byte the allocator ever hands out originates in a region
//! obtained here.
use std::ffi::c_void;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: sysconf returned {}", ret);
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to map a private, anonymous, read/write region of `size`
/// bytes.  The region is page-aligned and zero-filled.
///
/// The `size` argument must be a positive multiple of the page size.
///
/// # Errors
///
/// Returns the `errno` left by `mmap` on failure.
pub fn map_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(base as *mut c_void).expect("mmap never returns NULL on success"))
    }
}

/// Releases a region of `size` bytes starting at `base`.  The pair
/// must correspond to exactly one successful `map_region` call.
///
/// The `size` argument must be a multiple of the page size.
///
/// # Errors
///
/// Returns the `errno` left by `munmap` on failure.
pub fn unmap_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Reports an unrecoverable mapping failure and aborts.  Callers of
/// the allocator assume success; there is no graceful out-of-memory
/// path to propagate through them.
#[cold]
pub fn die(what: &str, errno: i32) -> ! {
    eprintln!("quarry: {}: errno={}", what, errno);
    std::process::abort();
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // We only develop on platforms with 4K pages.
    assert_eq!(page_size(), 4096);
}

// Map a few pages, touch every byte, and release them.
#[test]
fn smoke_test() {
    let size = 4 * page_size();
    let base = map_region(size).expect("map should succeed");

    let bytes = base.as_ptr() as *mut u8;
    for i in 0..size {
        // Fresh anonymous mappings are zero-filled.
        assert_eq!(unsafe { std::ptr::read(bytes.add(i)) }, 0);
        unsafe { std::ptr::write(bytes.add(i), 0xA5) };
    }

    unmap_region(base, size).expect("unmap should succeed");
}

// Adjacent mappings must be independently releasable.
#[test]
fn test_unmap_pair() {
    let a = map_region(page_size()).expect("map should succeed");
    let b = map_region(page_size()).expect("map should succeed");

    assert_ne!(a.as_ptr(), b.as_ptr());

    unmap_region(a, page_size()).expect("unmap should succeed");
    unmap_region(b, page_size()).expect("unmap should succeed");
}
