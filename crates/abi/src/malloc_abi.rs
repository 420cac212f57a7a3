//! The `malloc`/`free`/`calloc`/`realloc` entry points.
//!
//! All four dispatch through one global [`LockedHeap`] over the core picked
//! at build time. Failure is reported the only way the C contract knows: a
//! null return.

use core::ffi::c_void;
use core::ptr;

use umalloc::{Arena, Heap, LockedHeap};

#[cfg(feature = "buddy")]
type Core = umalloc::BuddyHeap;

#[cfg(all(feature = "free-list", not(feature = "buddy")))]
type Core = umalloc::FreeListHeap;

static HEAP: LockedHeap<Core> = LockedHeap::new(Heap::new(Core::new(Arena::program_break())));

/// `malloc(3)`: allocates `size` bytes of uninitialized memory.
///
/// Returns null when `size` is zero or no memory is available.
///
/// # Safety
///
/// The returned pointer must be released through [`free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    match HEAP.lock().allocate(size) {
        Ok(region) => region.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// `free(3)`: releases memory returned by [`malloc`], [`calloc`] or
/// [`realloc`]. Null is a no-op.
///
/// # Safety
///
/// A non-null `ptr` must have come from this allocator and must not have
/// been released already.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { HEAP.lock().deallocate(ptr.cast()) };
}

/// `calloc(3)`: allocates a zero-filled array of `nmemb` elements of `size`
/// bytes each.
///
/// Returns null when the total is zero, overflows, or cannot be served.
///
/// # Safety
///
/// The returned pointer must be released through [`free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    match HEAP.lock().allocate_zeroed(nmemb, size) {
        Ok(region) => region.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// `realloc(3)`: resizes the allocation at `ptr` to `size` bytes.
///
/// Null `ptr` behaves like [`malloc`]; a zero `size` releases `ptr` and
/// returns null. On failure the original allocation is untouched and null
/// comes back.
///
/// # Safety
///
/// A non-null `ptr` must have come from this allocator and must not have
/// been released since.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match unsafe { HEAP.lock().reallocate(ptr.cast(), size) } {
        Ok(region) => region.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}
