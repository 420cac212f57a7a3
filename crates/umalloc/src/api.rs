//! Entry-point semantics shared by both allocator cores.
//!
//! The cores implement [`HeapCore`] (placement and reclamation over their
//! own block layout) and [`Heap`] layers the standard allocator contract on
//! top: degenerate sizes, null pointers, zeroed allocation and resizing.

use core::cmp;
use core::ops;
use core::ptr::{self, NonNull};

/// Errors surfaced by the allocation entry points.
///
/// Nothing is retried and nothing panics; the C ABI reports every variant as
/// a null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block satisfies the request and the arena cannot grow.
    OutOfMemory,
    /// The request can never be satisfied by this core: a buddy request
    /// above the top order, or a size computation that overflowed.
    SizeTooLarge,
    /// Zero-sized requests are answered with a null pointer by contract.
    ZeroSize,
}

/// A placement and reclamation engine over in-band block headers.
///
/// Implementations hand out user regions that start exactly one header past
/// the block start and recover the header from the user pointer by that
/// fixed displacement.
pub trait HeapCore {
    /// Finds (or carves) a block for `size` bytes and returns its user
    /// region, marked busy.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Returns `ptr`'s block to the allocator, coalescing where the core
    /// permits.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// core and not have been released since.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// The usable size of `ptr`'s block, which may exceed the size it was
    /// requested with.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate).
    unsafe fn user_capacity(&self, ptr: NonNull<u8>) -> usize;

    /// Shrinks `ptr`'s block to `new_size` without moving it. Returns
    /// whether the block now accommodates `new_size` in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate).
    unsafe fn shrink_in_place(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool;
}

/// The standard allocation API over a chosen core.
pub struct Heap<C> {
    core: C,
}

impl<C: HeapCore> Heap<C> {
    /// Wraps a core. `const` so a heap can live in a `static`.
    pub const fn new(core: C) -> Self {
        Self { core }
    }

    /// Allocates `size` bytes.
    ///
    /// `size == 0` yields [`AllocError::ZeroSize`], which callers report as
    /// null.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        self.core.allocate(size)
    }

    /// Releases `ptr`. Null is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have come from this heap and not have been
    /// released since.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.core.deallocate(ptr) };
        }
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes
    /// each.
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::SizeTooLarge)?;
        let region = self.allocate(total)?;
        // Zero exactly what was asked for; any slack the core rounded up to
        // keeps whatever it held.
        unsafe { ptr::write_bytes(region.as_ptr(), 0, total) };
        Ok(region)
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// Null grows from nothing like [`allocate`](Self::allocate); a zero
    /// `new_size` releases `ptr` and reports [`AllocError::ZeroSize`]. The
    /// block is shrunk in place whenever the core supports it, in which case
    /// the pointer comes back unchanged. Otherwise the contents move to a
    /// fresh block and the old one is released. When no fresh block can be
    /// had, the old block stays live and untouched.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have come from this heap and not have been
    /// released since.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            unsafe { self.core.deallocate(old) };
            return Err(AllocError::ZeroSize);
        }
        if unsafe { self.core.shrink_in_place(old, new_size) } {
            return Ok(old);
        }

        let new = self.core.allocate(new_size)?;
        unsafe {
            let keep = cmp::min(self.core.user_capacity(old), new_size);
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), keep);
            self.core.deallocate(old);
        }
        Ok(new)
    }
}

/// A heap behind a spinlock, for use as process-global state.
pub struct LockedHeap<C>(spin::Mutex<Heap<C>>);

impl<C: HeapCore> LockedHeap<C> {
    /// Wraps a heap in a lock. `const` so the result can be a `static`.
    pub const fn new(heap: Heap<C>) -> Self {
        Self(spin::Mutex::new(heap))
    }
}

impl<C> ops::Deref for LockedHeap<C> {
    type Target = spin::Mutex<Heap<C>>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
