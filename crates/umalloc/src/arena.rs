//! Arena acquisition from the operating system.
//!
//! Both allocator cores carve their blocks out of a single contiguous arena
//! obtained through [`Arena::extend`]. The arena only ever grows: every
//! extension is appended directly after the previous one and nothing is
//! handed back to the OS.
//!
//! Two backings exist. The real one moves the program break with `sbrk`, the
//! way the classic Unix allocators do. The emulated one serves tests from a
//! fixed in-process buffer, which makes exhaustion and contiguity observable
//! without touching the process data segment.

use core::ptr::NonNull;

use crate::AllocError;

#[cfg(any(test, feature = "emulated-arena"))]
use alloc::vec::Vec;
#[cfg(any(test, feature = "emulated-arena"))]
use core::mem;

/// A contiguous, monotonically growing region of raw memory.
pub struct Arena {
    backing: Backing,
}

enum Backing {
    /// Extends the process data segment through `sbrk`.
    ProgramBreak,
    /// Fixed-capacity in-process buffer for tests.
    #[cfg(any(test, feature = "emulated-arena"))]
    Emulated(EmulatedArena),
}

impl Arena {
    /// An arena backed by the program break.
    ///
    /// Nothing is reserved until the first [`extend`](Self::extend) call, so
    /// this is usable in `static` initializers.
    pub const fn program_break() -> Self {
        Self {
            backing: Backing::ProgramBreak,
        }
    }

    /// An arena backed by an in-process buffer of `capacity` bytes.
    ///
    /// Extensions beyond `capacity` fail with [`AllocError::OutOfMemory`],
    /// which is how OS-refusal paths become testable.
    #[cfg(any(test, feature = "emulated-arena"))]
    pub fn emulated(capacity: usize) -> Self {
        Self {
            backing: Backing::Emulated(EmulatedArena::new(capacity)),
        }
    }

    /// Reserves `n` more bytes and returns the base of the new region.
    ///
    /// Each extension begins exactly where the previous one ended, provided
    /// nothing else moves the program break between calls.
    pub fn extend(&mut self, n: usize) -> Result<NonNull<u8>, AllocError> {
        // An increment above isize::MAX would wrap sbrk's argument negative
        // and shrink the break instead.
        if n > isize::MAX as usize {
            return Err(AllocError::OutOfMemory);
        }
        match &mut self.backing {
            Backing::ProgramBreak => {
                // sbrk returns the old break on success and (void*)-1 on
                // failure.
                let prev = unsafe { libc::sbrk(n as libc::intptr_t) };
                if prev == usize::MAX as *mut libc::c_void {
                    log::error!("sbrk refused to extend the arena by {n} bytes");
                    return Err(AllocError::OutOfMemory);
                }
                NonNull::new(prev.cast()).ok_or(AllocError::OutOfMemory)
            }
            #[cfg(any(test, feature = "emulated-arena"))]
            Backing::Emulated(region) => region.extend(n),
        }
    }
}

/// In-process stand-in for the program break.
///
/// A bump offset over a preallocated buffer. The buffer is `u64`-backed so
/// every extension is handed out word-aligned, the way a fresh program break
/// is.
#[cfg(any(test, feature = "emulated-arena"))]
struct EmulatedArena {
    memory: Vec<u64>,
    brk: usize,
}

#[cfg(any(test, feature = "emulated-arena"))]
impl EmulatedArena {
    fn new(capacity: usize) -> Self {
        Self {
            memory: alloc::vec![0u64; capacity.div_ceil(mem::size_of::<u64>())],
            brk: 0,
        }
    }

    fn extend(&mut self, n: usize) -> Result<NonNull<u8>, AllocError> {
        let capacity = self.memory.len() * mem::size_of::<u64>();
        if n > capacity - self.brk {
            log::error!(
                "emulated arena exhausted: {} of {capacity} bytes in use, {n} more requested",
                self.brk
            );
            return Err(AllocError::OutOfMemory);
        }
        // The buffer never reallocates, so regions handed out earlier stay
        // valid and contiguous with this one.
        let base = unsafe { self.memory.as_mut_ptr().cast::<u8>().add(self.brk) };
        self.brk += n;
        NonNull::new(base).ok_or(AllocError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulated_extensions_are_contiguous() {
        let mut arena = Arena::emulated(256);
        let a = arena.extend(64).unwrap();
        let b = arena.extend(32).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 64);
    }

    #[test]
    fn emulated_regions_are_writable() {
        let mut arena = Arena::emulated(128);
        let region = arena.extend(128).unwrap();
        unsafe {
            region.as_ptr().write_bytes(0x5A, 128);
            assert_eq!(*region.as_ptr(), 0x5A);
            assert_eq!(*region.as_ptr().add(127), 0x5A);
        }
    }

    #[test]
    fn emulated_arena_exhausts() {
        let mut arena = Arena::emulated(64);
        arena.extend(48).unwrap();
        assert_eq!(arena.extend(32), Err(AllocError::OutOfMemory));
        // A smaller request still fits in what is left.
        assert!(arena.extend(16).is_ok());
    }

    #[test]
    fn program_break_extends_monotonically() {
        let mut arena = Arena::program_break();
        let a = arena.extend(128).unwrap();
        unsafe { a.as_ptr().write_bytes(0xA5, 128) };
        let b = arena.extend(128).unwrap();
        // Something else in the process may move the break between the two
        // calls, so only monotonicity is asserted.
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 128);
        unsafe { assert_eq!(*a.as_ptr(), 0xA5) };
    }
}
