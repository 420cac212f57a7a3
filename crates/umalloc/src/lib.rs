#![cfg_attr(not(any(test, feature = "emulated-arena")), no_std)]

//! # umalloc
//!
//! A user-space dynamic memory allocator in the mold of the classic
//! `sbrk`-backed C allocators. Two interchangeable cores implement the same
//! placement and reclamation contract over in-band block headers:
//!
//! - [`BuddyHeap`]: power-of-two splitting and coalescing over a fixed
//!   8 MiB arena.
//! - [`FreeListHeap`]: first-fit over an address-ordered free list, with a
//!   monotonically growing arena.
//!
//! [`Heap`] layers the standard `malloc`/`free`/`calloc`/`realloc` semantics
//! on top of either core, and [`LockedHeap`] makes a heap usable as
//! process-global state. The `emulated-arena` feature swaps the program
//! break for an in-process buffer so the whole crate is testable on any
//! host.

#[cfg(any(test, feature = "emulated-arena"))]
extern crate alloc;

mod api;
mod arena;
mod buddy;
mod free_list;

pub use api::{AllocError, Heap, HeapCore, LockedHeap};
pub use arena::Arena;
pub use buddy::BuddyHeap;
pub use free_list::FreeListHeap;
