//! C allocator ABI over a process-global heap.
//!
//! Building this crate as a `cdylib` produces a library that replaces the
//! platform allocator through dynamic link preloading. One core backs the
//! whole process; which one is fixed when the library is built:
//!
//! - `free-list` (default): the growing free-list core.
//! - `buddy`: the fixed-arena buddy core. Wins when both features end up
//!   enabled in the same build.
//!
//! The exports are compiled out of `cfg(test)` builds, since a test binary
//! that defined `malloc` would interpose on its own harness's allocations.

#[cfg(not(any(feature = "buddy", feature = "free-list")))]
compile_error!("select an allocator core: enable the `buddy` or `free-list` feature");

#[cfg(not(test))]
mod malloc_abi;
