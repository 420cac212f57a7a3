//! Buddy-block allocator core.
//!
//! The arena is a single 8 MiB region acquired from the arena provider on
//! first use and partitioned into power-of-two blocks: a block of order `k`
//! spans `BASE_BLOCK << k` bytes, from 128 bytes at order 0 up to the whole
//! arena at order 16. Allocation scans the arena first-fit for a free block
//! of the required order, splitting larger blocks in half as needed; release
//! re-merges buddy pairs bottom-up until a busy neighbor stops it.

use core::mem;
use core::ptr::{self, NonNull};

use crate::api::{AllocError, HeapCore};
use crate::arena::Arena;

/// Smallest block the splitter produces, header included.
pub const BASE_BLOCK: usize = 128;

/// Total arena size. Acquired once, never grown.
pub const ARENA_SIZE: usize = 1 << 23;

/// Order of a block spanning the whole arena.
pub const MAX_ORDER: usize = (ARENA_SIZE / BASE_BLOCK).trailing_zeros() as usize;

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Which half of its parent a block occupies.
///
/// Stored in the header, but also derivable: a block of order `k` at byte
/// offset `o` is a left half iff `o / (BASE_BLOCK << k)` is even.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Side {
    Left = 0,
    Right = 1,
}

/// In-band block metadata.
///
/// Every block in the arena begins with a header; the user region is the
/// rest of the block, starting exactly `HEADER_SIZE` bytes in. Blocks are
/// `BASE_BLOCK`-aligned within the arena, so headers always land at
/// well-aligned addresses.
#[repr(C)]
struct BlockHeader {
    order: u8,
    free: bool,
    side: Side,
}

/// The buddy core.
///
/// Inert until the first allocation, which acquires the arena and formats it
/// as a single free block of order [`MAX_ORDER`].
pub struct BuddyHeap {
    arena: Arena,
    base: *mut u8,
}

// The heap is the sole owner of the arena behind `base`; nothing else
// reaches those bytes except through blocks handed to callers.
unsafe impl Send for BuddyHeap {}

impl BuddyHeap {
    /// A heap over `arena`. `const` so the heap can live in a `static`.
    pub const fn new(arena: Arena) -> Self {
        Self {
            arena,
            base: ptr::null_mut(),
        }
    }

    /// The order whose blocks fit `size` user bytes plus the header.
    fn order_for(size: usize) -> Result<usize, AllocError> {
        let total = size.checked_add(HEADER_SIZE).ok_or(AllocError::SizeTooLarge)?;
        if total <= BASE_BLOCK {
            return Ok(0);
        }
        if total > ARENA_SIZE {
            return Err(AllocError::SizeTooLarge);
        }
        Ok(total.div_ceil(BASE_BLOCK).next_power_of_two().trailing_zeros() as usize)
    }

    /// Acquires and formats the arena on the first call.
    fn ensure_init(&mut self) -> Result<(), AllocError> {
        if !self.base.is_null() {
            return Ok(());
        }
        self.base = self.arena.extend(ARENA_SIZE)?.as_ptr();
        log::debug!("buddy arena initialized: {ARENA_SIZE} bytes at {:p}", self.base);
        unsafe {
            self.header_at(0).write(BlockHeader {
                order: MAX_ORDER as u8,
                free: true,
                side: Side::Left,
            });
        }
        Ok(())
    }

    /// Pointer to the header at `offset` bytes into the arena.
    ///
    /// # Safety
    ///
    /// The arena must be initialized and `offset` must be a block start.
    unsafe fn header_at(&self, offset: usize) -> *mut BlockHeader {
        unsafe { self.base.add(offset).cast() }
    }

    fn offset_of(&self, block: *mut BlockHeader) -> usize {
        block as usize - self.base as usize
    }

    /// The side a block of `order` at `offset` occupies within its parent.
    fn side_for(offset: usize, order: usize) -> Side {
        if (offset / (BASE_BLOCK << order)) % 2 == 0 {
            Side::Left
        } else {
            Side::Right
        }
    }

    /// First-fit scan for a free block of exactly `order`, retried at each
    /// higher order up to [`MAX_ORDER`].
    ///
    /// A block of larger order (busy or free) is skipped whole. A free one
    /// that could be split to satisfy the request is instead found by a
    /// later pass, once the scan order has climbed to match it.
    ///
    /// # Safety
    ///
    /// The arena must be initialized.
    unsafe fn find_block(&self, order: usize) -> Option<*mut BlockHeader> {
        for scan_order in order..=MAX_ORDER {
            let step = BASE_BLOCK << scan_order;
            let mut offset = 0;
            while offset < ARENA_SIZE {
                let block = unsafe { self.header_at(offset) };
                let (block_order, free) = unsafe { ((*block).order as usize, (*block).free) };
                if free && block_order == scan_order {
                    return Some(block);
                }
                if block_order > scan_order {
                    offset += BASE_BLOCK << block_order;
                } else {
                    offset += step;
                }
            }
        }
        None
    }

    /// Halves a free block: it drops one order and becomes the left half,
    /// and a fresh free header for the right half is written at its
    /// midpoint.
    ///
    /// # Safety
    ///
    /// `block` must be a block header of order at least 1.
    unsafe fn split(&mut self, block: *mut BlockHeader) {
        unsafe {
            let new_order = (*block).order - 1;
            (*block).order = new_order;
            (*block).side = Side::Left;
            (*block).free = true;
            let sibling = block
                .cast::<u8>()
                .add(BASE_BLOCK << new_order)
                .cast::<BlockHeader>();
            sibling.write(BlockHeader {
                order: new_order,
                free: true,
                side: Side::Right,
            });
        }
    }

    /// Merges a left block with its (already verified free, equal-order)
    /// right buddy: the order rises by one and the side is recomputed from
    /// the arena offset.
    ///
    /// # Safety
    ///
    /// `block` must be the left half of a pair whose right half is free and
    /// of equal order.
    unsafe fn coalesce(&mut self, block: *mut BlockHeader) {
        unsafe {
            (*block).order += 1;
            (*block).side = Self::side_for(self.offset_of(block), (*block).order as usize);
        }
    }

    /// Allocates `size` user bytes.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let order = Self::order_for(size)?;
        self.ensure_init()?;

        unsafe {
            let Some(block) = self.find_block(order) else {
                log::error!("out of memory: no free block of order {order} or above");
                return Err(AllocError::OutOfMemory);
            };
            // Split down to the requested order, keeping the left half.
            while ((*block).order as usize) > order {
                self.split(block);
            }
            (*block).free = false;
            Ok(NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE)))
        }
    }

    /// Releases the allocation at `ptr` and coalesces buddies bottom-up.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// heap and not have been released since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let mut block = ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>();
            (*block).free = true;

            while (*block).free && ((*block).order as usize) < MAX_ORDER {
                let span = BASE_BLOCK << (*block).order;
                match (*block).side {
                    // Hop to the left half and re-examine the pair from
                    // there.
                    Side::Right => block = block.cast::<u8>().sub(span).cast(),
                    Side::Left => {
                        let right = block.cast::<u8>().add(span).cast::<BlockHeader>();
                        if (*right).free && (*right).order == (*block).order {
                            self.coalesce(block);
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl HeapCore for BuddyHeap {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        BuddyHeap::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { BuddyHeap::deallocate(self, ptr) }
    }

    unsafe fn user_capacity(&self, ptr: NonNull<u8>) -> usize {
        let block = unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>() };
        (BASE_BLOCK << unsafe { (*block).order }) - HEADER_SIZE
    }

    unsafe fn shrink_in_place(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        let Ok(order) = Self::order_for(new_size) else {
            return false;
        };
        unsafe {
            let block = ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>();
            if order > (*block).order as usize {
                return false;
            }
            // Splitting marks the surviving left half free; the caller
            // still owns it, so re-mark it busy.
            while ((*block).order as usize) > order {
                self.split(block);
            }
            (*block).free = false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[derive(Debug)]
    struct BlockInfo {
        offset: usize,
        order: usize,
        free: bool,
        side: Side,
    }

    fn heap() -> BuddyHeap {
        BuddyHeap::new(Arena::emulated(ARENA_SIZE))
    }

    /// Walks every block in the arena, checking the partition, alignment,
    /// side and coalesce-completeness invariants along the way.
    fn blocks(heap: &BuddyHeap) -> Vec<BlockInfo> {
        assert!(!heap.base.is_null(), "arena not initialized");
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < ARENA_SIZE {
            let header = unsafe { &*heap.header_at(offset) };
            let order = header.order as usize;
            assert!(order <= MAX_ORDER, "order {order} out of range at {offset}");
            assert_eq!(
                offset % (BASE_BLOCK << order),
                0,
                "block at {offset} misaligned for order {order}"
            );
            assert_eq!(
                header.side,
                BuddyHeap::side_for(offset, order),
                "stored side disagrees with the offset rule at {offset}"
            );
            blocks.push(BlockInfo {
                offset,
                order,
                free: header.free,
                side: header.side,
            });
            offset += BASE_BLOCK << order;
        }
        assert_eq!(offset, ARENA_SIZE, "blocks do not partition the arena");

        for pair in blocks.windows(2) {
            if pair[0].order == pair[1].order
                && pair[0].side == Side::Left
                && pair[0].free
                && pair[1].free
            {
                panic!("uncoalesced buddies at offset {}", pair[0].offset);
            }
        }
        blocks
    }

    #[test]
    fn order_for_boundary_sizes() {
        assert_eq!(BuddyHeap::order_for(1), Ok(0));
        assert_eq!(BuddyHeap::order_for(BASE_BLOCK - HEADER_SIZE), Ok(0));
        assert_eq!(BuddyHeap::order_for(BASE_BLOCK - HEADER_SIZE + 1), Ok(1));
        assert_eq!(BuddyHeap::order_for(5000), Ok(6));
        assert_eq!(
            BuddyHeap::order_for(ARENA_SIZE - HEADER_SIZE),
            Ok(MAX_ORDER)
        );
        assert_eq!(
            BuddyHeap::order_for(ARENA_SIZE - HEADER_SIZE + 1),
            Err(AllocError::SizeTooLarge)
        );
        assert_eq!(
            BuddyHeap::order_for(usize::MAX),
            Err(AllocError::SizeTooLarge)
        );
    }

    #[test]
    fn first_allocation_leaves_a_spine_of_free_buddies() {
        let mut heap = heap();
        let region = heap.allocate(100).unwrap();
        assert_eq!(region.as_ptr() as usize, heap.base as usize + HEADER_SIZE);

        let blocks = blocks(&heap);
        // One busy order-0 block, then one free right half of every order
        // 0..MAX_ORDER.
        assert_eq!(blocks.len(), MAX_ORDER + 1);
        assert_eq!(blocks[0].order, 0);
        assert!(!blocks[0].free);
        for (i, block) in blocks.iter().enumerate().skip(1) {
            assert!(block.free);
            assert_eq!(block.order, i - 1);
            assert_eq!(block.side, Side::Right);
        }
    }

    #[test]
    fn second_allocation_reuses_the_first_buddy() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + BASE_BLOCK);
        blocks(&heap);
    }

    #[test]
    fn reverse_release_restores_a_single_block() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        unsafe {
            heap.deallocate(b);
            heap.deallocate(a);
        }
        let blocks = blocks(&heap);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].free);
        assert_eq!(blocks[0].order, MAX_ORDER);
    }

    #[test]
    fn mid_sized_request_lands_in_an_order_six_block() {
        let mut heap = heap();
        let region = heap.allocate(5000).unwrap();
        unsafe {
            let header = region.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>();
            assert_eq!((*header).order, 6);
            assert!(!(*header).free);
        }
        blocks(&heap);

        unsafe { heap.deallocate(region) };
        let blocks = blocks(&heap);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].free);
        assert_eq!(blocks[0].order, MAX_ORDER);
    }

    #[test]
    fn live_regions_hold_their_bytes() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(3000).unwrap();
        let c = heap.allocate(100).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x11, 100);
            b.as_ptr().write_bytes(0x22, 3000);
            c.as_ptr().write_bytes(0x33, 100);
            for i in 0..100 {
                assert_eq!(*a.as_ptr().add(i), 0x11);
                assert_eq!(*c.as_ptr().add(i), 0x33);
            }
            for i in 0..3000 {
                assert_eq!(*b.as_ptr().add(i), 0x22);
            }
        }
        blocks(&heap);
    }

    #[test]
    fn requests_beyond_the_top_order_fail() {
        let mut heap = heap();
        assert_eq!(heap.allocate(ARENA_SIZE), Err(AllocError::SizeTooLarge));
    }

    #[test]
    fn exhausted_arena_reports_out_of_memory() {
        let mut heap = heap();
        let whole = heap.allocate(ARENA_SIZE - HEADER_SIZE).unwrap();
        assert_eq!(heap.allocate(1), Err(AllocError::OutOfMemory));
        unsafe { heap.deallocate(whole) };
        assert!(heap.allocate(1).is_ok());
    }

    #[test]
    fn arena_acquisition_failure_is_out_of_memory() {
        // An arena too small for the fixed heap size refuses the initial
        // extension.
        let mut heap = BuddyHeap::new(Arena::emulated(BASE_BLOCK));
        assert_eq!(heap.allocate(1), Err(AllocError::OutOfMemory));
    }

    quickcheck! {
        fn random_interleavings_keep_the_arena_partitioned(ops: Vec<(bool, usize)>) -> bool {
            let mut heap = heap();
            let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
            for (release, size) in ops {
                if release && !live.is_empty() {
                    let (region, _) = live.swap_remove(size % live.len());
                    unsafe { heap.deallocate(region) };
                } else {
                    let size = size % 4096 + 1;
                    if let Ok(region) = heap.allocate(size) {
                        unsafe { region.as_ptr().write_bytes(0xAB, size) };
                        live.push((region, size));
                    }
                }
                if !heap.base.is_null() {
                    blocks(&heap);
                }
            }
            // No two live regions may overlap.
            for i in 0..live.len() {
                for j in (i + 1)..live.len() {
                    let (a, a_size) = (live[i].0.as_ptr() as usize, live[i].1);
                    let (b, b_size) = (live[j].0.as_ptr() as usize, live[j].1);
                    if a < b + b_size && b < a + a_size {
                        return false;
                    }
                }
            }
            true
        }
    }
}
