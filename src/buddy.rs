//! Implementation of the buddy-system allocation engine.
//!
//! The arena is a single anonymous mapping whose size is a power of two.
//! Every block starts with an in-band [`BlockHeader`]; free blocks of
//! order `k` sit on a circular list anchored at the `k`-th slot of the
//! sentinel table. Reserving detaches the smallest satisfying block and
//! splits its right halves down to the target order; releasing walks the
//! buddy chain upwards, merging as long as the buddy is a free block of
//! the same order.

use crate::{
    header::{BlockHeader, Tag, HEADER_SIZE},
    linked_list::{self, FreeList},
    AllocStats, Error, Result, ENOMEM,
};
use core::{array, cmp, fmt, ptr, ptr::NonNull};
use errno::set_errno;
use log::debug;
use memmap2::MmapMut;

/// Number of slots in the sentinel table, and the exclusive upper bound
/// on block orders.
pub const MAX_ORDER: usize = 37;

/// Largest arena the table supports: `2^(MAX_ORDER - 1)` bytes.
pub const MAX_ARENA_SIZE: usize = 1 << (MAX_ORDER - 1);

/// Arena size used when [`BuddyAllocator::new`] is asked for size `0`.
pub const DEFAULT_ARENA_SIZE: usize = 512 * 1024 * 1024;

/// Smallest order a block can ever have: its block must hold the header
/// plus at least one payload byte.
pub const MIN_ORDER: usize = order_for_size(HEADER_SIZE + 1);

/// Calculates the size in bytes of a block of the given order.
pub const fn size_for_order(order: usize) -> usize {
    1 << order
}

/// Calculates the smallest order whose block holds `size` bytes.
///
/// Sizes too large for any power of two map to `usize::BITS`, which is
/// past every order the table can hold, so oversized requests fall out
/// through the ordinary capacity checks.
pub const fn order_for_size(size: usize) -> usize {
    match size.checked_next_power_of_two() {
        Some(size) => size.trailing_zeros() as usize,
        None => usize::BITS as usize,
    }
}

/// Calculates the address of the buddy of the block at `block`.
///
/// The two halves of a split differ exactly in bit `order` of their
/// offset from the arena base.
fn buddy_of(base: usize, block: usize, order: usize) -> usize {
    base + ((block - base) ^ size_for_order(order))
}

/// The central structure that is responsible for allocating memory using
/// the buddy allocation algorithm.
///
/// Every allocator owns its arena; dropping it unmaps the memory and
/// invalidates all payload pointers handed out from it.
pub struct BuddyAllocator {
    arena: MmapMut,
    /// Order `m` of the arena: the mapping spans `2^m` bytes.
    order: usize,
    /// Sentinel table: `avail[k]` anchors the circular list of free
    /// order-`k` blocks. Boxed so the sentinels keep their addresses
    /// when the allocator value itself moves.
    avail: Box<[BlockHeader; MAX_ORDER]>,
    stats: AllocStats,
}

// The raw link pointers only ever reference the arena and the boxed
// sentinel table, both owned by this value.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Acquires a fresh arena of at least `size` bytes from the operating
    /// system and seeds the free-list table with the single arena-wide
    /// block.
    ///
    /// A `size` of `0` selects the default of 512 MiB; anything else is
    /// rounded up to the next power of two before the mapping is created.
    pub fn new(size: usize) -> Result<Self> {
        if size > MAX_ARENA_SIZE {
            set_errno(ENOMEM);
            return Err(Error::ArenaTooLarge);
        }

        let size = if size == 0 {
            DEFAULT_ARENA_SIZE
        } else {
            size_for_order(order_for_size(size))
        };
        let order = order_for_size(size);
        if order < MIN_ORDER {
            set_errno(ENOMEM);
            return Err(Error::ArenaTooSmall);
        }

        let mut arena = MmapMut::map_anon(size).map_err(|_| {
            set_errno(ENOMEM);
            Error::MapFailed
        })?;

        let mut avail: Box<[BlockHeader; MAX_ORDER]> =
            Box::new(array::from_fn(|k| BlockHeader::sentinel(k as u16)));
        for slot in avail.iter_mut() {
            let sentinel = slot as *mut BlockHeader;
            slot.next = sentinel;
            slot.prev = sentinel;
        }

        // install the whole arena as the sole free block of order `m`
        let base = arena.as_mut_ptr() as *mut BlockHeader;
        unsafe {
            ptr::write(
                base,
                BlockHeader {
                    tag: Tag::Free,
                    order: order as u16,
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                },
            );
            FreeList::from_sentinel(&mut avail[order]).push(base);
        }

        debug!(
            "mapped a {} byte arena of order {} at {:p}",
            size,
            order,
            arena.as_ptr()
        );

        let mut stats = AllocStats::with_name("BuddyAllocator");
        stats.free = size;
        stats.total = size;

        Ok(Self {
            arena,
            order,
            avail,
            stats,
        })
    }

    /// Reserves a block with room for at least `size` bytes and returns
    /// the pointer to its payload.
    ///
    /// The reservation takes a whole block of the smallest order that
    /// fits `size` plus the in-band header, so the usable region may be
    /// larger than requested. Payloads are 8-byte aligned.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let total = match size.checked_add(HEADER_SIZE) {
            Some(total) => total,
            None => {
                set_errno(ENOMEM);
                return Err(Error::NoMemoryAvailable);
            }
        };

        let order = order_for_size(total);
        if order > self.order {
            set_errno(ENOMEM);
            return Err(Error::NoMemoryAvailable);
        }

        // find the smallest order at or above the target that has a
        // free block; nothing is touched until one is found
        let mut found = None;
        for k in order..=self.order {
            if !self.list(k).is_empty() {
                found = Some(k);
                break;
            }
        }
        let found = match found {
            Some(k) => k,
            None => {
                set_errno(ENOMEM);
                return Err(Error::NoMemoryAvailable);
            }
        };

        unsafe {
            let block = self
                .list(found)
                .pop()
                .expect("a free block must exist at the found order");
            (*block).tag = Tag::Reserved;
            (*block).order = order as u16;

            // chop the right half off until the block has the target order
            let mut j = found;
            while j > order {
                j -= 1;
                let buddy = (block as *mut u8).add(size_for_order(j)) as *mut BlockHeader;
                ptr::write(
                    buddy,
                    BlockHeader {
                        tag: Tag::Free,
                        order: j as u16,
                        next: ptr::null_mut(),
                        prev: ptr::null_mut(),
                    },
                );
                self.list(j).push(buddy);
            }

            self.stats_on_reserve(size_for_order(order));
            Ok(NonNull::new_unchecked(BlockHeader::payload(block)))
        }
    }

    /// Releases the block whose payload `ptr` points at.
    ///
    /// A null `ptr` is ignored. The freed block is merged with its buddy
    /// as long as the buddy is itself a free block of the same order;
    /// the merged block then lands at the head of its order's list.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer previously returned by
    /// this allocator and not released since. Anything else is undefined
    /// behavior; the allocator does not validate.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let mut block = BlockHeader::from_payload(ptr);
        let mut order = (*block).order as usize;
        let base = self.arena.as_mut_ptr() as usize;

        self.stats_on_release(size_for_order(order));

        while order < self.order {
            let buddy = buddy_of(base, block as usize, order) as *mut BlockHeader;

            // the buddy can only be merged while it is free and not
            // itself split into smaller blocks
            if (*buddy).tag != Tag::Free || (*buddy).order as usize != order {
                break;
            }

            linked_list::unlink(buddy);
            block = cmp::min(block, buddy);
            order += 1;
        }

        (*block).tag = Tag::Free;
        (*block).order = order as u16;
        self.list(order).push(block);
    }

    /// Resizes the block whose payload `ptr` points at to hold at least
    /// `size` bytes.
    ///
    /// A null `ptr` reserves a fresh block, a `size` of zero releases the
    /// block and returns null, and the combination of both fails. When
    /// the new size maps to the block's current order the pointer is
    /// returned unchanged; otherwise the payload is moved into a fresh
    /// block and survives up to what both blocks can hold.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate) for `ptr`.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Result<*mut u8> {
        if ptr.is_null() && size == 0 {
            set_errno(ENOMEM);
            return Err(Error::NoMemoryAvailable);
        }
        if ptr.is_null() {
            return self.allocate(size).map(NonNull::as_ptr);
        }
        if size == 0 {
            self.deallocate(ptr);
            return Ok(ptr::null_mut());
        }

        let block = BlockHeader::from_payload(ptr);
        let old_order = (*block).order as usize;
        let same_order = size
            .checked_add(HEADER_SIZE)
            .map_or(false, |total| order_for_size(total) == old_order);
        if same_order {
            return Ok(ptr);
        }

        let new = self.allocate(size)?.as_ptr();
        let old_payload = size_for_order(old_order) - HEADER_SIZE;
        ptr::copy_nonoverlapping(ptr, new, cmp::min(size, old_payload));
        self.deallocate(ptr);
        Ok(new)
    }

    /// Reserves `count * elem` bytes and clears them to zero.
    pub fn allocate_zeroed(&mut self, count: usize, elem: usize) -> Result<NonNull<u8>> {
        let total = match count.checked_mul(elem) {
            Some(total) => total,
            None => {
                set_errno(ENOMEM);
                return Err(Error::NoMemoryAvailable);
            }
        };

        let ptr = self.allocate(total)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Order `m` of the arena.
    pub fn arena_order(&self) -> usize {
        self.order
    }

    /// Size of the arena in bytes: `2^m`.
    pub fn arena_size(&self) -> usize {
        size_for_order(self.order)
    }

    /// Returns a copy of the statistics for this allocator.
    pub fn stats(&self) -> AllocStats {
        self.stats.clone()
    }

    /// Returns a displayable walk over the free-list table.
    pub fn free_lists(&self) -> FreeListDump<'_> {
        FreeListDump { alloc: self }
    }

    fn list(&mut self, order: usize) -> FreeList {
        unsafe { FreeList::from_sentinel(&mut self.avail[order]) }
    }

    fn stats_on_reserve(&mut self, size: usize) {
        self.stats.free = self.stats.free.saturating_sub(size);
        self.stats.allocated = self.stats.allocated.saturating_add(size);
    }

    fn stats_on_release(&mut self, size: usize) {
        self.stats.free = self.stats.free.saturating_add(size);
        self.stats.allocated = self.stats.allocated.saturating_sub(size);
    }
}

/// Human-readable walk over the free-list table.
///
/// One line per order from `0` to `m`: the sentinel address followed by
/// each free block's tag, order and successor, and a trailing count of
/// all FREE entries encountered. Purely observational.
pub struct FreeListDump<'alloc> {
    alloc: &'alloc BuddyAllocator,
}

impl fmt::Display for FreeListDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut free_blocks = 0;

        for order in 0..=self.alloc.order {
            let sentinel = &self.alloc.avail[order] as *const BlockHeader;
            write!(f, "List {}: head = {:p}", order, sentinel)?;

            // the dump only reads, so the list view never writes through
            // this pointer
            let list = unsafe { FreeList::from_sentinel(sentinel as *mut BlockHeader) };
            for block in list.iter() {
                let header = unsafe { &*block };
                if header.tag == Tag::Free {
                    free_blocks += 1;
                }
                write!(
                    f,
                    " --> [tag={:?}, order={}, next={:p}]",
                    header.tag, header.order, header.next
                )?;
            }
            writeln!(f, " --> <end>")?;
        }

        writeln!(f, "free blocks: {}", free_blocks)
    }
}

#[cfg(test)]
impl BuddyAllocator {
    /// Offsets from the arena base of the free blocks of the given order.
    fn free_offsets(&self, order: usize) -> Vec<usize> {
        let base = self.arena.as_ptr() as usize;
        let sentinel = &self.avail[order] as *const BlockHeader;

        let list = unsafe { FreeList::from_sentinel(sentinel as *mut BlockHeader) };
        list.iter().map(|block| block as usize - base).collect()
    }

    fn free_count(&self, order: usize) -> usize {
        self.free_offsets(order).len()
    }

    /// Snapshot of every order's free offsets, for exact comparisons.
    fn free_snapshot(&self) -> Vec<Vec<usize>> {
        (0..=self.order).map(|k| self.free_offsets(k)).collect()
    }

    fn base(&self) -> usize {
        self.arena.as_ptr() as usize
    }
}
