//! The in-band header that prefixes every block in the arena.

use core::{mem, ptr};

/// Marks what a header currently is: a block handed out to a caller, a
/// block sitting on one of the per-order free lists, or a sentinel slot
/// of the order table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Tag {
    Reserved = 0,
    Free = 1,
    Sentinel = -1,
}

/// Header that lives at the start of every block.
///
/// Reserved blocks only carry `tag` and `order`; for free blocks and
/// sentinels the link fields form a circular doubly-linked list that is
/// anchored at the sentinel of the block's order.
#[repr(C)]
pub struct BlockHeader {
    pub tag: Tag,
    pub order: u16,
    pub next: *mut BlockHeader,
    pub prev: *mut BlockHeader,
}

/// Size of the in-band header. The payload of a reserved block starts
/// immediately after it.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

impl BlockHeader {
    /// Creates an unlinked sentinel for the given order.
    ///
    /// The link fields start out null; the free-list table points them
    /// back at the sentinel itself once the slot has its final address.
    pub fn sentinel(order: u16) -> Self {
        Self {
            tag: Tag::Sentinel,
            order,
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    /// Returns the pointer to the payload of the block at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a block inside the arena, so the address
    /// past the header is still in bounds.
    pub unsafe fn payload(header: *mut BlockHeader) -> *mut u8 {
        (header as *mut u8).add(HEADER_SIZE)
    }

    /// Recovers the header of the block whose payload `payload` points at.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by [`BlockHeader::payload`].
    pub unsafe fn from_payload(payload: *mut u8) -> *mut BlockHeader {
        payload.sub(HEADER_SIZE) as *mut BlockHeader
    }
}
