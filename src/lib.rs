//! General purpose memory allocator built on the binary buddy system.
//!
//! All memory is carved out of a single contiguous arena whose size is a
//! power of two. Blocks are split in halves to satisfy reservations and
//! merged with their buddy again on release, which keeps fragmentation
//! low without a separate compaction step. Every block carries a small
//! in-band header, so a reservation consumes the smallest power-of-two
//! block that fits the request plus the header.
//!
//! The engine is available in two shapes: [`BuddyAllocator`] owns its
//! own arena and can be instantiated freely, while the functions at the
//! crate root manage one process-wide arena behind a lock, created on
//! the first reservation (or explicitly via [`init`]) and kept until the
//! process exits.
//!
//! ```
//! use buddy_heap::BuddyAllocator;
//!
//! let mut pool = BuddyAllocator::new(1 << 20)?;
//! let ptr = pool.allocate(128)?;
//! unsafe { pool.deallocate(ptr.as_ptr()) };
//! # Ok::<(), buddy_heap::Error>(())
//! ```

#![deny(rust_2018_idioms)]

pub mod buddy;

mod header;
mod linked_list;

pub use buddy::{
    BuddyAllocator, DEFAULT_ARENA_SIZE, MAX_ARENA_SIZE, MAX_ORDER, MIN_ORDER,
};

use core::{fmt, ptr::NonNull};
use displaydoc_lite::displaydoc;
use errno::Errno;
use spin::Mutex;

/// Result for every memory allocation operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// POSIX error code reported on every failure path.
pub(crate) const ENOMEM: Errno = Errno(12);

displaydoc! {
    /// Any error that can happen while reserving or releasing memory.
    #[derive(Debug)]
    pub enum Error {
        /// the requested arena size exceeds the supported maximum.
        ArenaTooLarge,
        /// the arena cannot hold a single block header.
        ArenaTooSmall,
        /// the operating system refused to map the arena.
        MapFailed,
        /// no free block large enough to satisfy the request.
        NoMemoryAvailable,
    }
}

/// Statistics for a memory allocator.
#[derive(Debug, Clone)]
pub struct AllocStats {
    /// The name of the allocator that collected these stats.
    pub name: &'static str,
    /// The number of bytes that are currently reserved.
    pub allocated: usize,
    /// The number of bytes that are left for reservation.
    pub free: usize,
    /// The total number of bytes this allocator manages.
    pub total: usize,
}

impl AllocStats {
    /// Create a new [`AllocStats`] instance for the given allocator name.
    pub const fn with_name(name: &'static str) -> Self {
        Self {
            name,
            allocated: 0,
            free: 0,
            total: 0,
        }
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} of {} bytes reserved, {} free",
            self.name, self.allocated, self.total, self.free
        )
    }
}

/// The process-wide allocator behind the crate root functions.
static ALLOCATOR: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

/// Creates the process-wide arena with room for at least `size` bytes
/// (`0` selects the 512 MiB default).
///
/// The arena is created once and lives until the process exits; calling
/// `init` again is a no-op, even with a different size.
pub fn init(size: usize) -> Result<()> {
    let mut guard = ALLOCATOR.lock();
    if guard.is_none() {
        *guard = Some(BuddyAllocator::new(size)?);
    }
    Ok(())
}

/// Reserves at least `size` bytes from the process-wide arena.
///
/// If [`init`] has not been called yet, the default-size arena is
/// created first.
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
    lock_or_init()?
        .as_mut()
        .expect("the allocator was just initialized")
        .allocate(size)
}

/// Releases a block reserved from the process-wide arena.
///
/// A null pointer, or a release before the arena exists, is ignored.
///
/// # Safety
///
/// `ptr` must be null or a payload pointer previously returned by the
/// crate root functions and not released since.
pub unsafe fn deallocate(ptr: *mut u8) {
    if let Some(alloc) = ALLOCATOR.lock().as_mut() {
        alloc.deallocate(ptr);
    }
}

/// Resizes a block reserved from the process-wide arena.
///
/// # Safety
///
/// Same contract as [`deallocate`] for `ptr`.
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> Result<*mut u8> {
    lock_or_init()?
        .as_mut()
        .expect("the allocator was just initialized")
        .reallocate(ptr, size)
}

/// Reserves `count * elem` zeroed bytes from the process-wide arena.
pub fn allocate_zeroed(count: usize, elem: usize) -> Result<NonNull<u8>> {
    lock_or_init()?
        .as_mut()
        .expect("the allocator was just initialized")
        .allocate_zeroed(count, elem)
}

/// Logs the free-list table of the process-wide arena through
/// [`log::debug!`]. Does nothing before the arena exists.
pub fn dump_free_lists() {
    if let Some(alloc) = ALLOCATOR.lock().as_ref() {
        log::debug!("{}", alloc.free_lists());
    }
}

/// Returns the statistics of the process-wide arena, if it exists.
pub fn stats() -> Option<AllocStats> {
    ALLOCATOR.lock().as_ref().map(BuddyAllocator::stats)
}

/// Locks the process-wide allocator, creating the default arena first
/// if no [`init`] call has happened yet.
fn lock_or_init() -> Result<spin::MutexGuard<'static, Option<BuddyAllocator>>> {
    let mut guard = ALLOCATOR.lock();
    if guard.is_none() {
        *guard = Some(BuddyAllocator::new(0)?);
    }
    Ok(guard)
}

/// Drops the process-wide arena so every test starts from a clean slate.
#[cfg(test)]
pub(crate) fn reset() {
    *ALLOCATOR.lock() = None;
}
