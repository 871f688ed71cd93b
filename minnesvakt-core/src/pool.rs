//! ## minnesvakt-core::pool
//! **Fixed-block memory pool with block-granular reuse**
//!
//! One contiguous arena divided into equal-size blocks, handed out from a
//! LIFO free-list so allocation and release touch no system allocator.
//! Misuse (double free, foreign or misaligned addresses) is detected,
//! warned about, and discarded without corrupting the free-list.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::MemoryError;

/// Alignment of the arena start. Every block address is guaranteed aligned
/// to `gcd(ARENA_ALIGN, block_size)`.
pub const ARENA_ALIGN: usize = 16;

struct PoolInner {
    /// LIFO stack of free block addresses.
    free_list: Vec<usize>,
    /// Per-block free flag, indexed by block number; detects double frees
    /// without scanning the free-list.
    free_flags: Box<[bool]>,
    /// Bytes currently checked out, always a multiple of the block size.
    used: usize,
}

/// Preallocated arena of `pool_size` bytes divided into
/// `pool_size / block_size` fixed blocks.
///
/// Remainder bytes past the last whole block belong to no block and are
/// never handed out. The pool is not cloneable; its arena identity is
/// unique. Dropping the pool releases the arena unconditionally, so any
/// still-checked-out block must not outlive the pool.
pub struct BlockPool {
    arena: NonNull<u8>,
    arena_layout: Layout,
    block_size: usize,
    pool_size: usize,
    num_blocks: usize,
    /// Guaranteed alignment of every block start address.
    block_align: usize,
    inner: Mutex<PoolInner>,
}

// SAFETY: the arena pointer is exclusively owned by the pool, and all
// mutable state behind it is guarded by the inner mutex.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Allocates one arena and populates the free-list with every block
    /// start address.
    ///
    /// Fails with [`MemoryError::OutOfMemory`] if the arena cannot be
    /// obtained.
    pub fn new(block_size: usize, pool_size: usize) -> Result<Self, MemoryError> {
        assert!(block_size > 0, "Block size must be greater than zero");
        assert!(pool_size > 0, "Pool size must be greater than zero");

        let arena_layout = Layout::from_size_align(pool_size, ARENA_ALIGN)
            .map_err(|_| MemoryError::OutOfMemory)?;
        // SAFETY: arena_layout has non-zero size.
        let arena =
            NonNull::new(unsafe { alloc(arena_layout) }).ok_or(MemoryError::OutOfMemory)?;

        let num_blocks = pool_size / block_size;
        let base = arena.as_ptr() as usize;
        let free_list = (0..num_blocks).map(|i| base + i * block_size).collect();

        debug!(num_blocks, block_size, "memory pool created");

        Ok(Self {
            arena,
            arena_layout,
            block_size,
            pool_size,
            num_blocks,
            block_align: gcd(ARENA_ALIGN, block_size),
            inner: Mutex::new(PoolInner {
                free_list,
                free_flags: vec![true; num_blocks].into_boxed_slice(),
                used: 0,
            }),
        })
    }

    /// Pops one free block, or `None` when the pool is exhausted.
    ///
    /// Exhaustion is a normal, expected outcome, not an error. No ordering
    /// is promised beyond "some free block" (reuse is LIFO).
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let address = inner.free_list.pop()?;
        let index = (address - self.arena.as_ptr() as usize) / self.block_size;
        inner.free_flags[index] = false;
        inner.used += self.block_size;
        // SAFETY: block addresses derive from the non-null arena pointer.
        Some(unsafe { NonNull::new_unchecked(address as *mut u8) })
    }

    /// Returns a block to the free-list.
    ///
    /// Validation order: arena bounds, then block alignment, then
    /// double-free. Each misuse warns and discards the request, leaving the
    /// pool state untouched.
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        let address = ptr.as_ptr() as usize;
        let base = self.arena.as_ptr() as usize;

        if address < base || address >= base + self.pool_size {
            warn!(address, "deallocate target does not belong to this pool");
            return;
        }
        let offset = address - base;
        // A block-aligned address in the remainder tail is not a block
        // start either.
        if offset % self.block_size != 0 || offset / self.block_size >= self.num_blocks {
            warn!(address, "deallocate target is not a block start");
            return;
        }
        let index = offset / self.block_size;

        let mut inner = self.inner.lock();
        if inner.free_flags[index] {
            warn!(address, "double free of pool block");
            return;
        }
        inner.free_flags[index] = true;
        inner.free_list.push(address);
        inner.used -= self.block_size;
        debug!(address, "pool block reclaimed");
    }

    /// Whether a single block can hold a value of `layout`.
    ///
    /// Checks both size and the alignment guarantee of block start
    /// addresses; the pool allocation strategy fails requests that do not
    /// fit before touching the free-list.
    pub fn fits(&self, layout: Layout) -> bool {
        layout.size() <= self.block_size && layout.align() <= self.block_align
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Bytes currently checked out.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    /// Number of blocks currently on the free-list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // SAFETY: the arena was allocated with this exact layout and is
        // released exactly once.
        unsafe { dealloc(self.arena.as_ptr(), self.arena_layout) };
        debug!("memory pool destroyed");
    }
}

fn gcd(a: usize, b: usize) -> usize {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
