//! Page-chained bump allocator (the "temporary" allocator).
//!
//! The first page is embedded in the arena and its storage is allocated on
//! first use. When no page has room, an overflow page is chained. FREE_ALL
//! drops the overflow pages and regrows the base page to their combined
//! capacity, so a repeat of the same workload fits in one page. Callers may
//! also chain memory they own as pools, which sit between the base page and
//! the overflow pages.
//!
//! Only the most recent allocation of a page can be resized in place and
//! individual frees are no-ops. Every allocation is tagged
//! [`AllocOptions::LEAK`]: arena memory is reclaimed in bulk, never leaked.
//!
//! Not thread-safe. Each thread owns its own temporary arena through the
//! [`crate::context`].

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::io;
use std::iter;
use std::ptr::NonNull;

use crate::backend::{AllocOptions, Allocator, Backend, FreeAllStatus};
use crate::error::AllocError;
use crate::metrics::{AllocMetrics, global_metrics};
use crate::monitor::default_monitor;
use crate::os::{BlockSource, SystemBlocks};

/// Overflow pages (and regrown base pages) are multiples of this.
pub const PAGE_GRANULE: usize = 8 * 1024;

#[derive(Debug)]
struct Page {
    storage: Option<NonNull<u8>>,
    capacity: usize,
    used: usize,
}

impl Page {
    const fn empty(capacity: usize) -> Self {
        Self {
            storage: None,
            capacity,
            used: 0,
        }
    }

    fn try_bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let storage = self.storage?;
        let end = self.used.checked_add(size).filter(|&end| end <= self.capacity)?;
        // SAFETY: `used <= capacity`, so the offset stays inside the page.
        let block = unsafe { storage.add(self.used) };
        self.used = end;
        Some(block)
    }

    fn contains(&self, block: NonNull<u8>) -> bool {
        self.storage.is_some_and(|storage| {
            let start = storage.as_ptr() as usize;
            let addr = block.as_ptr() as usize;
            addr >= start && addr - start < self.capacity
        })
    }
}

#[derive(Debug)]
struct ArenaState {
    base: Page,
    // Caller-owned; never freed by the arena.
    pools: Vec<Page>,
    overflow: Vec<Page>,
    total_used: usize,
}

impl ArenaState {
    fn pages_mut(&mut self) -> impl Iterator<Item = &mut Page> {
        iter::once(&mut self.base)
            .chain(self.pools.iter_mut())
            .chain(self.overflow.iter_mut())
    }

    fn overflow_capacity(&self) -> usize {
        self.overflow.iter().map(|page| page.capacity).sum()
    }

    fn pool_capacity(&self) -> usize {
        self.pools.iter().map(|page| page.capacity).sum()
    }

    fn total_capacity(&self) -> usize {
        self.base.capacity + self.pool_capacity() + self.overflow_capacity()
    }
}

/// Bump allocator over pages drawn from a [`BlockSource`].
///
/// Dropping the arena unlinks its headers from [`default_monitor`] only.
/// A façade built on another monitor must `free_all` the arena before it
/// is dropped, or that monitor keeps headers pointing into freed pages.
pub struct Arena<S: BlockSource = SystemBlocks> {
    source: S,
    state: RefCell<ArenaState>,
}

impl Arena {
    /// Create an arena whose base page holds `base_capacity` bytes.
    /// Nothing is allocated until the first request.
    #[must_use]
    pub const fn new(base_capacity: usize) -> Self {
        Self::with_source(SystemBlocks, base_capacity)
    }
}

impl<S: BlockSource> Arena<S> {
    #[must_use]
    pub const fn with_source(source: S, base_capacity: usize) -> Self {
        Self {
            source,
            state: RefCell::new(ArenaState {
                base: Page::empty(base_capacity),
                pools: Vec::new(),
                overflow: Vec::new(),
                total_used: 0,
            }),
        }
    }

    #[must_use]
    pub fn base_capacity(&self) -> usize {
        self.state.borrow().base.capacity
    }

    #[must_use]
    pub fn overflow_page_count(&self) -> usize {
        self.state.borrow().overflow.len()
    }

    #[must_use]
    pub fn overflow_capacity(&self) -> usize {
        self.state.borrow().overflow_capacity()
    }

    #[must_use]
    pub fn total_capacity(&self) -> usize {
        self.state.borrow().total_capacity()
    }

    /// Bytes handed out since the last FREE_ALL.
    #[must_use]
    pub fn total_used(&self) -> usize {
        self.state.borrow().total_used
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.state.borrow().pools.len()
    }

    /// Chain caller-owned memory as an extra page. Pools are searched after
    /// the base page and before overflow pages. FREE_ALL empties them but
    /// keeps them chained, and they never count towards base regrowth.
    ///
    /// Returns `false` if `storage` is already a pool of this arena.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for reads and writes of `capacity` bytes
    /// until it is removed with [`Arena::remove_pool`] or the arena is
    /// dropped, and must not be handed to any other allocator meanwhile.
    pub unsafe fn add_pool(&self, storage: NonNull<u8>, capacity: usize) -> bool {
        let mut state = self.state.borrow_mut();
        if state.pools.iter().any(|page| page.storage == Some(storage)) {
            return false;
        }
        tracing::debug!(capacity, pools = state.pools.len() + 1, "arena pool added");
        state.pools.push(Page {
            storage: Some(storage),
            capacity,
            used: 0,
        });
        true
    }

    /// Unchain a pool added with [`Arena::add_pool`] and return its
    /// capacity, or `None` if `storage` is not one of this arena's pools.
    /// The memory goes back to the caller untouched; blocks still living in
    /// it can no longer be resized in place.
    pub fn remove_pool(&self, storage: NonNull<u8>) -> Option<usize> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let index = state.pools.iter().position(|page| page.storage == Some(storage))?;
        let page = state.pools.remove(index);
        state.total_used = state.total_used.saturating_sub(page.used);
        tracing::debug!(capacity = page.capacity, pools = state.pools.len(), "arena pool removed");
        Some(page.capacity)
    }

    fn allocate_page(&self, capacity: usize) -> Result<NonNull<u8>, AllocError> {
        self.source
            .allocate_block(capacity)
            .map_err(|source| AllocError::Exhausted {
                requested: capacity,
                source,
            })
    }
}

impl<S: BlockSource> Backend for Arena<S> {
    fn allocate(&self, size: usize, options: &mut AllocOptions) -> Result<NonNull<u8>, AllocError> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        if state.base.storage.is_none() && state.base.capacity > 0 {
            state.base.storage = Some(self.allocate_page(state.base.capacity)?);
        }

        let bumped = state.pages_mut().find_map(|page| page.try_bump(size));
        let block = match bumped {
            Some(block) => block,
            None => {
                let capacity = overflow_page_capacity(state.total_capacity(), size);
                if capacity < size {
                    return Err(AllocError::Exhausted {
                        requested: size,
                        source: io::Error::from(io::ErrorKind::OutOfMemory),
                    });
                }
                tracing::warn!(
                    page_capacity = capacity,
                    requested = size,
                    total_capacity = state.total_capacity(),
                    "arena out of room, chaining an overflow page; consider a larger base page or more frequent free_all"
                );
                let mut page = Page::empty(capacity);
                page.storage = Some(self.allocate_page(capacity)?);
                let block = page.try_bump(size);
                state.overflow.push(page);
                AllocMetrics::inc(&global_metrics().arena_overflow_pages);
                block.ok_or_else(|| AllocError::Exhausted {
                    requested: size,
                    source: io::Error::from(io::ErrorKind::OutOfMemory),
                })?
            }
        };

        state.total_used += size;
        options.insert(AllocOptions::LEAK);
        Ok(block)
    }

    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        _options: &mut AllocOptions,
    ) -> Option<NonNull<u8>> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let page = state.pages_mut().find(|page| page.contains(block))?;
        let storage = page.storage?;
        let tail = page.used.checked_sub(old_size)?;
        if storage.as_ptr().wrapping_add(tail) != block.as_ptr() {
            return None;
        }
        let used = tail.checked_add(new_size).filter(|&used| used <= page.capacity)?;
        page.used = used;

        state.total_used = state.total_used.saturating_sub(old_size) + new_size;
        Some(block)
    }

    unsafe fn free(&self, _block: NonNull<u8>, _size: usize, _options: &mut AllocOptions) {}

    fn free_all(&self, _options: &mut AllocOptions) -> FreeAllStatus {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let combined = state.base.capacity + state.overflow_capacity();
        for pool in &mut state.pools {
            pool.used = 0;
        }
        for page in state.overflow.drain(..) {
            if let Some(storage) = page.storage {
                // SAFETY: overflow storage came from this source and nothing
                // may reference it after FREE_ALL.
                unsafe { self.source.free_block(storage) };
            }
        }
        state.base.used = 0;
        state.total_used = 0;

        if combined != state.base.capacity {
            if let Some(storage) = state.base.storage.take() {
                // SAFETY: as above; the base page is reallocated lazily.
                unsafe { self.source.free_block(storage) };
            }
            tracing::debug!(
                from = state.base.capacity,
                to = combined,
                "arena base page regrown to absorb overflow pages"
            );
            state.base.capacity = combined;
            AllocMetrics::inc(&global_metrics().arena_base_regrowths);
        }
        FreeAllStatus::Freed
    }
}

impl<S: BlockSource> Drop for Arena<S> {
    fn drop(&mut self) {
        // SAFETY: the handle is only compared against header owners while
        // `self` is still alive.
        let this = unsafe { Allocator::from_ref(&*self) };
        default_monitor().unlink_owned_by(this);

        let state = self.state.get_mut();
        let pages = iter::once(state.base.storage.take())
            .chain(state.overflow.drain(..).map(|page| page.storage));
        for storage in pages.flatten() {
            // SAFETY: the arena owns every page and is going away.
            unsafe { self.source.free_block(storage) };
        }
    }
}

/// `ceil(c * log2(c * 10) / 3)`, the log-based growth target for a chain of
/// total capacity `c`.
fn growth_heuristic(total_capacity: usize) -> usize {
    if total_capacity == 0 {
        return 0;
    }
    let c = total_capacity as f64;
    (c * (c * 10.0).log2() / 3.0).ceil() as usize
}

fn next_pow2(n: usize) -> usize {
    n.checked_next_power_of_two().unwrap_or(usize::MAX)
}

fn overflow_page_capacity(total_capacity: usize, size: usize) -> usize {
    let target = next_pow2(size.saturating_mul(2)).max(next_pow2(growth_heuristic(total_capacity)));
    target
        .checked_next_multiple_of(PAGE_GRANULE)
        .unwrap_or(usize::MAX - (PAGE_GRANULE - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: usize = 8 * 1024;

    #[test]
    fn allocations_are_marked_as_leaks() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        arena.allocate(16, &mut opts).unwrap();
        assert!(opts.contains(AllocOptions::LEAK));
    }

    #[test]
    fn bumps_sequentially_within_base_page() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        let a = arena.allocate(100, &mut opts).unwrap();
        let b = arena.allocate(28, &mut opts).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 100);
        assert_eq!(arena.total_used(), 128);
        assert_eq!(arena.overflow_page_count(), 0);
    }

    #[test]
    fn exact_fit_stays_in_page() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        arena.allocate(C, &mut opts).unwrap();
        assert_eq!(arena.overflow_page_count(), 0);
    }

    #[test]
    fn growth_heuristic_matches_formula() {
        assert_eq!(growth_heuristic(0), 0);
        assert_eq!(growth_heuristic(8192), 44570);
        assert_eq!(overflow_page_capacity(8192, 20), 65536);
        assert_eq!(overflow_page_capacity(8192, 100_000), 262_144);
    }

    #[test]
    fn overflow_then_free_all_absorbs_pages() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        arena.allocate(C - 10, &mut opts).unwrap();
        arena.allocate(20, &mut opts).unwrap();
        assert_eq!(arena.overflow_page_count(), 1);
        let overflow = arena.overflow_capacity();
        assert!(overflow >= PAGE_GRANULE);

        assert_eq!(arena.free_all(&mut opts), FreeAllStatus::Freed);
        assert_eq!(arena.base_capacity(), C + overflow);
        assert_eq!(arena.overflow_page_count(), 0);
        assert_eq!(arena.total_used(), 0);

        arena.allocate(C - 10, &mut opts).unwrap();
        arena.allocate(20, &mut opts).unwrap();
        assert_eq!(arena.overflow_page_count(), 0);
    }

    #[test]
    fn free_all_without_overflow_keeps_base() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        let first = arena.allocate(64, &mut opts).unwrap();
        arena.free_all(&mut opts);
        assert_eq!(arena.base_capacity(), C);
        let again = arena.allocate(64, &mut opts).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn tail_resize_in_place() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        let block = arena.allocate(64, &mut opts).unwrap();
        unsafe {
            assert_eq!(arena.resize(block, 64, 512, &mut opts), Some(block));
            assert_eq!(arena.total_used(), 512);
            assert_eq!(arena.resize(block, 512, 8, &mut opts), Some(block));
            assert_eq!(arena.total_used(), 8);
        }
    }

    #[test]
    fn non_tail_resize_refused() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        let first = arena.allocate(64, &mut opts).unwrap();
        arena.allocate(64, &mut opts).unwrap();
        unsafe {
            assert_eq!(arena.resize(first, 64, 65, &mut opts), None);
        }
    }

    #[test]
    fn resize_past_page_end_refused() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        let block = arena.allocate(C - 100, &mut opts).unwrap();
        unsafe {
            assert_eq!(arena.resize(block, C - 100, C + 1, &mut opts), None);
            assert_eq!(arena.resize(block, C - 100, C, &mut opts), Some(block));
        }
    }

    #[test]
    fn resize_in_overflow_page() {
        let arena = Arena::new(64);
        let mut opts = AllocOptions::NONE;
        arena.allocate(60, &mut opts).unwrap();
        let block = arena.allocate(100, &mut opts).unwrap();
        assert_eq!(arena.overflow_page_count(), 1);
        unsafe {
            assert_eq!(arena.resize(block, 100, 200, &mut opts), Some(block));
        }
    }

    #[test]
    fn foreign_block_resize_refused() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        arena.allocate(8, &mut opts).unwrap();
        let mut outside = [0u8; 8];
        let foreign = NonNull::new(outside.as_mut_ptr()).unwrap();
        unsafe {
            assert_eq!(arena.resize(foreign, 8, 16, &mut opts), None);
        }
    }

    #[test]
    fn zero_capacity_base_goes_straight_to_overflow() {
        let arena = Arena::new(0);
        let mut opts = AllocOptions::NONE;
        arena.allocate(10, &mut opts).unwrap();
        assert_eq!(arena.overflow_page_count(), 1);
        assert_eq!(arena.overflow_capacity(), PAGE_GRANULE);
        arena.free_all(&mut opts);
        assert_eq!(arena.base_capacity(), PAGE_GRANULE);
    }

    #[test]
    fn free_is_a_no_op() {
        let arena = Arena::new(C);
        let mut opts = AllocOptions::NONE;
        let block = arena.allocate(32, &mut opts).unwrap();
        unsafe { arena.free(block, 32, &mut opts) };
        assert_eq!(arena.total_used(), 32);
    }

    #[test]
    fn pool_serves_requests_the_base_page_cannot() {
        let arena = Arena::new(64);
        let mut buffer = vec![0u64; 64];
        let pool = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        let mut opts = AllocOptions::NONE;
        unsafe {
            assert!(arena.add_pool(pool, 512));
            assert!(!arena.add_pool(pool, 512));
        }
        assert_eq!(arena.pool_count(), 1);

        arena.allocate(60, &mut opts).unwrap();
        let block = arena.allocate(100, &mut opts).unwrap();
        assert_eq!(block, pool);
        assert_eq!(arena.overflow_page_count(), 0);
        unsafe {
            assert_eq!(arena.resize(block, 100, 400, &mut opts), Some(block));
        }
        assert_eq!(arena.total_used(), 460);
    }

    #[test]
    fn free_all_empties_pools_without_absorbing_them() {
        let arena = Arena::new(64);
        let mut buffer = vec![0u64; 32];
        let pool = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        let mut opts = AllocOptions::NONE;
        unsafe { arena.add_pool(pool, 256) };

        arena.allocate(64, &mut opts).unwrap();
        arena.allocate(200, &mut opts).unwrap();
        assert_eq!(arena.free_all(&mut opts), FreeAllStatus::Freed);
        assert_eq!(arena.base_capacity(), 64);
        assert_eq!(arena.pool_count(), 1);
        assert_eq!(arena.total_capacity(), 64 + 256);

        arena.allocate(64, &mut opts).unwrap();
        assert_eq!(arena.allocate(256, &mut opts).unwrap(), pool);
    }

    #[test]
    fn removed_pool_is_no_longer_used() {
        let arena = Arena::new(0);
        let mut buffer = vec![0u64; 16];
        let pool = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        let mut opts = AllocOptions::NONE;
        unsafe { arena.add_pool(pool, 128) };

        let block = arena.allocate(32, &mut opts).unwrap();
        assert_eq!(block, pool);
        assert_eq!(arena.remove_pool(pool), Some(128));
        assert_eq!(arena.remove_pool(pool), None);
        assert_eq!(arena.total_used(), 0);
        unsafe {
            assert_eq!(arena.resize(block, 32, 64, &mut opts), None);
        }

        let next = arena.allocate(32, &mut opts).unwrap();
        assert_ne!(next, pool);
        assert_eq!(arena.overflow_page_count(), 1);
        drop(arena);
        // The pool is still ours after the arena is gone.
        buffer[0] = 7;
        assert_eq!(buffer[0], 7);
    }
}
