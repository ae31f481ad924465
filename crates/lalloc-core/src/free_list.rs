//! Fixed-capacity free-list allocator.
//!
//! One block is drawn from the source up front. Free space is tracked as a
//! list of ranges sorted by offset; ALLOCATE splits the range picked by the
//! [`PlacementPolicy`], FREE merges the released range with its neighbours,
//! and FREE_ALL collapses the list back to a single range covering the whole
//! storage. RESIZE works in place only: shrinking returns the tail to the
//! list, growing succeeds when the range right after the block is free and
//! large enough.
//!
//! The range list lives beside the storage, not inside it, so freed user
//! memory is never overwritten by bookkeeping.

#![allow(unsafe_code)]

use std::io;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::backend::{AllocOptions, Allocator, Backend, FreeAllStatus};
use crate::error::AllocError;
use crate::monitor::default_monitor;
use crate::os::{BlockSource, SystemBlocks};

/// Every range starts and ends on a multiple of this.
pub const GRANULE: usize = 16;

/// How ALLOCATE picks among the free ranges that fit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementPolicy {
    /// Lowest-addressed range that fits.
    #[default]
    FindFirst,
    /// Smallest range that fits; ties go to the lower address.
    FindBest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: usize,
    len: usize,
}

impl FreeRange {
    const fn end(self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug)]
struct FreeListState {
    free: Vec<FreeRange>,
    used: usize,
    peak_used: usize,
}

impl FreeListState {
    fn pick(&self, len: usize, policy: PlacementPolicy) -> Option<usize> {
        let mut fits = self.free.iter().enumerate().filter(|(_, range)| range.len >= len);
        match policy {
            PlacementPolicy::FindFirst => fits.next().map(|(index, _)| index),
            PlacementPolicy::FindBest => fits.min_by_key(|(_, range)| range.len).map(|(index, _)| index),
        }
    }

    fn take_front(&mut self, index: usize, len: usize) -> usize {
        let range = &mut self.free[index];
        let offset = range.offset;
        if range.len == len {
            self.free.remove(index);
        } else {
            range.offset += len;
            range.len -= len;
        }
        self.grow_used(len);
        offset
    }

    /// Insert `released` in address order, merging it with touching ranges.
    fn release(&mut self, released: FreeRange) {
        let index = self.free.partition_point(|range| range.offset < released.offset);
        let mut merged = released;

        if let Some(next) = self.free.get(index).copied() {
            if merged.end() == next.offset {
                merged.len += next.len;
                self.free.remove(index);
            }
        }
        if index > 0 {
            let prev = &mut self.free[index - 1];
            if prev.end() == merged.offset {
                prev.len += merged.len;
                self.used = self.used.saturating_sub(released.len);
                return;
            }
        }
        self.free.insert(index, merged);
        self.used = self.used.saturating_sub(released.len);
    }

    fn grow_used(&mut self, len: usize) {
        self.used += len;
        self.peak_used = self.peak_used.max(self.used);
    }
}

/// Backend handing out sub-ranges of one fixed block.
///
/// Thread-safe: the range list sits behind a `parking_lot::Mutex`, so one
/// instance can be shared as a `'static` [`Allocator`]. Dropping it unlinks
/// its headers from [`default_monitor`] and releases the storage.
pub struct FreeListAllocator<S: BlockSource = SystemBlocks> {
    source: S,
    storage: NonNull<u8>,
    capacity: usize,
    policy: PlacementPolicy,
    state: Mutex<FreeListState>,
}

// SAFETY: `storage` is owned exclusively by the allocator and every change
// to which parts of it are handed out goes through `state`'s mutex.
unsafe impl<S: BlockSource + Send> Send for FreeListAllocator<S> {}
// SAFETY: as above; shared access only reads immutable fields or locks.
unsafe impl<S: BlockSource + Sync> Sync for FreeListAllocator<S> {}

impl FreeListAllocator {
    /// Reserve `capacity` bytes (rounded up to [`GRANULE`]) from the C
    /// allocator.
    pub fn new(capacity: usize, policy: PlacementPolicy) -> Result<Self, AllocError> {
        Self::with_source(SystemBlocks, capacity, policy)
    }
}

impl<S: BlockSource> FreeListAllocator<S> {
    pub fn with_source(source: S, capacity: usize, policy: PlacementPolicy) -> Result<Self, AllocError> {
        let capacity = round_to_granule(capacity)
            .ok_or(AllocError::SizeOverflow {
                size: capacity,
                alignment: GRANULE,
            })?
            .max(GRANULE);
        let storage = source
            .allocate_block(capacity)
            .map_err(|source| AllocError::Exhausted {
                requested: capacity,
                source,
            })?;
        Ok(Self {
            source,
            storage,
            capacity,
            policy,
            state: Mutex::new(FreeListState {
                free: vec![FreeRange {
                    offset: 0,
                    len: capacity,
                }],
                used: 0,
                peak_used: 0,
            }),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// Bytes currently handed out, in granules.
    #[must_use]
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// High-water mark of [`FreeListAllocator::used`]. FREE_ALL keeps it.
    #[must_use]
    pub fn peak_used(&self) -> usize {
        self.state.lock().peak_used
    }

    #[must_use]
    pub fn free_range_count(&self) -> usize {
        self.state.lock().free.len()
    }

    #[must_use]
    pub fn largest_free_range(&self) -> usize {
        self.state.lock().free.iter().map(|range| range.len).max().unwrap_or(0)
    }

    fn offset_of(&self, block: NonNull<u8>) -> Option<usize> {
        let offset = (block.as_ptr() as usize).checked_sub(self.storage.as_ptr() as usize)?;
        (offset < self.capacity).then_some(offset)
    }
}

impl<S: BlockSource> Backend for FreeListAllocator<S> {
    fn allocate(&self, size: usize, _options: &mut AllocOptions) -> Result<NonNull<u8>, AllocError> {
        let len = round_to_granule(size)
            .ok_or(AllocError::SizeOverflow {
                size,
                alignment: GRANULE,
            })?
            .max(GRANULE);

        let mut state = self.state.lock();
        let Some(index) = state.pick(len, self.policy) else {
            tracing::debug!(
                requested = len,
                free_ranges = state.free.len(),
                used = state.used,
                capacity = self.capacity,
                "free list has no range large enough"
            );
            return Err(AllocError::Exhausted {
                requested: size,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            });
        };
        let offset = state.take_front(index, len);
        // SAFETY: every range lies inside `0..capacity`.
        Ok(unsafe { self.storage.add(offset) })
    }

    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        _options: &mut AllocOptions,
    ) -> Option<NonNull<u8>> {
        let offset = self.offset_of(block)?;
        let old_len = round_to_granule(old_size)?.max(GRANULE);
        let new_len = round_to_granule(new_size)?.max(GRANULE);

        let mut state = self.state.lock();
        if new_len < old_len {
            state.release(FreeRange {
                offset: offset + new_len,
                len: old_len - new_len,
            });
        } else if new_len > old_len {
            let end = offset + old_len;
            let extra = new_len - old_len;
            let index = state.free.binary_search_by_key(&end, |range| range.offset).ok()?;
            if state.free[index].len < extra {
                return None;
            }
            state.take_front(index, extra);
        }
        Some(block)
    }

    unsafe fn free(&self, block: NonNull<u8>, size: usize, _options: &mut AllocOptions) {
        let (Some(offset), Some(len)) = (self.offset_of(block), round_to_granule(size)) else {
            tracing::warn!(block = ?block, size, "ignoring free of a block outside the free list");
            return;
        };
        self.state.lock().release(FreeRange {
            offset,
            len: len.max(GRANULE),
        });
    }

    fn free_all(&self, _options: &mut AllocOptions) -> FreeAllStatus {
        let mut state = self.state.lock();
        state.free.clear();
        state.free.push(FreeRange {
            offset: 0,
            len: self.capacity,
        });
        state.used = 0;
        FreeAllStatus::Freed
    }
}

impl<S: BlockSource> Drop for FreeListAllocator<S> {
    fn drop(&mut self) {
        // SAFETY: the handle is only compared against header owners while
        // `self` is still alive.
        let this = unsafe { Allocator::from_ref(&*self) };
        default_monitor().unlink_owned_by(this);
        // SAFETY: the storage came from this source and nothing may use it
        // once the allocator is gone.
        unsafe { self.source.free_block(self.storage) };
    }
}

fn round_to_granule(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(GRANULE)
}
