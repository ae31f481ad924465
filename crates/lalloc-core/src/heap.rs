//! Default heap backend over an OS block source.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::backend::{AllocOptions, Backend, FreeAllStatus};
use crate::config::{ShrinkPolicy, memory_config};
use crate::error::AllocError;
use crate::os::{BlockSource, SystemBlocks};

/// General-purpose backend forwarding to a [`BlockSource`].
///
/// RESIZE only ever succeeds in place. A shrink the source refuses is
/// answered according to the [`ShrinkPolicy`]. FREE_ALL is unsupported.
#[derive(Debug)]
pub struct HeapBackend<S: BlockSource = SystemBlocks> {
    source: S,
    shrink_policy: ShrinkPolicy,
}

impl HeapBackend {
    /// Create a heap over the C allocator keeping refused shrinks in place.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_policy(ShrinkPolicy::KeepBlock)
    }

    #[must_use]
    pub const fn with_policy(shrink_policy: ShrinkPolicy) -> Self {
        Self::with_source(SystemBlocks, shrink_policy)
    }
}

impl Default for HeapBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BlockSource> HeapBackend<S> {
    /// Create a heap over an arbitrary block source.
    #[must_use]
    pub const fn with_source(source: S, shrink_policy: ShrinkPolicy) -> Self {
        Self {
            source,
            shrink_policy,
        }
    }

    #[must_use]
    pub fn shrink_policy(&self) -> ShrinkPolicy {
        self.shrink_policy
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: BlockSource> Backend for HeapBackend<S> {
    fn allocate(&self, size: usize, _options: &mut AllocOptions) -> Result<NonNull<u8>, AllocError> {
        self.source
            .allocate_block(size)
            .map_err(|source| AllocError::Exhausted {
                requested: size,
                source,
            })
    }

    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        _options: &mut AllocOptions,
    ) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `block` is a live block of this heap.
        if let Some(resized) = unsafe { self.source.resize_block(block, new_size) } {
            return Some(resized);
        }
        if new_size < old_size && self.shrink_policy == ShrinkPolicy::KeepBlock {
            return Some(block);
        }
        None
    }

    unsafe fn free(&self, block: NonNull<u8>, _size: usize, _options: &mut AllocOptions) {
        // SAFETY: caller guarantees `block` is a live block of this heap.
        unsafe { self.source.free_block(block) }
    }

    fn free_all(&self, _options: &mut AllocOptions) -> FreeAllStatus {
        FreeAllStatus::Unsupported
    }

    fn supports_free_all(&self) -> bool {
        false
    }
}

/// The process-wide heap, configured from [`memory_config`].
#[must_use]
pub fn default_heap() -> &'static HeapBackend {
    static HEAP: OnceLock<HeapBackend> = OnceLock::new();
    HEAP.get_or_init(|| HeapBackend::with_policy(memory_config().heap_shrink_policy))
}
