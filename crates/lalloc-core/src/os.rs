//! OS block primitives and bulk byte helpers.
//!
//! [`BlockSource`] is the black-box interface the default heap and the
//! arena draw raw storage from. [`SystemBlocks`] is the libc `malloc`
//! family. In-place resizing only succeeds inside the block's usable size,
//! so a block source never relocates memory behind the caller's back.

#![allow(unsafe_code)]

use std::io;
use std::ptr::{self, NonNull};
use std::slice;

/// Raw block allocation primitives.
pub trait BlockSource {
    /// Allocate a block of at least `size` bytes.
    fn allocate_block(&self, size: usize) -> io::Result<NonNull<u8>>;

    /// Grow or shrink `block` without moving it. `None` if that is not possible.
    ///
    /// # Safety
    ///
    /// `block` must be live and come from this source.
    unsafe fn resize_block(&self, block: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>>;

    /// Usable size of `block`, if the platform can tell.
    ///
    /// # Safety
    ///
    /// `block` must be live and come from this source.
    unsafe fn block_size(&self, block: NonNull<u8>) -> Option<usize>;

    /// Release `block`.
    ///
    /// # Safety
    ///
    /// `block` must be live and come from this source. It is dangling afterwards.
    unsafe fn free_block(&self, block: NonNull<u8>);
}

/// The C heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemBlocks;

impl BlockSource for SystemBlocks {
    fn allocate_block(&self, size: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: malloc has no preconditions; a zero-size request is bumped to one byte.
        let raw = unsafe { libc::malloc(size.max(1)) };
        NonNull::new(raw.cast::<u8>()).ok_or_else(last_alloc_error)
    }

    unsafe fn resize_block(&self, block: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        let usable = unsafe { self.block_size(block) }?;
        (new_size <= usable).then_some(block)
    }

    unsafe fn block_size(&self, block: NonNull<u8>) -> Option<usize> {
        // SAFETY: forwarded caller contract; `block` came from malloc.
        unsafe { usable_size(block) }
    }

    unsafe fn free_block(&self, block: NonNull<u8>) {
        // SAFETY: forwarded caller contract; `block` came from malloc.
        unsafe { libc::free(block.as_ptr().cast()) }
    }
}

fn last_alloc_error() -> io::Error {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(0) | None => io::Error::from(io::ErrorKind::OutOfMemory),
        Some(_) => err,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn usable_size(block: NonNull<u8>) -> Option<usize> {
    // SAFETY: caller guarantees a live malloc block.
    Some(unsafe { libc::malloc_usable_size(block.as_ptr().cast()) })
}

#[cfg(target_vendor = "apple")]
unsafe fn usable_size(block: NonNull<u8>) -> Option<usize> {
    // SAFETY: caller guarantees a live malloc block.
    Some(unsafe { libc::malloc_size(block.as_ptr().cast_const().cast()) })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
unsafe fn usable_size(_block: NonNull<u8>) -> Option<usize> {
    None
}

/// Copy `n` bytes from `src` to `dst`. The ranges may overlap.
///
/// # Safety
///
/// Both ranges must be valid for `n` bytes.
pub unsafe fn byte_copy(dst: *mut u8, src: *const u8, n: usize) {
    // SAFETY: forwarded caller contract; `ptr::copy` is memmove.
    unsafe { ptr::copy(src, dst, n) }
}

/// Set `n` bytes at `dst` to `value`.
///
/// # Safety
///
/// `dst` must be valid for writes of `n` bytes.
pub unsafe fn byte_fill(dst: *mut u8, value: u8, n: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { ptr::write_bytes(dst, value, n) }
}

/// Index of the first byte where `a` and `b` differ, `None` if equal.
///
/// # Safety
///
/// Both ranges must be valid for reads of `n` bytes.
pub unsafe fn byte_compare(a: *const u8, b: *const u8, n: usize) -> Option<usize> {
    // SAFETY: forwarded caller contract.
    let (a, b) = unsafe { (slice::from_raw_parts(a, n), slice::from_raw_parts(b, n)) };
    a.iter().zip(b).position(|(x, y)| x != y)
}

/// Index of the first byte in `n` bytes at `p` that is not `value`.
///
/// # Safety
///
/// `p` must be valid for reads of `n` bytes.
pub unsafe fn byte_mismatch(p: *const u8, value: u8, n: usize) -> Option<usize> {
    // SAFETY: forwarded caller contract.
    let bytes = unsafe { slice::from_raw_parts(p, n) };
    bytes.iter().position(|&b| b != value)
}
