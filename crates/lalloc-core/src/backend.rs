//! The backend contract and the handle the rest of the layer passes around.
//!
//! A backend answers four requests. RESIZE never relocates: it either
//! resizes the block in place and returns the same pointer, or returns
//! `None`, meaning the caller must allocate, copy and free. FREE_ALL reports
//! [`FreeAllStatus::Unsupported`] when the backend cannot bulk-free, which
//! the façade treats as a contract violation.

#![allow(unsafe_code)]

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::ptr::{self, NonNull};

use crate::error::AllocError;
use crate::heap::default_heap;

/// Per-allocation option bits.
///
/// The top bit is reserved for [`AllocOptions::LEAK`]; the low 63 bits are
/// free for callers and are carried through to the backend untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocOptions(u64);

impl AllocOptions {
    pub const NONE: Self = Self(0);
    /// Exclude the allocation from leak reports.
    pub const LEAK: Self = Self(1 << 63);

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for AllocOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for AllocOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

/// Outcome of a FREE_ALL request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FreeAllStatus {
    Freed,
    Unsupported,
}

/// A pluggable allocation backend.
///
/// Sizes passed to `resize` and `free` are the sizes the block was last
/// allocated or resized with. Backends may add bits to `options`; the
/// façade stores them in the block header (the arena sets `LEAK`).
pub trait Backend {
    /// Hand out a block of at least `size` bytes.
    fn allocate(&self, size: usize, options: &mut AllocOptions) -> Result<NonNull<u8>, AllocError>;

    /// Resize `block` in place, or return `None` if it would have to move.
    ///
    /// # Safety
    ///
    /// `block` must be a live block of `old_size` bytes from this backend.
    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        options: &mut AllocOptions,
    ) -> Option<NonNull<u8>>;

    /// Release one block.
    ///
    /// # Safety
    ///
    /// `block` must be a live block of `size` bytes from this backend. It
    /// is dangling afterwards.
    unsafe fn free(&self, block: NonNull<u8>, size: usize, options: &mut AllocOptions);

    /// Release every block this backend handed out.
    fn free_all(&self, options: &mut AllocOptions) -> FreeAllStatus;

    /// Whether `free_all` can ever succeed. Checked before any bookkeeping
    /// is torn down.
    fn supports_free_all(&self) -> bool {
        true
    }
}

/// Copyable handle to a backend.
///
/// Two handles are equal when they refer to the same backend object.
/// `Option<Allocator>` stands for "use the allocator of the current
/// [`crate::context`]".
#[derive(Clone, Copy)]
pub struct Allocator {
    backend: *const dyn Backend,
}

impl Allocator {
    /// Handle to a shared backend that lives for the whole program.
    #[must_use]
    pub fn from_static(backend: &'static (dyn Backend + Sync)) -> Self {
        let backend: &'static dyn Backend = backend;
        Self { backend }
    }

    /// Handle to a backend with a shorter lifetime.
    ///
    /// # Safety
    ///
    /// `backend` must outlive every use of the returned handle (and of its
    /// copies), including every block allocated through it. If the handle
    /// reaches another thread, for example through [`crate::context::spawn`],
    /// the backend must tolerate being used from there.
    #[must_use]
    pub unsafe fn from_ref<'a>(backend: &'a (dyn Backend + 'a)) -> Self {
        let short: *const (dyn Backend + 'a) = backend;
        // SAFETY: only the trait-object lifetime changes; the caller
        // guarantees the backend outlives the handle.
        let backend: *const (dyn Backend + 'static) = unsafe { std::mem::transmute(short) };
        Self { backend }
    }

    /// The process-wide default heap.
    #[must_use]
    pub fn heap() -> Self {
        Self::from_static(default_heap())
    }

    /// Borrow the backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        // SAFETY: both constructors require the backend to outlive the handle.
        unsafe { &*self.backend }
    }

    /// Address of the backend object, its identity.
    #[must_use]
    pub fn address(&self) -> usize {
        self.backend.cast::<()>() as usize
    }

    pub fn allocate(&self, size: usize, options: &mut AllocOptions) -> Result<NonNull<u8>, AllocError> {
        self.backend().allocate(size, options)
    }

    /// # Safety
    ///
    /// See [`Backend::resize`].
    pub unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        options: &mut AllocOptions,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { self.backend().resize(block, old_size, new_size, options) }
    }

    /// # Safety
    ///
    /// See [`Backend::free`].
    pub unsafe fn free(&self, block: NonNull<u8>, size: usize, options: &mut AllocOptions) {
        // SAFETY: forwarded caller contract.
        unsafe { self.backend().free(block, size, options) }
    }

    pub fn free_all(&self, options: &mut AllocOptions) -> FreeAllStatus {
        self.backend().free_all(options)
    }

    #[must_use]
    pub fn supports_free_all(&self) -> bool {
        self.backend().supports_free_all()
    }
}

impl PartialEq for Allocator {
    fn eq(&self, other: &Self) -> bool {
        ptr::addr_eq(self.backend, other.backend)
    }
}

impl Eq for Allocator {}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Allocator({:#x})", self.address())
    }
}
