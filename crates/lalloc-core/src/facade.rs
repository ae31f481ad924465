//! General allocation façade: the only entry point consumers call.
//!
//! Parameters left as `None` are resolved from the calling thread's
//! [`crate::context`]. Every block gets a header (see [`crate::header`])
//! and is reported to the [`HeapMonitor`] the façade was built with.
//!
//! Backend exhaustion comes back as [`AllocError`]. Broken contracts
//! (bad alignment, double free, corruption, FREE_ALL on a backend that
//! cannot do it) go to [`fatal`] and do not return.

#![allow(unsafe_code)]

use std::mem::{align_of, size_of};
use std::panic::Location;
use std::ptr::NonNull;

use crate::backend::{AllocOptions, Allocator, FreeAllStatus};
use crate::context::{self, AllocContext};
use crate::error::{AllocError, ContractViolation};
use crate::fatal::fatal;
use crate::header::{self, BlockInfo, Header, MAX_ALIGNMENT, MIN_ALIGNMENT};
use crate::metrics::{AllocMetrics, global_metrics};
use crate::monitor::{HeapMonitor, default_monitor};
use crate::os::{byte_copy, byte_fill};

/// Drives backends and keeps a monitor informed.
#[derive(Clone, Copy)]
pub struct GeneralAllocator<'m> {
    monitor: &'m dyn HeapMonitor,
}

impl GeneralAllocator<'static> {
    /// Façade over the process-wide default monitor.
    #[must_use]
    pub fn global() -> Self {
        Self::with_monitor(default_monitor())
    }
}

impl<'m> GeneralAllocator<'m> {
    /// Façade reporting to `monitor`. Blocks must be freed through a façade
    /// using the same monitor.
    #[must_use]
    pub const fn with_monitor(monitor: &'m dyn HeapMonitor) -> Self {
        Self { monitor }
    }

    #[must_use]
    pub fn monitor(&self) -> &'m dyn HeapMonitor {
        self.monitor
    }

    /// Allocate `size` bytes.
    ///
    /// The returned pointer is aligned to `alignment` (or the context's),
    /// raised to at least [`MIN_ALIGNMENT`]. Halts if the alignment is not
    /// a power of two or exceeds [`MAX_ALIGNMENT`].
    #[track_caller]
    pub fn allocate(
        &self,
        allocator: Option<Allocator>,
        size: usize,
        alignment: Option<usize>,
        options: AllocOptions,
    ) -> Result<NonNull<u8>, AllocError> {
        let context = context::current();
        let owner = allocator.unwrap_or(context.allocator);
        let alignment = checked_alignment(alignment.unwrap_or(context.alignment));
        let mut options = options | context.options;

        let required =
            header::request_size(size, alignment).ok_or(AllocError::SizeOverflow { size, alignment })?;
        let raw = owner.allocate(required, &mut options)?;

        let location = Location::caller();
        let info = BlockInfo {
            owner,
            size,
            alignment,
            options,
            id: self.monitor.next_allocation_id(),
            rid: 0,
            location,
        };
        // SAFETY: the backend handed out `required` writable bytes and the
        // alignment was validated above.
        let user = unsafe { header::encode(raw, &info) };
        // SAFETY: freshly encoded.
        let header = unsafe { header::decode(user) };
        // SAFETY: the header stays live until it is freed through this façade.
        if !unsafe { self.monitor.add_header(header) } {
            fatal(ContractViolation::AlreadyTracked(header.as_ptr() as usize));
        }
        self.verify_periodically();

        AllocMetrics::inc(&global_metrics().allocations);
        log_allocation(&context, "allocate", user, size, owner, location);
        Ok(user)
    }

    /// Allocate `count * size` zeroed bytes.
    #[track_caller]
    pub fn allocate_zeroed(
        &self,
        allocator: Option<Allocator>,
        count: usize,
        size: usize,
        alignment: Option<usize>,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or_else(|| AllocError::SizeOverflow {
            size: usize::MAX,
            alignment: alignment.unwrap_or_else(|| context::current().alignment),
        })?;
        let user = self.allocate(allocator, total, alignment, AllocOptions::NONE)?;
        // SAFETY: `user` holds `total` writable bytes.
        unsafe { byte_fill(user.as_ptr(), 0, total) };
        Ok(user)
    }

    /// Uninitialised storage for `count` values of `T`.
    #[track_caller]
    pub fn allocate_array<T>(
        &self,
        allocator: Option<Allocator>,
        count: usize,
    ) -> Result<NonNull<T>, AllocError> {
        let alignment = align_of::<T>().max(context::current().alignment);
        let size = size_of::<T>()
            .checked_mul(count)
            .ok_or(AllocError::SizeOverflow {
                size: usize::MAX,
                alignment,
            })?;
        self.allocate(allocator, size, Some(alignment), AllocOptions::NONE)
            .map(NonNull::cast)
    }

    /// Resize an allocation, in place if the backend can, otherwise by
    /// allocate, copy and free. The ID survives a move; the RID is bumped
    /// either way.
    ///
    /// # Safety
    ///
    /// `user` must be a live allocation from a façade sharing this monitor.
    /// On a move the old pointer is dangling afterwards.
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        user: NonNull<u8>,
        new_size: usize,
        options: AllocOptions,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: caller guarantees `user` came from a façade.
        let header = unsafe { header::decode(user) };
        self.check_live(user, header);

        // SAFETY: checked live above.
        let (old_size, alignment, owner, old_len) = {
            let h = unsafe { header.as_ref() };
            (h.size(), h.alignment(), h.owner(), h.block_len())
        };
        if new_size == old_size {
            return Ok(user);
        }
        let new_len = header::request_size(new_size, alignment).ok_or(AllocError::SizeOverflow {
            size: new_size,
            alignment,
        })?;

        let context = context::current();
        let location = Location::caller();
        let mut options = options | context.options;
        // SAFETY: the header is live, so its raw block is a live block of `owner`.
        let raw = unsafe { header::raw_block(header) };
        // SAFETY: `raw` is a live block of `old_len` bytes from `owner`.
        match unsafe { owner.resize(raw, old_len, new_len, &mut options) } {
            Some(block) if block == raw => {
                // SAFETY: the backend now holds `new_len` bytes at `raw`.
                unsafe { self.monitor.resize_header(header, new_size, location) };
                AllocMetrics::inc(&global_metrics().resizes_in_place);
                log_allocation(&context, "resize", user, new_size, owner, location);
                Ok(user)
            }
            Some(moved) => fatal(ContractViolation::BackendMovedBlock {
                given: raw.as_ptr() as usize,
                returned: moved.as_ptr() as usize,
            }),
            None => {
                let moved = self.move_block(header, new_size, new_len, options, location)?;
                log_allocation(&context, "move", moved, new_size, owner, location);
                Ok(moved)
            }
        }
    }

    #[track_caller]
    fn move_block(
        &self,
        old: NonNull<Header>,
        new_size: usize,
        new_len: usize,
        mut options: AllocOptions,
        location: &'static Location<'static>,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: caller checked `old` is live.
        let (old_size, alignment, owner, old_len) = {
            let h = unsafe { old.as_ref() };
            (h.size(), h.alignment(), h.owner(), h.block_len())
        };
        let new_raw = owner.allocate(new_len, &mut options)?;
        let info = BlockInfo {
            owner,
            size: new_size,
            alignment,
            options,
            id: 0,
            rid: 0,
            location,
        };
        // SAFETY: fresh block of `new_len` bytes; alignment came from a valid header.
        let new_user = unsafe { header::encode(new_raw, &info) };
        // SAFETY: freshly encoded.
        let new = unsafe { header::decode(new_user) };
        let old_user = header::user_pointer(old);
        // SAFETY: both user regions hold at least `min(old, new)` bytes and
        // belong to distinct live blocks.
        unsafe {
            byte_copy(new_user.as_ptr(), old_user.as_ptr(), old_size.min(new_size));
            header::inherit_identity(old, new);
        }
        // SAFETY: `old` is linked and `new` is live.
        if !unsafe { self.monitor.swap_header(old, new) } {
            fatal(ContractViolation::DoubleFree(old_user.as_ptr() as usize));
        }
        // SAFETY: `old` is unlinked; nothing refers to its block any more.
        unsafe {
            let old_raw = header::raw_block(old);
            header::scrub(old);
            owner.free(old_raw, old_len, &mut options);
        }
        AllocMetrics::inc(&global_metrics().resizes_moved);
        Ok(new_user)
    }

    /// Free an allocation. Null is a no-op; anything that is not a live
    /// allocation halts.
    ///
    /// # Safety
    ///
    /// `user` must be null or have been returned by a façade sharing this
    /// monitor. It is dangling afterwards.
    #[track_caller]
    pub unsafe fn free(&self, user: *mut u8, options: AllocOptions) {
        let Some(user) = NonNull::new(user) else {
            return;
        };
        // SAFETY: caller guarantees `user` came from a façade.
        let header = unsafe { header::decode(user) };
        self.check_live(user, header);
        // SAFETY: live per the check above.
        if !unsafe { self.monitor.unlink_header(header) } {
            fatal(ContractViolation::DoubleFree(user.as_ptr() as usize));
        }

        let mut options = options | context::current().options;
        // SAFETY: the header is unlinked but its block is still ours to release.
        unsafe {
            let h = header.as_ref();
            let (owner, len) = (h.owner(), h.block_len());
            let raw = header::raw_block(header);
            header::scrub(header);
            owner.free(raw, len, &mut options);
        }
        AllocMetrics::inc(&global_metrics().frees);
    }

    /// Release every block of `allocator` at once.
    ///
    /// Headers owned by the allocator are unlinked from the monitor before
    /// the backend runs. Halts if the backend cannot bulk-free.
    #[track_caller]
    pub fn free_all(&self, allocator: Option<Allocator>, options: AllocOptions) {
        let context = context::current();
        let owner = allocator.unwrap_or(context.allocator);
        if !owner.supports_free_all() {
            fatal(ContractViolation::FreeAllUnsupported);
        }
        self.monitor.unlink_owned_by(owner);

        let mut options = options | context.options;
        match owner.free_all(&mut options) {
            FreeAllStatus::Freed => AllocMetrics::inc(&global_metrics().free_alls),
            FreeAllStatus::Unsupported => fatal(ContractViolation::FreeAllUnsupported),
        }
    }

    #[track_caller]
    fn check_live(&self, user: NonNull<u8>, header: NonNull<Header>) {
        if !self.monitor.is_live(header) {
            fatal(ContractViolation::DoubleFree(user.as_ptr() as usize));
        }
        // SAFETY: the monitor knows this header as live.
        if let Err(corruption) = unsafe { self.monitor.verify_header(header) } {
            fatal(corruption.into());
        }
    }

    #[track_caller]
    fn verify_periodically(&self) {
        if let Err(corruption) = self.monitor.maybe_verify_heap() {
            fatal(corruption.into());
        }
    }
}

#[track_caller]
fn checked_alignment(alignment: usize) -> usize {
    if !alignment.is_power_of_two() {
        fatal(ContractViolation::InvalidAlignment(alignment));
    }
    if alignment > MAX_ALIGNMENT {
        fatal(ContractViolation::AlignmentTooLarge {
            alignment,
            max: MAX_ALIGNMENT,
        });
    }
    alignment.max(MIN_ALIGNMENT)
}

fn log_allocation(
    context: &AllocContext,
    op: &'static str,
    user: NonNull<u8>,
    size: usize,
    owner: Allocator,
    location: &Location<'_>,
) {
    if !context.log_all_allocations {
        return;
    }
    let Some(_guard) = context::enter_allocation_logging() else {
        return;
    };
    tracing::trace!(
        op,
        ptr = ?user,
        size,
        allocator = ?owner,
        file = location.file(),
        line = location.line(),
        "allocation"
    );
}

/// Allocate `size` bytes from the context allocator.
#[track_caller]
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    GeneralAllocator::global().allocate(None, size, None, AllocOptions::NONE)
}

#[track_caller]
pub fn allocate_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
    GeneralAllocator::global().allocate(None, size, Some(alignment), AllocOptions::NONE)
}

#[track_caller]
pub fn allocate_in(allocator: Allocator, size: usize) -> Result<NonNull<u8>, AllocError> {
    GeneralAllocator::global().allocate(Some(allocator), size, None, AllocOptions::NONE)
}

#[track_caller]
pub fn allocate_zeroed(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    GeneralAllocator::global().allocate_zeroed(None, count, size, None)
}

#[track_caller]
pub fn allocate_array<T>(count: usize) -> Result<NonNull<T>, AllocError> {
    GeneralAllocator::global().allocate_array::<T>(None, count)
}

/// # Safety
///
/// See [`GeneralAllocator::reallocate`].
#[track_caller]
pub unsafe fn reallocate(user: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
    // SAFETY: forwarded caller contract.
    unsafe { GeneralAllocator::global().reallocate(user, new_size, AllocOptions::NONE) }
}

/// # Safety
///
/// See [`GeneralAllocator::free`].
#[track_caller]
pub unsafe fn free(user: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { GeneralAllocator::global().free(user, AllocOptions::NONE) }
}

#[track_caller]
pub fn free_all(allocator: Allocator) {
    GeneralAllocator::global().free_all(Some(allocator), AllocOptions::NONE);
}

/// User size recorded for an allocation.
///
/// # Safety
///
/// `user` must be a live allocation from a façade.
#[must_use]
pub unsafe fn allocation_size(user: NonNull<u8>) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { header::decode(user).as_ref() }.size()
}

/// # Safety
///
/// `user` must be a live allocation from a façade.
#[must_use]
pub unsafe fn allocation_alignment(user: NonNull<u8>) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { header::decode(user).as_ref() }.alignment()
}

/// Backend that owns an allocation.
///
/// # Safety
///
/// `user` must be a live allocation from a façade.
#[must_use]
pub unsafe fn allocator_of(user: NonNull<u8>) -> Allocator {
    // SAFETY: forwarded caller contract.
    unsafe { header::decode(user).as_ref() }.owner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::heap::HeapBackend;
    use crate::monitor::NullMonitor;
    use crate::os::byte_mismatch;

    #[cfg(feature = "debug-memory")]
    use crate::monitor::DebugMonitor;

    #[cfg(feature = "debug-memory")]
    fn quiet_monitor() -> DebugMonitor {
        DebugMonitor::new(1)
    }

    #[cfg(not(feature = "debug-memory"))]
    fn quiet_monitor() -> NullMonitor {
        NullMonitor
    }

    #[test]
    fn allocate_respects_alignment_and_size() {
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        for alignment in [8usize, 16, 32, 64, 4096] {
            let p = general
                .allocate(Some(Allocator::heap()), 10, Some(alignment), AllocOptions::NONE)
                .unwrap();
            assert_eq!(p.as_ptr() as usize % alignment, 0);
            unsafe {
                assert_eq!(allocation_size(p), 10);
                assert_eq!(allocation_alignment(p), alignment);
                assert_eq!(allocator_of(p), Allocator::heap());
                general.free(p.as_ptr(), AllocOptions::NONE);
            }
        }
        assert_eq!(monitor.live_count(), 0);
    }

    #[test]
    fn small_alignment_is_raised() {
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general
            .allocate(Some(Allocator::heap()), 3, Some(1), AllocOptions::NONE)
            .unwrap();
        unsafe {
            assert_eq!(allocation_alignment(p), MIN_ALIGNMENT);
            general.free(p.as_ptr(), AllocOptions::NONE);
        }
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn bad_alignment_is_fatal() {
        let general = GeneralAllocator::with_monitor(&NullMonitor);
        let _ = general.allocate(Some(Allocator::heap()), 8, Some(12), AllocOptions::NONE);
    }

    #[test]
    #[should_panic(expected = "exceeds the supported maximum")]
    fn huge_alignment_is_fatal() {
        let general = GeneralAllocator::with_monitor(&NullMonitor);
        let _ = general.allocate(Some(Allocator::heap()), 8, Some(1 << 20), AllocOptions::NONE);
    }

    #[test]
    fn size_overflow_is_an_error() {
        let general = GeneralAllocator::with_monitor(&NullMonitor);
        let err = general
            .allocate(Some(Allocator::heap()), usize::MAX - 8, None, AllocOptions::NONE)
            .unwrap_err();
        assert!(matches!(err, AllocError::SizeOverflow { .. }));
    }

    #[test]
    fn zeroed_overflow_reports_the_context_alignment() {
        let general = GeneralAllocator::with_monitor(&NullMonitor);
        let err = context::with_alignment(64, || {
            general.allocate_zeroed(None, usize::MAX, 2, None).unwrap_err()
        });
        assert!(matches!(
            err,
            AllocError::SizeOverflow {
                size: usize::MAX,
                alignment: 64
            }
        ));
        let err = general
            .allocate_zeroed(None, usize::MAX, 2, Some(256))
            .unwrap_err();
        assert!(matches!(err, AllocError::SizeOverflow { alignment: 256, .. }));
    }

    #[test]
    fn free_null_is_noop() {
        let general = GeneralAllocator::with_monitor(&NullMonitor);
        unsafe { general.free(std::ptr::null_mut(), AllocOptions::NONE) };
    }

    #[test]
    fn zeroed_allocation_is_zero() {
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general
            .allocate_zeroed(Some(Allocator::heap()), 12, 4, None)
            .unwrap();
        unsafe {
            assert_eq!(byte_mismatch(p.as_ptr(), 0, 48), None);
            general.free(p.as_ptr(), AllocOptions::NONE);
        }
    }

    #[test]
    fn typed_array_is_aligned_for_t() {
        #[repr(align(32))]
        struct Wide([u8; 32]);

        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general.allocate_array::<Wide>(Some(Allocator::heap()), 3).unwrap();
        assert_eq!(p.as_ptr() as usize % 32, 0);
        unsafe {
            assert_eq!(allocation_size(p.cast()), 96);
            general.free(p.as_ptr().cast(), AllocOptions::NONE);
        }
    }

    #[test]
    fn reallocate_same_size_is_identity() {
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general
            .allocate(Some(Allocator::heap()), 16, None, AllocOptions::NONE)
            .unwrap();
        unsafe {
            assert_eq!(general.reallocate(p, 16, AllocOptions::NONE).unwrap(), p);
            general.free(p.as_ptr(), AllocOptions::NONE);
        }
    }

    #[test]
    fn heap_grow_preserves_contents() {
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general
            .allocate(Some(Allocator::heap()), 16, Some(16), AllocOptions::NONE)
            .unwrap();
        unsafe {
            for i in 0..16 {
                *p.as_ptr().add(i) = i as u8;
            }
            let q = general.reallocate(p, 100_000, AllocOptions::NONE).unwrap();
            for i in 0..16 {
                assert_eq!(*q.as_ptr().add(i), i as u8);
            }
            assert_eq!(allocation_size(q), 100_000);
            assert_eq!(allocation_alignment(q), 16);
            assert_eq!(monitor.verify_heap(), Ok(()));
            general.free(q.as_ptr(), AllocOptions::NONE);
        }
        assert_eq!(monitor.live_count(), 0);
    }

    #[test]
    fn move_policy_relocates_on_refused_shrink() {
        use crate::os::{BlockSource, SystemBlocks};

        struct NoInPlace;
        impl BlockSource for NoInPlace {
            fn allocate_block(&self, size: usize) -> std::io::Result<NonNull<u8>> {
                SystemBlocks.allocate_block(size)
            }
            unsafe fn resize_block(&self, _b: NonNull<u8>, _n: usize) -> Option<NonNull<u8>> {
                None
            }
            unsafe fn block_size(&self, _b: NonNull<u8>) -> Option<usize> {
                None
            }
            unsafe fn free_block(&self, b: NonNull<u8>) {
                unsafe { SystemBlocks.free_block(b) }
            }
        }

        let heap = HeapBackend::with_source(NoInPlace, crate::config::ShrinkPolicy::Move);
        let handle = unsafe { Allocator::from_ref(&heap) };
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general.allocate(Some(handle), 64, None, AllocOptions::NONE).unwrap();
        unsafe {
            *p.as_ptr() = 0x5A;
            let q = general.reallocate(p, 8, AllocOptions::NONE).unwrap();
            assert_ne!(p, q);
            assert_eq!(*q.as_ptr(), 0x5A);
            assert_eq!(allocator_of(q), handle);
            general.free(q.as_ptr(), AllocOptions::NONE);
        }
    }

    #[test]
    fn arena_tail_resize_stays_in_place() {
        let arena = Arena::new(8 * 1024);
        let handle = unsafe { Allocator::from_ref(&arena) };
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general.allocate(Some(handle), 32, None, AllocOptions::NONE).unwrap();
        unsafe {
            let q = general.reallocate(p, 64, AllocOptions::NONE).unwrap();
            assert_eq!(p, q);
            assert_eq!(allocation_size(q), 64);
        }
        assert_eq!(monitor.verify_heap(), Ok(()));
        general.free_all(Some(handle), AllocOptions::NONE);
        assert_eq!(monitor.live_count_owned_by(handle), 0);
    }

    #[test]
    #[should_panic(expected = "does not support FREE_ALL")]
    fn heap_free_all_is_fatal() {
        let general = GeneralAllocator::with_monitor(&NullMonitor);
        general.free_all(Some(Allocator::heap()), AllocOptions::NONE);
    }

    #[cfg(feature = "debug-memory")]
    #[test]
    #[should_panic(expected = "not a live allocation")]
    fn double_free_is_fatal() {
        let arena = Arena::new(8 * 1024);
        let handle = unsafe { Allocator::from_ref(&arena) };
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let p = general.allocate(Some(handle), 8, None, AllocOptions::NONE).unwrap();
        unsafe {
            general.free(p.as_ptr(), AllocOptions::NONE);
            general.free(p.as_ptr(), AllocOptions::NONE);
        }
    }

    #[cfg(feature = "debug-memory")]
    #[test]
    fn moved_block_keeps_id_and_bumps_rid() {
        let arena = Arena::new(8 * 1024);
        let handle = unsafe { Allocator::from_ref(&arena) };
        let monitor = quiet_monitor();
        let general = GeneralAllocator::with_monitor(&monitor);
        let first = general.allocate(Some(handle), 16, None, AllocOptions::NONE).unwrap();
        let _second = general.allocate(Some(handle), 16, None, AllocOptions::NONE).unwrap();
        unsafe {
            let id = header::decode(first).as_ref().id();
            let moved = general.reallocate(first, 32, AllocOptions::NONE).unwrap();
            assert_ne!(moved, first);
            let h = header::decode(moved).as_ref();
            assert_eq!(h.id(), id);
            assert_eq!(h.rid(), 1);
            assert!(h.is_marked_as_leak());
        }
        assert_eq!(monitor.live_count_owned_by(handle), 2);
        general.free_all(Some(handle), AllocOptions::NONE);
        assert_eq!(monitor.live_count(), 0);
    }

    #[cfg(feature = "debug-memory")]
    #[test]
    #[should_panic(expected = "heap corruption")]
    fn overrun_is_caught_on_next_allocation() {
        let monitor = DebugMonitor::new(1);
        let general = GeneralAllocator::with_monitor(&monitor);
        let arena = Arena::new(8 * 1024);
        let handle = unsafe { Allocator::from_ref(&arena) };
        let p = general.allocate(Some(handle), 8, None, AllocOptions::NONE).unwrap();
        unsafe { *p.as_ptr().add(8) = 0 };
        let _ = general.allocate(Some(handle), 8, None, AllocOptions::NONE);
    }
}
