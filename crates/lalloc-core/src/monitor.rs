//! Debug heap monitor.
//!
//! Tracks every live header in an intrusive doubly linked list guarded by
//! one mutex, walks the list every N allocations to verify guards, and
//! reports the allocations still alive at shutdown. [`HeapMonitor`] is the
//! injectable interface; [`NullMonitor`] is the no-op used when
//! `debug-memory` is off.

#![allow(unsafe_code)]

use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;

use serde::Serialize;

use crate::backend::Allocator;
use crate::error::Corruption;
use crate::header::{self, Header};

#[cfg(feature = "debug-memory")]
pub use debug::{DebugMonitor, global_monitor};

/// Bookkeeping service the façade reports every header to.
pub trait HeapMonitor: Send + Sync {
    /// Count one allocation and return its ID.
    fn next_allocation_id(&self) -> u64;

    /// Allocations counted so far.
    fn allocation_count(&self) -> u64;

    /// Link a freshly encoded header. `false` if it was already linked.
    ///
    /// # Safety
    ///
    /// `header` must be live until it is unlinked.
    unsafe fn add_header(&self, header: NonNull<Header>) -> bool;

    /// Unlink a header. `false` if it was not linked.
    ///
    /// # Safety
    ///
    /// `header` must be live.
    unsafe fn unlink_header(&self, header: NonNull<Header>) -> bool;

    /// Put `new` in the list position of `old`. `false` if `old` was not linked.
    ///
    /// # Safety
    ///
    /// Both headers must be live.
    unsafe fn swap_header(&self, old: NonNull<Header>, new: NonNull<Header>) -> bool;

    /// Apply an in-place resize to a linked header: size, RID, call site,
    /// fills and the trailing guard change together, never observed half done
    /// by a concurrent verification.
    ///
    /// # Safety
    ///
    /// `header` must be live and its block must now hold `new_size` user bytes.
    unsafe fn resize_header(
        &self,
        header: NonNull<Header>,
        new_size: usize,
        location: &'static Location<'static>,
    );

    /// Whether `header` may be a live allocation. Reads nothing through the pointer.
    fn is_live(&self, header: NonNull<Header>) -> bool;

    /// Unlink every header owned by `owner`, returning how many.
    fn unlink_owned_by(&self, owner: Allocator) -> usize;

    fn live_count(&self) -> usize;

    fn live_count_owned_by(&self, owner: Allocator) -> usize;

    /// Check a single header.
    ///
    /// # Safety
    ///
    /// `header` must be live.
    unsafe fn verify_header(&self, header: NonNull<Header>) -> Result<(), Corruption>;

    /// Check the whole heap if the allocation count is a multiple of the
    /// verify frequency.
    fn maybe_verify_heap(&self) -> Result<(), Corruption>;

    /// Check every live header now.
    fn verify_heap(&self) -> Result<(), Corruption>;

    /// Live allocations not marked as leaks.
    fn report_leaks(&self) -> LeakReport;
}

/// One unfreed allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakRecord {
    pub id: u64,
    pub rid: u64,
    pub size: usize,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for LeakRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} requested {} bytes, {{ID: {}, RID: {}}}",
            self.file, self.line, self.size, self.id, self.rid
        )
    }
}

/// Result of a leak scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub leaks: Vec<LeakRecord>,
}

impl LeakReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    /// Sum of the leaked user sizes.
    #[must_use]
    pub fn leaked_bytes(&self) -> usize {
        self.leaks.iter().map(|leak| leak.size).sum()
    }
}

/// Path relative to the last `src/` directory, or the bare file name.
#[must_use]
pub fn short_file_name(path: &str) -> &str {
    for marker in ["src/", "src\\"] {
        if let Some(idx) = path.rfind(marker) {
            return &path[idx + marker.len()..];
        }
    }
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Monitor that tracks nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl HeapMonitor for NullMonitor {
    fn next_allocation_id(&self) -> u64 {
        0
    }

    fn allocation_count(&self) -> u64 {
        0
    }

    unsafe fn add_header(&self, _header: NonNull<Header>) -> bool {
        true
    }

    unsafe fn unlink_header(&self, _header: NonNull<Header>) -> bool {
        true
    }

    unsafe fn swap_header(&self, _old: NonNull<Header>, _new: NonNull<Header>) -> bool {
        true
    }

    unsafe fn resize_header(
        &self,
        header: NonNull<Header>,
        new_size: usize,
        location: &'static Location<'static>,
    ) {
        // SAFETY: forwarded caller contract.
        unsafe { header::resize_in_place(header, new_size, location) }
    }

    fn is_live(&self, _header: NonNull<Header>) -> bool {
        true
    }

    fn unlink_owned_by(&self, _owner: Allocator) -> usize {
        0
    }

    fn live_count(&self) -> usize {
        0
    }

    fn live_count_owned_by(&self, _owner: Allocator) -> usize {
        0
    }

    unsafe fn verify_header(&self, _header: NonNull<Header>) -> Result<(), Corruption> {
        Ok(())
    }

    fn maybe_verify_heap(&self) -> Result<(), Corruption> {
        Ok(())
    }

    fn verify_heap(&self) -> Result<(), Corruption> {
        Ok(())
    }

    fn report_leaks(&self) -> LeakReport {
        LeakReport::default()
    }
}

/// The monitor the global façade uses: the process-wide [`DebugMonitor`]
/// with `debug-memory`, a [`NullMonitor`] otherwise.
#[must_use]
pub fn default_monitor() -> &'static dyn HeapMonitor {
    #[cfg(feature = "debug-memory")]
    {
        global_monitor()
    }
    #[cfg(not(feature = "debug-memory"))]
    {
        static NULL: NullMonitor = NullMonitor;
        &NULL
    }
}

/// End-of-program hook: report leaks if configured to.
pub fn shutdown() -> Option<LeakReport> {
    #[cfg(feature = "debug-memory")]
    {
        let monitor = global_monitor();
        monitor
            .reports_leaks_at_shutdown()
            .then(|| monitor.report_leaks())
    }
    #[cfg(not(feature = "debug-memory"))]
    {
        None
    }
}

#[cfg(feature = "debug-memory")]
mod debug {
    use std::collections::HashSet;
    use std::panic::Location;
    use std::ptr::{self, NonNull};
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::{HeapMonitor, LeakRecord, LeakReport, short_file_name};
    use crate::backend::Allocator;
    use crate::config::{MemoryConfig, memory_config};
    use crate::error::{ContractViolation, Corruption};
    use crate::fatal::fatal;
    use crate::header::{self, Header};
    use crate::metrics::{AllocMetrics, global_metrics};

    struct MonitorState {
        head: *mut Header,
        /// Addresses of linked headers, for lookups that must not read
        /// through a possibly dangling pointer.
        live: HashSet<usize>,
    }

    // SAFETY: the list pointers are only followed with the monitor mutex held.
    unsafe impl Send for MonitorState {}

    impl MonitorState {
        fn headers(&self) -> impl Iterator<Item = NonNull<Header>> + '_ {
            let mut cursor = self.head;
            std::iter::from_fn(move || {
                let current = NonNull::new(cursor)?;
                // SAFETY: linked headers are live while the lock is held.
                cursor = unsafe { current.as_ref().next };
                Some(current)
            })
        }

        /// # Safety
        ///
        /// `h` must be linked.
        unsafe fn unlink(&mut self, h: *mut Header) {
            // SAFETY: `h` and its neighbours are linked, hence live.
            unsafe {
                let (next, prev) = ((*h).next, (*h).prev);
                if self.head == h {
                    self.head = next;
                }
                if !next.is_null() {
                    (*next).prev = prev;
                }
                if !prev.is_null() {
                    (*prev).next = next;
                }
                (*h).next = ptr::null_mut();
                (*h).prev = ptr::null_mut();
            }
        }

        fn verify_all(&self) -> Result<(), Corruption> {
            for h in self.headers() {
                // SAFETY: linked headers are live.
                unsafe { header::verify(h) }?;
            }
            AllocMetrics::inc(&global_metrics().heap_verifications);
            Ok(())
        }
    }

    /// Mutex-guarded list of live headers.
    pub struct DebugMonitor {
        state: Mutex<MonitorState>,
        allocation_count: AtomicU64,
        verify_frequency: AtomicU64,
        report_leaks_at_shutdown: AtomicBool,
    }

    impl DebugMonitor {
        /// Create a monitor that walks the heap every `verify_frequency` allocations.
        #[must_use]
        pub fn new(verify_frequency: u64) -> Self {
            Self {
                state: Mutex::new(MonitorState {
                    head: ptr::null_mut(),
                    live: HashSet::new(),
                }),
                allocation_count: AtomicU64::new(0),
                verify_frequency: AtomicU64::new(verify_frequency.max(1)),
                report_leaks_at_shutdown: AtomicBool::new(false),
            }
        }

        #[must_use]
        pub fn with_config(config: &MemoryConfig) -> Self {
            let monitor = Self::new(config.verify_frequency);
            monitor.set_report_leaks_at_shutdown(config.report_leaks_at_shutdown);
            monitor
        }

        #[must_use]
        pub fn verify_frequency(&self) -> u64 {
            self.verify_frequency.load(Ordering::Relaxed)
        }

        /// `0` is treated as `1`.
        pub fn set_verify_frequency(&self, frequency: u64) {
            self.verify_frequency
                .store(frequency.max(1), Ordering::Relaxed);
        }

        #[must_use]
        pub fn reports_leaks_at_shutdown(&self) -> bool {
            self.report_leaks_at_shutdown.load(Ordering::Relaxed)
        }

        pub fn set_report_leaks_at_shutdown(&self, enabled: bool) {
            self.report_leaks_at_shutdown
                .store(enabled, Ordering::Relaxed);
        }
    }

    impl Default for DebugMonitor {
        fn default() -> Self {
            Self::with_config(&MemoryConfig::new())
        }
    }

    impl HeapMonitor for DebugMonitor {
        fn next_allocation_id(&self) -> u64 {
            self.allocation_count.fetch_add(1, Ordering::Relaxed)
        }

        fn allocation_count(&self) -> u64 {
            self.allocation_count.load(Ordering::Relaxed)
        }

        unsafe fn add_header(&self, header: NonNull<Header>) -> bool {
            let mut state = self.state.lock();
            if !state.live.insert(header.as_ptr() as usize) {
                return false;
            }
            let h = header.as_ptr();
            // SAFETY: caller guarantees `header` is live; the old head is linked.
            unsafe {
                (*h).prev = ptr::null_mut();
                (*h).next = state.head;
                if !state.head.is_null() {
                    (*state.head).prev = h;
                }
            }
            state.head = h;
            true
        }

        unsafe fn unlink_header(&self, header: NonNull<Header>) -> bool {
            let mut state = self.state.lock();
            if !state.live.remove(&(header.as_ptr() as usize)) {
                return false;
            }
            // SAFETY: it was in the live set, so it is linked.
            unsafe { state.unlink(header.as_ptr()) };
            true
        }

        unsafe fn swap_header(&self, old: NonNull<Header>, new: NonNull<Header>) -> bool {
            let mut state = self.state.lock();
            if !state.live.remove(&(old.as_ptr() as usize)) {
                return false;
            }
            state.live.insert(new.as_ptr() as usize);
            let (old, new) = (old.as_ptr(), new.as_ptr());
            // SAFETY: `old` is linked, `new` is live per the caller.
            unsafe {
                let (prev, next) = ((*old).prev, (*old).next);
                (*new).prev = prev;
                (*new).next = next;
                if prev.is_null() {
                    state.head = new;
                } else {
                    (*prev).next = new;
                }
                if !next.is_null() {
                    (*next).prev = new;
                }
                (*old).next = ptr::null_mut();
                (*old).prev = ptr::null_mut();
            }
            true
        }

        unsafe fn resize_header(
            &self,
            header: NonNull<Header>,
            new_size: usize,
            location: &'static Location<'static>,
        ) {
            let _state = self.state.lock();
            // SAFETY: caller guarantees a live header; verification walks
            // hold the same lock, so they see the old or the new layout.
            unsafe { header::resize_in_place(header, new_size, location) }
        }

        fn is_live(&self, header: NonNull<Header>) -> bool {
            self.state.lock().live.contains(&(header.as_ptr() as usize))
        }

        fn unlink_owned_by(&self, owner: Allocator) -> usize {
            let mut state = self.state.lock();
            let owned: Vec<NonNull<Header>> = state
                .headers()
                // SAFETY: linked headers are live.
                .filter(|h| unsafe { h.as_ref() }.owner() == owner)
                .collect();
            for h in &owned {
                state.live.remove(&(h.as_ptr() as usize));
                // SAFETY: collected from the list above.
                unsafe { state.unlink(h.as_ptr()) };
            }
            owned.len()
        }

        fn live_count(&self) -> usize {
            self.state.lock().live.len()
        }

        fn live_count_owned_by(&self, owner: Allocator) -> usize {
            let state = self.state.lock();
            state
                .headers()
                // SAFETY: linked headers are live.
                .filter(|h| unsafe { h.as_ref() }.owner() == owner)
                .count()
        }

        unsafe fn verify_header(&self, header: NonNull<Header>) -> Result<(), Corruption> {
            let _state = self.state.lock();
            // SAFETY: caller guarantees `header` is live; the lock keeps
            // other threads from freeing it meanwhile.
            unsafe { header::verify(header) }
        }

        fn maybe_verify_heap(&self) -> Result<(), Corruption> {
            if self.allocation_count() % self.verify_frequency() != 0 {
                return Ok(());
            }
            self.verify_heap()
        }

        fn verify_heap(&self) -> Result<(), Corruption> {
            self.state.lock().verify_all()
        }

        fn report_leaks(&self) -> LeakReport {
            let state = self.state.lock();
            if let Err(corruption) = state.verify_all() {
                drop(state);
                fatal(ContractViolation::HeapCorruption(corruption));
            }

            let leaks: Vec<LeakRecord> = state
                .headers()
                // SAFETY: linked headers are live and were just verified.
                .map(|h| unsafe { h.as_ref() })
                .filter(|h| !h.is_marked_as_leak())
                .map(|h| LeakRecord {
                    id: h.id(),
                    rid: h.rid(),
                    size: h.size(),
                    file: h
                        .location()
                        .map_or_else(|| "Unknown".to_string(), |l| short_file_name(l.file()).to_string()),
                    line: h.location().map_or(0, |l| l.line()),
                })
                .collect();
            drop(state);

            if !leaks.is_empty() {
                tracing::warn!(
                    count = leaks.len(),
                    "allocations still alive at shutdown"
                );
                for leak in &leaks {
                    tracing::warn!("    * {leak}");
                }
                AllocMetrics::add(&global_metrics().leaks_reported, leaks.len() as u64);
            }
            LeakReport { leaks }
        }
    }

    /// The process-wide monitor, configured from [`memory_config`].
    #[must_use]
    pub fn global_monitor() -> &'static DebugMonitor {
        static MONITOR: OnceLock<DebugMonitor> = OnceLock::new();
        MONITOR.get_or_init(|| DebugMonitor::with_config(memory_config()))
    }

}
