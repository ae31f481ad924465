//! Per-thread allocation context.
//!
//! Each thread carries the allocator, alignment and option bits the façade
//! falls back to when a call leaves them unspecified, plus its own
//! temporary [`Arena`]. Threads started with [`spawn`] begin with a copy of
//! the parent's *current* context, so overrides are inherited.
//!
//! Overrides are scoped: [`with_allocator`] and friends run a closure, the
//! `push_*` functions return a [`ContextGuard`]. Either way the previous
//! context comes back on every exit path, unwinding included.

#![allow(unsafe_code)]

use std::cell::{Cell, OnceCell};
use std::io;
use std::marker::PhantomData;
use std::thread;

use crate::POINTER_SIZE;
use crate::arena::Arena;
use crate::backend::{AllocOptions, Allocator};
use crate::config::memory_config;
use crate::error::ContractViolation;
use crate::facade::GeneralAllocator;
use crate::fatal::fatal;

/// Defaults the façade resolves unspecified parameters from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocContext {
    pub allocator: Allocator,
    /// Power of two; clamped up to the minimum alignment by the façade.
    pub alignment: usize,
    /// OR-ed into the options of every call.
    pub options: AllocOptions,
    /// Emit a `trace` event for every allocation and reallocation.
    pub log_all_allocations: bool,
}

impl AllocContext {
    /// Default heap, pointer-size alignment, no options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocator: Allocator::heap(),
            alignment: POINTER_SIZE,
            options: AllocOptions::NONE,
            log_all_allocations: memory_config().log_all_allocations,
        }
    }
}

impl Default for AllocContext {
    fn default() -> Self {
        Self::new()
    }
}

struct ThreadState {
    context: Cell<AllocContext>,
    logging_allocation: Cell<bool>,
    temporary: OnceCell<Arena>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            context: Cell::new(AllocContext::new()),
            logging_allocation: Cell::new(false),
            temporary: OnceCell::new(),
        }
    }

    fn temporary_arena(&self) -> &Arena {
        self.temporary
            .get_or_init(|| Arena::new(memory_config().temporary_page_size))
    }

    fn temporary_allocator(&self) -> Allocator {
        // SAFETY: the arena lives in this thread's TLS until the thread
        // exits. `Allocator` is `!Send`, and `spawn` rebinds an inherited
        // temporary allocator to the child's own arena.
        unsafe { Allocator::from_ref(self.temporary_arena()) }
    }

    fn owns_temporary(&self, allocator: Allocator) -> bool {
        self.temporary
            .get()
            .is_some_and(|arena| allocator.address() == arena as *const Arena as usize)
    }
}

thread_local! {
    static STATE: ThreadState = ThreadState::new();
}

/// The calling thread's context. Falls back to the defaults while the
/// thread is being torn down.
#[must_use]
pub fn current() -> AllocContext {
    STATE
        .try_with(|state| state.context.get())
        .unwrap_or_else(|_| AllocContext::new())
}

/// The calling thread's temporary arena as an allocator.
///
/// The arena's base page is created on first use. During thread teardown
/// the default heap is returned instead.
#[must_use]
pub fn temporary() -> Allocator {
    STATE
        .try_with(ThreadState::temporary_allocator)
        .unwrap_or_else(|_| Allocator::heap())
}

/// Inspect the calling thread's temporary arena.
pub fn with_temporary_arena<R>(f: impl FnOnce(&Arena) -> R) -> R {
    STATE.with(|state| f(state.temporary_arena()))
}

/// FREE_ALL the calling thread's temporary arena, if it was ever used.
#[track_caller]
pub fn release_temporary() {
    let used = STATE
        .try_with(|state| state.temporary.get().is_some())
        .unwrap_or(false);
    if used {
        GeneralAllocator::global().free_all(Some(temporary()), AllocOptions::NONE);
    }
}

/// Restores the context that was current when it was created.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: AllocContext,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = STATE.try_with(|state| state.context.set(previous));
    }
}

/// Install `context` until the returned guard is dropped.
pub fn push_context(context: AllocContext) -> ContextGuard {
    let previous = STATE.with(|state| state.context.replace(context));
    ContextGuard {
        previous,
        _not_send: PhantomData,
    }
}

pub fn push_allocator(allocator: Allocator) -> ContextGuard {
    push_context(AllocContext {
        allocator,
        ..current()
    })
}

/// Halts if `alignment` is not a power of two.
#[track_caller]
pub fn push_alignment(alignment: usize) -> ContextGuard {
    if !alignment.is_power_of_two() {
        fatal(ContractViolation::InvalidAlignment(alignment));
    }
    push_context(AllocContext {
        alignment,
        ..current()
    })
}

pub fn push_options(options: AllocOptions) -> ContextGuard {
    push_context(AllocContext {
        options,
        ..current()
    })
}

pub fn push_log_all_allocations(enabled: bool) -> ContextGuard {
    push_context(AllocContext {
        log_all_allocations: enabled,
        ..current()
    })
}

pub fn with_context<R>(context: AllocContext, f: impl FnOnce() -> R) -> R {
    let _guard = push_context(context);
    f()
}

pub fn with_allocator<R>(allocator: Allocator, f: impl FnOnce() -> R) -> R {
    let _guard = push_allocator(allocator);
    f()
}

#[track_caller]
pub fn with_alignment<R>(alignment: usize, f: impl FnOnce() -> R) -> R {
    let _guard = push_alignment(alignment);
    f()
}

pub fn with_options<R>(options: AllocOptions, f: impl FnOnce() -> R) -> R {
    let _guard = push_options(options);
    f()
}

/// Run `f` with this thread's temporary arena as the allocator.
pub fn with_temporary<R>(f: impl FnOnce() -> R) -> R {
    with_allocator(temporary(), f)
}

/// Clears the per-thread "logging an allocation" flag on drop.
pub(crate) struct LoggingGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        let _ = STATE.try_with(|state| state.logging_allocation.set(false));
    }
}

/// Enter allocation logging, or `None` if this thread is already inside it.
pub(crate) fn enter_allocation_logging() -> Option<LoggingGuard> {
    let entered = STATE
        .try_with(|state| !state.logging_allocation.replace(true))
        .unwrap_or(false);
    entered.then(|| LoggingGuard {
        _not_send: PhantomData,
    })
}

/// A parent's context on its way to a child thread.
struct Inherited {
    context: AllocContext,
    rebind_temporary: bool,
}

// SAFETY: the child never uses the parent's temporary arena; that handle is
// replaced by the child's own. Every other handle was built with
// `from_static` (a `Sync` backend) or `from_ref`, whose contract covers use
// from spawned threads.
unsafe impl Send for Inherited {}

impl Inherited {
    fn capture() -> Self {
        let context = current();
        let rebind_temporary = STATE
            .try_with(|state| state.owns_temporary(context.allocator))
            .unwrap_or(false);
        Self {
            context,
            rebind_temporary,
        }
    }

    fn install(self) {
        let mut context = self.context;
        if self.rebind_temporary {
            context.allocator = temporary();
        }
        STATE.with(|state| state.context.set(context));
    }
}

/// Spawn a thread that starts with a copy of the caller's context.
pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inherited = Inherited::capture();
    thread::spawn(move || {
        let inherited = inherited;
        inherited.install();
        f()
    })
}

/// [`spawn`] through a configured [`thread::Builder`].
pub fn spawn_with<F, T>(builder: thread::Builder, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inherited = Inherited::capture();
    builder.spawn(move || {
        let inherited = inherited;
        inherited.install();
        f()
    })
}
