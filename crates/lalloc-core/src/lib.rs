//! Pluggable memory-allocation layer.
//!
//! Every allocation handed out by the [`facade`] is preceded by a block
//! header recording its owning backend, size and alignment. Backends are
//! small four-operation objects ([`Backend`]) driven by the façade:
//!
//! - **Allocator handles** (`backend`): ALLOCATE / RESIZE / FREE / FREE_ALL contract
//! - **OS primitives** (`os`): raw block source and bulk byte helpers
//! - **Default heap** (`heap`): backend over the OS block source
//! - **Arena** (`arena`): page-chained bump allocator with adaptive base growth
//! - **Free list** (`free_list`): fixed-capacity first/best-fit allocator with coalescing
//! - **Block headers** (`header`): the audited pointer-arithmetic module
//! - **Heap monitor** (`monitor`): live-header list, guard verification, leak reports
//! - **Façade** (`facade`): the entry point consumers call
//! - **Context** (`context`): per-thread default backend/alignment/options
//! - **Configuration** (`config`): `LALLOC_*` environment settings
//! - **Metrics** (`metrics`): atomic counters for observability
//!
//! The `debug-memory` feature (on by default) enables guard bytes, fill
//! patterns and the debug heap monitor.

#![deny(unsafe_code)]

pub mod arena;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod fatal;
pub mod free_list;
pub mod header;
pub mod heap;
pub mod metrics;
pub mod monitor;
pub mod os;

pub use arena::Arena;
pub use backend::{AllocOptions, Allocator, Backend, FreeAllStatus};
pub use config::{MemoryConfig, ShrinkPolicy};
pub use context::AllocContext;
pub use error::{AllocError, ContractViolation, Corruption};
pub use facade::GeneralAllocator;
pub use free_list::{FreeListAllocator, PlacementPolicy};
pub use heap::HeapBackend;
pub use metrics::AllocMetrics;
pub use monitor::{HeapMonitor, LeakRecord, LeakReport, NullMonitor};

#[cfg(feature = "debug-memory")]
pub use monitor::DebugMonitor;

/// Width of a pointer on the target, the minimum alignment of any allocation.
pub const POINTER_SIZE: usize = std::mem::size_of::<*const u8>();
