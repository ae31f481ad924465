//! Memory-layer configuration.
//!
//! Read once from the environment and cached for the life of the process:
//! - `LALLOC_VERIFY_FREQUENCY`: walk the whole live heap every N allocations
//!   (default 255; `1` verifies on every allocation).
//! - `LALLOC_REPORT_LEAKS`: log unfreed allocations from [`crate::monitor::shutdown`].
//! - `LALLOC_LOG_ALLOCATIONS`: initial per-thread "log all allocations" flag.
//! - `LALLOC_HEAP_SHRINK`: what the default heap does when the block source
//!   refuses an in-place shrink, `keep` (default) or `move`.
//! - `LALLOC_TEMP_PAGE_SIZE`: base page size of each thread's temporary arena.
//!
//! Guard checking is a heuristic. A corrupted guard is only noticed on the
//! next verification pass, which may be up to N allocations later, and the
//! failing header is not necessarily the one that was written through.

use std::sync::OnceLock;

use crate::arena::PAGE_GRANULE;

/// Default heap verification frequency.
pub const DEFAULT_VERIFY_FREQUENCY: u64 = 255;

/// Default base page size of a thread's temporary arena.
pub const DEFAULT_TEMPORARY_PAGE_SIZE: usize = 8 * 1024;

/// How the default heap answers a shrink the block source cannot do in place.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShrinkPolicy {
    /// Keep the original block; the tail bytes stay reserved but unused.
    #[default]
    KeepBlock,
    /// Report "cannot resize" so the façade moves the allocation.
    Move,
}

impl ShrinkPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "move" | "relocate" | "copy" => Self::Move,
            _ => Self::KeepBlock,
        }
    }
}

/// Settings shared by the heap monitor, the default heap and the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub verify_frequency: u64,
    pub report_leaks_at_shutdown: bool,
    pub log_all_allocations: bool,
    pub heap_shrink_policy: ShrinkPolicy,
    pub temporary_page_size: usize,
}

impl MemoryConfig {
    /// Built-in defaults, ignoring the environment.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            verify_frequency: DEFAULT_VERIFY_FREQUENCY,
            report_leaks_at_shutdown: false,
            log_all_allocations: false,
            heap_shrink_policy: ShrinkPolicy::KeepBlock,
            temporary_page_size: DEFAULT_TEMPORARY_PAGE_SIZE,
        }
    }

    /// Resolve every setting through `lookup`, falling back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();
        if let Some(freq) = lookup("LALLOC_VERIFY_FREQUENCY").and_then(|v| parse_nonzero(&v)) {
            config.verify_frequency = freq;
        }
        if let Some(flag) = lookup("LALLOC_REPORT_LEAKS").and_then(|v| parse_flag(&v)) {
            config.report_leaks_at_shutdown = flag;
        }
        if let Some(flag) = lookup("LALLOC_LOG_ALLOCATIONS").and_then(|v| parse_flag(&v)) {
            config.log_all_allocations = flag;
        }
        if let Some(policy) = lookup("LALLOC_HEAP_SHRINK") {
            config.heap_shrink_policy = ShrinkPolicy::from_str_loose(&policy);
        }
        if let Some(size) = lookup("LALLOC_TEMP_PAGE_SIZE").and_then(|v| parse_nonzero(&v)) {
            config.temporary_page_size = round_to_granule(size);
        }
        config
    }

    /// Read the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_nonzero<T>(raw: &str) -> Option<T>
where
    T: std::str::FromStr + Default + PartialEq,
{
    raw.trim().parse::<T>().ok().filter(|v| *v != T::default())
}

fn round_to_granule(size: u64) -> usize {
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    size.div_ceil(PAGE_GRANULE)
        .saturating_mul(PAGE_GRANULE)
        .max(PAGE_GRANULE)
}

/// Get the process configuration (reads the environment on first call).
#[must_use]
pub fn memory_config() -> &'static MemoryConfig {
    static CONFIG: OnceLock<MemoryConfig> = OnceLock::new();
    CONFIG.get_or_init(MemoryConfig::from_env)
}
