//! Error taxonomy for the allocation layer.
//!
//! [`AllocError`] is the recoverable channel: the backend could not provide
//! memory. [`ContractViolation`] is never returned to callers; it is handed
//! to [`crate::fatal::fatal`], which halts. [`Corruption`] describes a failed
//! heap-integrity check and is returned as a value by the monitor so a test
//! harness can observe it.

use std::io;

use thiserror::Error;

/// Recoverable allocation failure.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The block source could not satisfy the request.
    #[error("out of memory: backend could not provide {requested} bytes")]
    Exhausted {
        requested: usize,
        #[source]
        source: io::Error,
    },
    /// The padded request size does not fit in `usize`.
    #[error("allocation of {size} bytes aligned to {alignment} overflows the address space")]
    SizeOverflow { size: usize, alignment: usize },
}

impl AllocError {
    /// Number of bytes that were requested from the backend, if known.
    #[must_use]
    pub fn requested(&self) -> Option<usize> {
        match self {
            Self::Exhausted { requested, .. } => Some(*requested),
            Self::SizeOverflow { .. } => None,
        }
    }
}

/// A failed integrity check on one block header.
///
/// `id` is the allocation ID read from the header (garbage when the header
/// itself is what got trampled) and `header` its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("allocation {id} at {header:#x}: header is dead fill, the block was already freed")]
    FreedHeader { id: u64, header: usize },
    #[error("allocation {id} at {header:#x}: alignment is zero")]
    ZeroAlignment { id: u64, header: usize },
    #[error("allocation {id} at {header:#x}: alignment {alignment} is below pointer size")]
    AlignmentBelowPointer {
        id: u64,
        header: usize,
        alignment: usize,
    },
    #[error("allocation {id} at {header:#x}: alignment {alignment} is not a power of two")]
    AlignmentNotPowerOfTwo {
        id: u64,
        header: usize,
        alignment: usize,
    },
    #[error("allocation {id} at {header:#x}: self pointer does not follow the header")]
    SelfReferenceMismatch { id: u64, header: usize },
    #[error("allocation {id} at {header:#x}: guard before the block was overwritten at byte {offset}")]
    UnderrunGuard {
        id: u64,
        header: usize,
        offset: usize,
    },
    #[error("allocation {id} at {header:#x}: guard after the block was overwritten at byte {offset}")]
    OverrunGuard {
        id: u64,
        header: usize,
        offset: usize,
    },
}

impl Corruption {
    /// Address of the header that failed the check.
    #[must_use]
    pub const fn header_address(&self) -> usize {
        match *self {
            Self::FreedHeader { header, .. }
            | Self::ZeroAlignment { header, .. }
            | Self::AlignmentBelowPointer { header, .. }
            | Self::AlignmentNotPowerOfTwo { header, .. }
            | Self::SelfReferenceMismatch { header, .. }
            | Self::UnderrunGuard { header, .. }
            | Self::OverrunGuard { header, .. } => header,
        }
    }

    /// True for failures of the guard bytes around the user region.
    #[must_use]
    pub const fn is_guard_failure(&self) -> bool {
        matches!(self, Self::UnderrunGuard { .. } | Self::OverrunGuard { .. })
    }
}

/// A broken caller or backend contract. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("alignment {alignment} exceeds the supported maximum of {max}")]
    AlignmentTooLarge { alignment: usize, max: usize },
    #[error("backend does not support FREE_ALL")]
    FreeAllUnsupported,
    #[error("pointer {0:#x} is not a live allocation (double free or foreign pointer)")]
    DoubleFree(usize),
    #[error("header {0:#x} is already linked into the heap monitor")]
    AlreadyTracked(usize),
    #[error("backend RESIZE moved block {given:#x} to {returned:#x} instead of resizing in place")]
    BackendMovedBlock { given: usize, returned: usize },
    #[error("heap corruption: {0}")]
    HeapCorruption(#[from] Corruption),
}
