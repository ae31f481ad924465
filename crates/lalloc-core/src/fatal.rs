//! Process-wide failure reporting for contract violations.
//!
//! Every violation is logged, handed to an optional user hook, and then
//! halts the current thread with a panic. Builds that want a hard stop
//! compile with `panic = "abort"`.

use std::panic::Location;

use parking_lot::RwLock;

use crate::error::ContractViolation;

/// Callback invoked with every violation before the halt.
pub type FailureHook = fn(&ContractViolation);

static FAILURE_HOOK: RwLock<Option<FailureHook>> = parking_lot::const_rwlock(None);

/// Install (or clear, with `None`) the failure hook, returning the previous one.
pub fn set_failure_hook(hook: Option<FailureHook>) -> Option<FailureHook> {
    std::mem::replace(&mut *FAILURE_HOOK.write(), hook)
}

/// Report an unrecoverable violation and halt.
#[cold]
#[track_caller]
pub fn fatal(violation: ContractViolation) -> ! {
    let location = Location::caller();
    tracing::error!(
        file = location.file(),
        line = location.line(),
        %violation,
        "allocation contract violated"
    );
    let hook = *FAILURE_HOOK.read();
    if let Some(hook) = hook {
        hook(&violation);
    }
    panic!("{violation}");
}
