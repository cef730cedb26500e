// SPDX-License-Identifier: MPL-2.0

//! Preemption control.
//!
//! The machine is single-CPU, so scheduler state is protected by disabling
//! preemption rather than by a spinlock in the SMP sense. The count below is
//! the number of outstanding preemption-disabled scopes; the guard is the
//! token that re-enables preemption when the outermost scope ends.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

static PREEMPT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A guard that keeps preemption disabled for as long as it lives.
#[must_use]
pub struct DisabledPreemptGuard {
    // Keeps the guard on the context that created it.
    _not_send: PhantomData<*mut ()>,
}

impl DisabledPreemptGuard {
    fn new() -> Self {
        PREEMPT_COUNT.fetch_add(1, Relaxed);
        Self {
            _not_send: PhantomData,
        }
    }

    /// Transfers this guard to a new guard. The old guard must be dropped
    /// after this call.
    pub fn transfer_to(&self) -> Self {
        Self::new()
    }
}

impl Drop for DisabledPreemptGuard {
    fn drop(&mut self) {
        PREEMPT_COUNT.fetch_sub(1, Relaxed);
    }
}

/// Disables preemption and returns the token that restores it.
pub fn disable_preempt() -> DisabledPreemptGuard {
    DisabledPreemptGuard::new()
}

/// Whether the current CPU is in an atomic context, i.e. holds at least one
/// preemption-disabled scope.
pub fn in_atomic() -> bool {
    PREEMPT_COUNT.load(Relaxed) != 0
}

/// Whether a voluntary context switch may happen right now.
pub fn is_preemptible() -> bool {
    !in_atomic()
}
