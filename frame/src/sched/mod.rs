// SPDX-License-Identifier: MPL-2.0

//! The virtual processor scheduler.
//!
//! A virtual processor (VP) is the schedulable execution context of the
//! kernel. Scheduling is single-CPU and preemptive with 64 priority levels;
//! ready VPs sit in per-priority FIFO buckets selected through a population
//! bitmap, waiting VPs sit on priority-ordered wait queues, and timed waits
//! additionally occupy a deadline-ordered timeout queue.

mod ctx;
mod pool;
pub mod preempt;
mod runqueue;
mod scheduler;
mod vp;
mod wait;

pub use ctx::SchedCtx;
pub use pool::{VpParams, VpPool, REUSE_CACHE_CAPACITY};
pub use scheduler::Scheduler;
pub use vp::{
    quantum_allowance_for, DispatchBinding, LifecycleState, SchedState, SigMaskOp, Vp, VpClosure,
    VpFlags, Vpid, WakeReason, PRIORITIES_RESERVED_HIGH, PRIORITIES_RESERVED_LOW, PRIORITY_COUNT,
    PRIORITY_HIGHEST, PRIORITY_LOWEST, PRIORITY_NORMAL, PRIORITY_REALTIME, SIGNAL_MAX,
};
pub use wait::WaitQueue;
