// SPDX-License-Identifier: MPL-2.0

//! The machine-facing layer of the Kestrel kernel.
//!
//! This crate hosts everything the rest of the kernel builds on: the
//! errno-style error type, the quantum-counting monotonic clock, the
//! multi-region physical memory allocator, the interrupt controller, the
//! virtual processor scheduler and the blocking synchronization primitives
//! layered on top of its wait queues.
//!
//! The crate is `no_std` and runs hosted: a virtual processor is a
//! schedulable bookkeeping object, and the execution context that entered a
//! blocking operation parks on the VP's wakeup word until a waker delivers a
//! wakeup reason. All scheduler queue state is deterministic and driven by
//! explicit calls, so the policy machinery (priorities, quanta, timeouts,
//! boosting) can be exercised without a timer interrupt.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod clock;
pub mod config;
pub mod error;
pub mod irq;
pub mod mm;
pub mod prelude;
pub mod sched;
pub mod sync;
