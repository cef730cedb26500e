// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives.
//!
//! [`SpinLock`] protects short non-blocking critical sections. Everything
//! else — [`Mutex`], [`Semaphore`], [`CondVar`] and [`SeLock`] — is layered
//! over the scheduler's wait queues and may suspend the calling VP.

mod condvar;
mod mutex;
mod selock;
mod semaphore;
mod spin;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard, MutexOptions};
pub use selock::SeLock;
pub use semaphore::Semaphore;
pub use spin::{SpinLock, SpinLockGuard};
