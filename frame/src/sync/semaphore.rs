// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, Ordering};

use crate::clock::Quantums;
use crate::prelude::*;
use crate::sched::{SchedCtx, Scheduler, WaitQueue, WakeReason};
use crate::sync::SpinLock;

/// A counting semaphore.
///
/// An acquisition of `n` permits succeeds only once `n` permits are actually
/// available; a waiter that is woken while fewer are left simply waits
/// again. Releasing from interrupt context is allowed through
/// [`Semaphore::release_from_irq`], which never context-switches.
pub struct Semaphore {
    permits: SpinLock<i32>,
    queue: WaitQueue,
    closed: AtomicBool,
}

impl Semaphore {
    /// Creates a semaphore holding `value` permits.
    pub fn new(value: i32) -> Self {
        Self {
            permits: SpinLock::new(value),
            queue: WaitQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn value(&self) -> i32 {
        *self.permits.lock()
    }

    /// Blocks until `permits` permits are available or the deadline passes.
    pub fn acquire(&self, ctx: &SchedCtx, permits: i32, deadline: Quantums) -> Result<()> {
        debug_assert!(permits > 0);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return_errno_with_message!(Errno::EINTR, "semaphore was torn down");
            }
            {
                let mut value = self.permits.lock();
                if *value >= permits {
                    *value -= permits;
                    return Ok(());
                }
            }
            ctx.sched()
                .wait_on_if(ctx.vp(), &self.queue, deadline, true, || {
                    *self.permits.lock() < permits && !self.closed.load(Ordering::Acquire)
                })?;
        }
    }

    /// Tries to take `permits` permits without blocking.
    pub fn try_acquire(&self, permits: i32) -> bool {
        debug_assert!(permits > 0);
        let mut value = self.permits.lock();
        if *value >= permits {
            *value -= permits;
            true
        } else {
            false
        }
    }

    /// Takes every available permit and returns how many were taken.
    pub fn try_acquire_all(&self) -> i32 {
        let mut value = self.permits.lock();
        let taken = (*value).max(0);
        *value -= taken;
        taken
    }

    /// Returns `permits` permits and wakes waiters.
    pub fn release(&self, sched: &Scheduler, permits: i32) {
        debug_assert!(permits > 0);
        *self.permits.lock() += permits;
        sched.wake_all(&self.queue, true);
    }

    /// Returns `permits` permits from interrupt context. Waiters become
    /// ready but no context switch happens.
    pub fn release_from_irq(&self, sched: &Scheduler, permits: i32) {
        *self.permits.lock() += permits;
        sched.wake_all_from_irq(&self.queue);
    }

    /// Tears the semaphore down: every current and future waiter fails with
    /// `Interrupted`.
    pub fn close(&self, sched: &Scheduler) {
        self.closed.store(true, Ordering::Release);
        sched.wake_some(&self.queue, usize::MAX, WakeReason::Interrupted, true);
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::{MonotonicClock, QUANTUMS_INFINITY};
    use crate::sched::{Vp, PRIORITY_NORMAL};

    fn sched() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(Arc::new(MonotonicClock::new())))
    }

    #[test]
    fn counting_arithmetic_holds_without_blocked_acquires() {
        let sched = sched();
        let vp = Vp::new(PRIORITY_NORMAL);
        let ctx = SchedCtx::new(&sched, &vp);
        let sema = Semaphore::new(5);

        sema.acquire(&ctx, 2, QUANTUMS_INFINITY).unwrap();
        sema.acquire(&ctx, 1, QUANTUMS_INFINITY).unwrap();
        sema.release(&sched, 4);
        assert_eq!(sema.value(), 5 - 2 - 1 + 4);
        assert!(sema.value() >= 0);
    }

    #[test]
    fn try_acquire_respects_the_permit_count() {
        let sema = Semaphore::new(2);
        assert!(sema.try_acquire(2));
        assert!(!sema.try_acquire(1));
        assert_eq!(sema.try_acquire_all(), 0);
    }

    #[test]
    fn multi_permit_acquire_waits_for_enough_permits() {
        let sched = sched();
        let sema = Arc::new(Semaphore::new(0));

        let waiter = {
            let (sched, sema) = (sched.clone(), sema.clone());
            std::thread::spawn(move || {
                let vp = Vp::new(PRIORITY_NORMAL);
                let ctx = SchedCtx::new(&sched, &vp);
                sema.acquire(&ctx, 3, QUANTUMS_INFINITY).unwrap();
            })
        };

        while !sema.has_waiters() {
            std::thread::yield_now();
        }
        // One permit is not enough; the waiter must stay blocked until all
        // three are there.
        sema.release(&sched, 1);
        sema.release(&sched, 2);
        waiter.join().unwrap();
        assert_eq!(sema.value(), 0);
    }

    #[test]
    fn irq_release_makes_permits_available() {
        let sched = sched();
        let sema = Arc::new(Semaphore::new(0));

        let waiter = {
            let (sched, sema) = (sched.clone(), sema.clone());
            std::thread::spawn(move || {
                let vp = Vp::new(PRIORITY_NORMAL);
                let ctx = SchedCtx::new(&sched, &vp);
                sema.acquire(&ctx, 1, QUANTUMS_INFINITY)
            })
        };

        while !sema.has_waiters() {
            std::thread::yield_now();
        }
        sema.release_from_irq(&sched, 1);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn expired_deadline_times_the_acquire_out() {
        let sched = sched();
        let vp = Vp::new(PRIORITY_NORMAL);
        let ctx = SchedCtx::new(&sched, &vp);
        let sema = Semaphore::new(0);
        sched.clock().on_tick();

        let err = sema.acquire(&ctx, 1, 1).unwrap_err();
        assert_eq!(err.error(), Errno::ETIMEDOUT);
    }

    #[test]
    fn close_interrupts_all_waiters() {
        let sched = sched();
        let sema = Arc::new(Semaphore::new(0));

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let (sched, sema) = (sched.clone(), sema.clone());
            waiters.push(std::thread::spawn(move || {
                let vp = Vp::new(PRIORITY_NORMAL);
                let ctx = SchedCtx::new(&sched, &vp);
                sema.acquire(&ctx, 1, QUANTUMS_INFINITY)
            }));
        }

        while sema.queue.len() != 2 {
            std::thread::yield_now();
        }
        sema.close(&sched);
        for waiter in waiters {
            let err = waiter.join().unwrap().unwrap_err();
            assert_eq!(err.error(), Errno::EINTR);
        }
    }
}
