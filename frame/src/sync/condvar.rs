// SPDX-License-Identifier: MPL-2.0

use crate::clock::Quantums;
use crate::prelude::*;
use crate::sched::{SchedCtx, Scheduler, WaitQueue, WakeReason};
use crate::sync::MutexGuard;

/// A condition variable.
///
/// A waiter enters the condition variable's wait queue *before* the mutex is
/// released, so a wakeup issued after the release can never be lost. The
/// mutex is reacquired before `wait` returns, whatever the wait outcome was.
pub struct CondVar {
    queue: WaitQueue,
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    /// Atomically releases the mutex and blocks until the condition variable
    /// is signaled, the deadline passes, or the wait is interrupted.
    ///
    /// Returns the reacquired guard together with the wait outcome. Callers
    /// re-test their predicate in a loop; a `Finished` wakeup makes no
    /// promise about the predicate.
    pub fn wait<'a, T: ?Sized>(
        &self,
        ctx: &SchedCtx<'a>,
        guard: MutexGuard<'a, T>,
        deadline: Quantums,
    ) -> (MutexGuard<'a, T>, Result<()>) {
        let mutex = guard.mutex();

        // The guard is dropped from inside the wait entry path, i.e. after
        // this VP is already on the condition variable's queue.
        let mut parked = Some(guard);
        let outcome = ctx.sched().wait_on_if(
            ctx.vp(),
            &self.queue,
            deadline,
            true,
            move || {
                drop(parked.take());
                true
            },
        );

        let guard = loop {
            match mutex.lock(ctx) {
                Ok(guard) => break guard,
                // An interruptible mutex may refuse the reacquisition; the
                // wait contract requires the mutex to be held on return, so
                // keep trying.
                Err(_) => continue,
            }
        };
        (guard, outcome.map(|_| ()))
    }

    /// Wakes one waiter.
    pub fn signal(&self, sched: &Scheduler) {
        sched.wake_some(&self.queue, 1, WakeReason::Finished, true);
    }

    /// Wakes all waiters.
    pub fn broadcast(&self, sched: &Scheduler) {
        sched.wake_some(&self.queue, usize::MAX, WakeReason::Finished, true);
    }

    /// Atomically signals (or broadcasts) and releases the held mutex.
    pub fn wake_and_unlock<T: ?Sized>(
        &self,
        ctx: &SchedCtx<'_>,
        guard: MutexGuard<'_, T>,
        broadcast: bool,
    ) {
        // Keep the unlock from switching away before the wakeup is issued.
        ctx.sched().disable_cooperation();
        drop(guard);
        ctx.sched().restore_cooperation();
        let count = if broadcast { usize::MAX } else { 1 };
        ctx.sched()
            .wake_some(&self.queue, count, WakeReason::Finished, true);
    }

    /// Wakes every remaining waiter with `Interrupted`. Called when the
    /// owning object goes away.
    pub fn close(&self, sched: &Scheduler) {
        sched.wake_some(&self.queue, usize::MAX, WakeReason::Interrupted, true);
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.is_empty()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::{MonotonicClock, QUANTUMS_INFINITY};
    use crate::sched::{Scheduler, Vp, PRIORITY_NORMAL};
    use crate::sync::Mutex;

    struct Fixture {
        sched: Arc<Scheduler>,
        mutex: Arc<Mutex<u32>>,
        cv: Arc<CondVar>,
    }

    fn fixture() -> Fixture {
        Fixture {
            sched: Arc::new(Scheduler::new(Arc::new(MonotonicClock::new()))),
            mutex: Arc::new(Mutex::new(0)),
            cv: Arc::new(CondVar::new()),
        }
    }

    #[test]
    fn wait_releases_the_mutex_and_holds_it_again_on_return() {
        let f = fixture();
        let waiter = {
            let (sched, mutex, cv) = (f.sched.clone(), f.mutex.clone(), f.cv.clone());
            std::thread::spawn(move || {
                let vp = Vp::new(PRIORITY_NORMAL);
                let ctx = SchedCtx::new(&sched, &vp);
                let mut guard = mutex.lock(&ctx).unwrap();
                while *guard == 0 {
                    let (reacquired, outcome) = cv.wait(&ctx, guard, QUANTUMS_INFINITY);
                    outcome.unwrap();
                    guard = reacquired;
                }
                assert_eq!(mutex.owner_vpid(), vp.vpid());
                *guard
            })
        };

        // The mutex must be free once the waiter is parked.
        while !f.cv.has_waiters() {
            std::thread::yield_now();
        }
        assert!(!f.mutex.is_locked());

        let vp = Vp::new(PRIORITY_NORMAL);
        let ctx = SchedCtx::new(&f.sched, &vp);
        let mut guard = f.mutex.lock(&ctx).unwrap();
        *guard = 9;
        drop(guard);
        f.cv.signal(&f.sched);

        assert_eq!(waiter.join().unwrap(), 9);
    }

    #[test]
    fn broadcast_wakes_every_current_waiter() {
        let f = fixture();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let (sched, mutex, cv) = (f.sched.clone(), f.mutex.clone(), f.cv.clone());
            waiters.push(std::thread::spawn(move || {
                let vp = Vp::new(PRIORITY_NORMAL);
                let ctx = SchedCtx::new(&sched, &vp);
                let mut guard = mutex.lock(&ctx).unwrap();
                while *guard == 0 {
                    let (reacquired, outcome) = cv.wait(&ctx, guard, QUANTUMS_INFINITY);
                    outcome.unwrap();
                    guard = reacquired;
                }
            }));
        }

        let vp = Vp::new(PRIORITY_NORMAL);
        let ctx = SchedCtx::new(&f.sched, &vp);
        loop {
            let waiting = f.cv.queue.len();
            if waiting == 3 {
                break;
            }
            std::thread::yield_now();
        }

        let mut guard = f.mutex.lock(&ctx).unwrap();
        *guard = 1;
        f.cv.wake_and_unlock(&ctx, guard, true);

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn timed_wait_reports_timeout_with_the_mutex_held() {
        let f = fixture();
        let (sched, mutex, cv) = (f.sched.clone(), f.mutex.clone(), f.cv.clone());
        let waiter = std::thread::spawn(move || {
            let vp = Vp::new(PRIORITY_NORMAL);
            let ctx = SchedCtx::new(&sched, &vp);
            let guard = mutex.lock(&ctx).unwrap();
            let deadline = sched.clock().deadline_after(2);
            let (guard, outcome) = cv.wait(&ctx, guard, deadline);
            assert_eq!(outcome.unwrap_err().error(), Errno::ETIMEDOUT);
            assert_eq!(mutex.owner_vpid(), vp.vpid());
            drop(guard);
        });

        while !f.cv.has_waiters() {
            std::thread::yield_now();
        }
        f.sched.clock().on_tick();
        f.sched.clock().on_tick();
        waiter.join().unwrap();
    }
}
