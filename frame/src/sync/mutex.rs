// SPDX-License-Identifier: MPL-2.0

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::clock::QUANTUMS_INFINITY;
use crate::prelude::*;
use crate::sched::{SchedCtx, Scheduler, Vpid, WaitQueue, WakeReason};

bitflags::bitflags! {
    /// Mutex behavior options.
    pub struct MutexOptions: u8 {
        /// Report ownership violations as `EPERM` instead of treating them
        /// as fatal.
        const NON_FATAL_OWNERSHIP_VIOLATIONS = 1 << 0;
        /// Waits for this mutex may be aborted with `Interrupted`.
        const INTERRUPTIBLE = 1 << 1;
    }
}

/// A mutex with a wait queue.
///
/// Acquisition takes the fast path through an atomic; contended callers
/// block on the wait queue until the holder releases. The mutex records the
/// vpid of its holder, and releasing it from a VP that does not hold it is
/// fatal unless the mutex was created with
/// [`MutexOptions::NON_FATAL_OWNERSHIP_VIOLATIONS`].
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    owner: AtomicU32,
    options: MutexOptions,
    queue: WaitQueue,
    val: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Self::with_options(val, MutexOptions::empty())
    }

    pub fn with_options(val: T, options: MutexOptions) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(0),
            options,
            queue: WaitQueue::new(),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking while it is contended.
    ///
    /// Fails with `EINTR` only if the mutex was created interruptible and
    /// the wait was aborted.
    pub fn lock<'a>(&'a self, ctx: &SchedCtx<'a>) -> Result<MutexGuard<'a, T>> {
        let interruptible = self.options.contains(MutexOptions::INTERRUPTIBLE);
        loop {
            if let Some(guard) = self.try_lock(ctx) {
                return Ok(guard);
            }
            let waited = ctx.sched().wait_on_if(
                ctx.vp(),
                &self.queue,
                QUANTUMS_INFINITY,
                interruptible,
                || self.locked.load(Ordering::Acquire),
            );
            match waited {
                Ok(_) => continue,
                Err(err) if interruptible => return Err(err),
                Err(err) => panic!(
                    "wait for an uninterruptible mutex failed: {:?}",
                    err.error()
                ),
            }
        }
    }

    /// Tries to acquire the mutex without blocking.
    pub fn try_lock<'a>(&'a self, ctx: &SchedCtx<'a>) -> Option<MutexGuard<'a, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        self.owner.store(ctx.vpid(), Ordering::Release);
        Some(MutexGuard {
            mutex: self,
            sched: ctx.sched(),
            vpid: ctx.vpid(),
            _not_send: PhantomData,
        })
    }

    /// Acquires the mutex without producing a guard. Paired with
    /// [`Mutex::release`] for code that manages the critical section
    /// explicitly.
    pub fn acquire(&self, ctx: &SchedCtx) -> Result<()> {
        let guard = self.lock(ctx)?;
        core::mem::forget(guard);
        Ok(())
    }

    /// Releases a mutex acquired with [`Mutex::acquire`].
    ///
    /// The calling VP must be the holder; a violation is fatal or `EPERM`
    /// depending on the mutex options.
    pub fn release(&self, ctx: &SchedCtx) -> Result<()> {
        self.release_as(ctx.sched(), ctx.vpid())
    }

    fn release_as(&self, sched: &Scheduler, vpid: Vpid) -> Result<()> {
        let owner = self.owner.load(Ordering::Acquire);
        if owner != vpid {
            if self
                .options
                .contains(MutexOptions::NON_FATAL_OWNERSHIP_VIOLATIONS)
            {
                return_errno_with_message!(Errno::EPERM, "mutex is not held by the caller");
            }
            panic!("mutex owned by vpid {} released by vpid {}", owner, vpid);
        }
        self.owner.store(0, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        sched.wake_some(&self.queue, 1, WakeReason::Finished, true);
        Ok(())
    }

    /// The vpid of the current holder, or 0 when unlocked.
    pub fn owner_vpid(&self) -> Vpid {
        self.owner.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

// SAFETY: the mutex provides exclusive access to the protected value.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner_vpid())
            .finish()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    sched: &'a Scheduler,
    vpid: Vpid,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the mutex.
        unsafe { &*self.mutex.val.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the mutex.
        unsafe { &mut *self.mutex.val.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.mutex.release_as(self.sched, self.vpid);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::sched::{Vp, PRIORITY_NORMAL};

    fn fixture() -> (Arc<Scheduler>, Arc<Vp>, Arc<Vp>) {
        let sched = Arc::new(Scheduler::new(Arc::new(MonotonicClock::new())));
        (sched, Vp::new(PRIORITY_NORMAL), Vp::new(PRIORITY_NORMAL))
    }

    #[test]
    fn uncontended_lock_records_ownership() {
        let (sched, a, _) = fixture();
        let ctx = SchedCtx::new(&sched, &a);
        let mutex = Mutex::new(7);

        {
            let mut guard = mutex.lock(&ctx).unwrap();
            *guard += 1;
            assert_eq!(mutex.owner_vpid(), a.vpid());
            assert!(mutex.try_lock(&ctx).is_none());
        }
        assert_eq!(mutex.owner_vpid(), 0);
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock(&ctx).unwrap(), 8);
    }

    #[test]
    fn foreign_release_reports_eperm_when_non_fatal() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let ctx_b = SchedCtx::new(&sched, &b);
        let mutex =
            Mutex::with_options((), MutexOptions::NON_FATAL_OWNERSHIP_VIOLATIONS);

        mutex.acquire(&ctx_a).unwrap();
        let err = mutex.release(&ctx_b).unwrap_err();
        assert_eq!(err.error(), Errno::EPERM);
        mutex.release(&ctx_a).unwrap();
    }

    #[test]
    #[should_panic(expected = "released by vpid")]
    fn foreign_release_is_fatal_by_default() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let ctx_b = SchedCtx::new(&sched, &b);
        let mutex = Mutex::new(());

        mutex.acquire(&ctx_a).unwrap();
        let _ = mutex.release(&ctx_b);
    }

    #[test]
    fn contended_lock_hands_over_to_the_waiter() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let mutex = Arc::new(Mutex::new(0u32));

        mutex.acquire(&ctx_a).unwrap();

        let waiter = {
            let sched = sched.clone();
            let mutex = mutex.clone();
            let b = b.clone();
            std::thread::spawn(move || {
                let ctx_b = SchedCtx::new(&sched, &b);
                let mut guard = mutex.lock(&ctx_b).unwrap();
                *guard = 42;
            })
        };

        // Wait until the contender is parked on the mutex queue, then
        // release.
        while mutex.queue.is_empty() {
            std::thread::yield_now();
        }
        mutex.release(&ctx_a).unwrap();
        waiter.join().unwrap();

        assert_eq!(*mutex.lock(&ctx_a).unwrap(), 42);
    }
}
