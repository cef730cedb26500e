// SPDX-License-Identifier: MPL-2.0

use crate::clock::QUANTUMS_INFINITY;
use crate::prelude::*;
use crate::sched::{SchedCtx, Vpid};
use crate::sync::{CondVar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeState {
    Unlocked,
    Shared(u32),
    Exclusive { owner: Vpid, count: u32 },
}

/// A shared-exclusive lock.
///
/// Any number of VPs may hold the lock in shared mode, or exactly one VP in
/// exclusive mode. The exclusive holder may re-lock exclusively without
/// blocking; unlocks are counted. State transitions ride on an internal
/// mutex and condition variable.
pub struct SeLock {
    state: Mutex<SeState>,
    cv: CondVar,
}

impl SeLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SeState::Unlocked),
            cv: CondVar::new(),
        }
    }

    /// Blocks until the lock is held in shared mode.
    pub fn lock_shared(&self, ctx: &SchedCtx) -> Result<()> {
        let mut guard = self.state.lock(ctx)?;
        loop {
            match *guard {
                SeState::Unlocked => {
                    *guard = SeState::Shared(1);
                    return Ok(());
                }
                SeState::Shared(count) => {
                    *guard = SeState::Shared(count + 1);
                    return Ok(());
                }
                SeState::Exclusive { .. } => {
                    let (reacquired, outcome) = self.cv.wait(ctx, guard, QUANTUMS_INFINITY);
                    guard = reacquired;
                    outcome?;
                }
            }
        }
    }

    /// Blocks until the lock is held in exclusive mode. Re-entrant for the
    /// VP that already holds it exclusively.
    pub fn lock_exclusive(&self, ctx: &SchedCtx) -> Result<()> {
        let mut guard = self.state.lock(ctx)?;
        loop {
            match *guard {
                SeState::Unlocked => {
                    *guard = SeState::Exclusive {
                        owner: ctx.vpid(),
                        count: 1,
                    };
                    return Ok(());
                }
                SeState::Exclusive { owner, count } if owner == ctx.vpid() => {
                    *guard = SeState::Exclusive {
                        owner,
                        count: count + 1,
                    };
                    return Ok(());
                }
                SeState::Shared(_) | SeState::Exclusive { .. } => {
                    let (reacquired, outcome) = self.cv.wait(ctx, guard, QUANTUMS_INFINITY);
                    guard = reacquired;
                    outcome?;
                }
            }
        }
    }

    /// Takes the lock in shared mode if that is possible right now.
    pub fn try_lock_shared(&self, ctx: &SchedCtx) -> Result<bool> {
        let mut guard = self.state.lock(ctx)?;
        match *guard {
            SeState::Unlocked => {
                *guard = SeState::Shared(1);
                Ok(true)
            }
            SeState::Shared(count) => {
                *guard = SeState::Shared(count + 1);
                Ok(true)
            }
            SeState::Exclusive { .. } => Ok(false),
        }
    }

    /// Takes the lock in exclusive mode if that is possible right now.
    pub fn try_lock_exclusive(&self, ctx: &SchedCtx) -> Result<bool> {
        let mut guard = self.state.lock(ctx)?;
        match *guard {
            SeState::Unlocked => {
                *guard = SeState::Exclusive {
                    owner: ctx.vpid(),
                    count: 1,
                };
                Ok(true)
            }
            SeState::Exclusive { owner, count } if owner == ctx.vpid() => {
                *guard = SeState::Exclusive {
                    owner,
                    count: count + 1,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drops one hold on the lock. The transition back to `Unlocked` wakes
    /// every waiter.
    pub fn unlock(&self, ctx: &SchedCtx) -> Result<()> {
        let mut guard = self.state.lock(ctx)?;
        match *guard {
            SeState::Shared(1) => {
                *guard = SeState::Unlocked;
                self.cv.wake_and_unlock(ctx, guard, true);
                return Ok(());
            }
            SeState::Shared(count) => {
                *guard = SeState::Shared(count - 1);
            }
            SeState::Exclusive { owner, count } => {
                if owner != ctx.vpid() {
                    return_errno_with_message!(
                        Errno::EPERM,
                        "exclusive lock held by another VP"
                    );
                }
                if count == 1 {
                    *guard = SeState::Unlocked;
                    self.cv.wake_and_unlock(ctx, guard, true);
                    return Ok(());
                }
                *guard = SeState::Exclusive {
                    owner,
                    count: count - 1,
                };
            }
            SeState::Unlocked => {
                return_errno_with_message!(Errno::EPERM, "lock is not held");
            }
        }
        Ok(())
    }

    /// Verifies the lock may be torn down. Fails with `EBUSY` while held.
    pub fn close(&self, ctx: &SchedCtx) -> Result<()> {
        let guard = self.state.lock(ctx)?;
        if *guard != SeState::Unlocked {
            return_errno_with_message!(Errno::EBUSY, "lock is still held");
        }
        Ok(())
    }
}

impl Default for SeLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::sched::{Scheduler, Vp, PRIORITY_NORMAL};

    fn fixture() -> (Arc<Scheduler>, Arc<Vp>, Arc<Vp>) {
        let sched = Arc::new(Scheduler::new(Arc::new(MonotonicClock::new())));
        (sched, Vp::new(PRIORITY_NORMAL), Vp::new(PRIORITY_NORMAL))
    }

    #[test]
    fn many_shared_holders_are_allowed() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let ctx_b = SchedCtx::new(&sched, &b);
        let lock = SeLock::new();

        lock.lock_shared(&ctx_a).unwrap();
        lock.lock_shared(&ctx_b).unwrap();
        assert!(!lock.try_lock_exclusive(&ctx_a).unwrap());

        lock.unlock(&ctx_a).unwrap();
        lock.unlock(&ctx_b).unwrap();
        assert!(lock.try_lock_exclusive(&ctx_a).unwrap());
        lock.unlock(&ctx_a).unwrap();
    }

    #[test]
    fn exclusive_relock_by_owner_does_not_block() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let ctx_b = SchedCtx::new(&sched, &b);
        let lock = SeLock::new();

        lock.lock_exclusive(&ctx_a).unwrap();
        lock.lock_exclusive(&ctx_a).unwrap();
        assert!(!lock.try_lock_shared(&ctx_b).unwrap());

        lock.unlock(&ctx_a).unwrap();
        assert!(!lock.try_lock_shared(&ctx_b).unwrap());
        lock.unlock(&ctx_a).unwrap();
        assert!(lock.try_lock_shared(&ctx_b).unwrap());
        lock.unlock(&ctx_b).unwrap();
    }

    #[test]
    fn foreign_exclusive_unlock_is_refused() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let ctx_b = SchedCtx::new(&sched, &b);
        let lock = SeLock::new();

        lock.lock_exclusive(&ctx_a).unwrap();
        assert_eq!(lock.unlock(&ctx_b).unwrap_err().error(), Errno::EPERM);
        lock.unlock(&ctx_a).unwrap();
        assert_eq!(lock.unlock(&ctx_a).unwrap_err().error(), Errno::EPERM);
    }

    #[test]
    fn close_refuses_while_held() {
        let (sched, a, _) = fixture();
        let ctx = SchedCtx::new(&sched, &a);
        let lock = SeLock::new();

        lock.lock_shared(&ctx).unwrap();
        assert_eq!(lock.close(&ctx).unwrap_err().error(), Errno::EBUSY);
        lock.unlock(&ctx).unwrap();
        lock.close(&ctx).unwrap();
    }

    #[test]
    fn shared_waiter_gets_in_after_exclusive_unlock() {
        let (sched, a, b) = fixture();
        let ctx_a = SchedCtx::new(&sched, &a);
        let lock = Arc::new(SeLock::new());

        lock.lock_exclusive(&ctx_a).unwrap();

        let waiter = {
            let (sched, lock, b) = (sched.clone(), lock.clone(), b.clone());
            std::thread::spawn(move || {
                let ctx_b = SchedCtx::new(&sched, &b);
                lock.lock_shared(&ctx_b).unwrap();
                lock.unlock(&ctx_b).unwrap();
            })
        };

        while !lock.cv.has_waiters() {
            std::thread::yield_now();
        }
        lock.unlock(&ctx_a).unwrap();
        waiter.join().unwrap();
    }
}
