// SPDX-License-Identifier: MPL-2.0

use intrusive_collections::LinkedList;

use crate::config::{DEFAULT_KERNEL_STACK_SIZE, DEFAULT_USER_STACK_SIZE};
use crate::prelude::*;
use crate::sched::scheduler::Scheduler;
use crate::sched::vp::{LifecycleState, Vp, VpClosure, VpOwnerAdapter, PRIORITY_NORMAL};
use crate::sync::SpinLock;

/// How many relinquished VPs the pool keeps around for reuse. A VP that is
/// relinquished while the cache is full goes to the finalizer instead.
pub const REUSE_CACHE_CAPACITY: usize = 16;

/// Parameters for acquiring a VP from the pool.
pub struct VpParams {
    pub priority: u8,
    pub kernel_stack_size: usize,
    pub user_stack_size: usize,
    pub is_user: bool,
}

impl Default for VpParams {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            user_stack_size: DEFAULT_USER_STACK_SIZE,
            is_user: false,
        }
    }
}

struct PoolInner {
    reuse_queue: LinkedList<VpOwnerAdapter>,
    reuse_count: usize,
}

/// The virtual processor pool.
///
/// Relinquished VPs are cached in a bounded reuse queue so that starting a
/// new execution context does not always pay for a full VP setup.
pub struct VpPool {
    inner: SpinLock<PoolInner>,
    capacity: usize,
}

impl VpPool {
    pub fn new() -> Self {
        Self::with_capacity(REUSE_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SpinLock::new(PoolInner {
                reuse_queue: LinkedList::new(VpOwnerAdapter::new()),
                reuse_count: 0,
            }),
            capacity,
        }
    }

    pub fn cached_count(&self) -> usize {
        self.inner.lock().reuse_count
    }

    /// Acquires a VP, reusing a cached one when possible, and configures it
    /// with the given closure.
    pub fn acquire(
        &self,
        params: &VpParams,
        func: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<Vp>> {
        let reused = {
            let mut inner = self.inner.lock();
            let vp = inner.reuse_queue.pop_front();
            if vp.is_some() {
                inner.reuse_count -= 1;
            }
            vp
        };

        let vp = match reused {
            Some(vp) => vp,
            None => Vp::new(params.priority),
        };

        vp.set_closure(VpClosure {
            func,
            kernel_stack_size: params.kernel_stack_size,
            user_stack_size: params.user_stack_size,
            is_user: params.is_user,
        })?;
        vp.set_lifecycle_state(LifecycleState::Acquired);
        Ok(vp)
    }

    /// Relinquishes a VP back to the pool.
    ///
    /// If the reuse cache has room, the VP is reset, cached and suspended.
    /// Otherwise it is handed to the scheduler's finalizer for destruction.
    pub fn relinquish(&self, sched: &Scheduler, vp: Arc<Vp>) {
        vp.set_dispatch_binding(None);

        let cached = {
            let mut inner = self.inner.lock();
            if inner.reuse_count < self.capacity {
                vp.reset_for_reuse();
                inner.reuse_queue.push_front(vp.clone());
                inner.reuse_count += 1;
                true
            } else {
                false
            }
        };

        if cached {
            let _ = sched.suspend(&vp);
        } else {
            sched.terminate_vp(&vp);
        }
    }
}

impl Default for VpPool {
    fn default() -> Self {
        Self::new()
    }
}
