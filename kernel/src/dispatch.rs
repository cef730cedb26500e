// SPDX-License-Identifier: MPL-2.0

//! The dispatch queue: a serial queue of closures executed on virtual
//! processors drawn from the VP pool.
//!
//! Work items are either kernel items or user closures; executing a user
//! closure marks the executing VP as being in a call-as-user invocation so
//! that terminating the queue can abort it. Terminating a queue flushes
//! everything still pending, aborts in-flight user callouts, relinquishes
//! the queue's VPs and settles in the `Terminated` state.

use alloc::collections::VecDeque;

use kestrel_frame::clock::QUANTUMS_INFINITY;
use kestrel_frame::sched::{DispatchBinding, Scheduler, Vp, VpParams, VpPool};
use kestrel_frame::sync::{CondVar, Mutex, SpinLock};

use crate::prelude::*;
use crate::process::Process;

/// The lifecycle state of a dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    Terminating,
    Terminated,
}

/// A queued closure.
pub type WorkFn = Box<dyn FnOnce(&SchedCtx) + Send>;

struct WorkItem {
    func: WorkFn,
    is_user: bool,
}

struct QueueInner {
    state: QueueState,
    items: VecDeque<WorkItem>,
    // VPs acquired from the pool for this queue's concurrency lane.
    lane_vps: Vec<Arc<Vp>>,
    // VPs currently executing a user closure of this queue.
    active_vps: Vec<Arc<Vp>>,
}

pub struct DispatchQueue {
    sched: Arc<Scheduler>,
    pool: Arc<VpPool>,
    inner: Mutex<QueueInner>,
    state_cv: CondVar,
    owner: SpinLock<Weak<Process>>,
}

impl DispatchQueue {
    pub fn new(sched: Arc<Scheduler>, pool: Arc<VpPool>) -> Arc<Self> {
        Arc::new(Self {
            sched,
            pool,
            inner: Mutex::new(QueueInner {
                state: QueueState::Running,
                items: VecDeque::new(),
                lane_vps: Vec::new(),
                active_vps: Vec::new(),
            }),
            state_cv: CondVar::new(),
            owner: SpinLock::new(Weak::new()),
        })
    }

    /// Binds the queue to its owning process. The queue refers back to the
    /// process by weak reference only.
    pub fn set_owner(&self, owner: Weak<Process>) {
        *self.owner.lock() = owner;
    }

    /// The process owning this queue, if any.
    pub fn owning_process(&self) -> Option<Arc<Process>> {
        self.owner.lock().upgrade()
    }

    pub fn state(&self, ctx: &SchedCtx) -> QueueState {
        self.inner.lock(ctx).map(|g| g.state).unwrap_or(QueueState::Terminated)
    }

    pub fn pending_count(&self, ctx: &SchedCtx) -> usize {
        self.inner.lock(ctx).map(|g| g.items.len()).unwrap_or(0)
    }

    /// The VPs currently acquired for this queue's concurrency lane.
    pub fn lane_vps(&self, ctx: &SchedCtx) -> Vec<Arc<Vp>> {
        self.inner
            .lock(ctx)
            .map(|inner| inner.lane_vps.clone())
            .unwrap_or_default()
    }

    /// Enqueues a kernel work item.
    pub fn dispatch(&self, ctx: &SchedCtx, func: WorkFn) -> Result<()> {
        self.enqueue(ctx, WorkItem {
            func,
            is_user: false,
        })
    }

    /// Enqueues a user closure. The queue lazily acquires a VP from the
    /// pool to own the user execution lane.
    pub fn dispatch_user(self: &Arc<Self>, ctx: &SchedCtx, func: WorkFn) -> Result<()> {
        {
            let mut inner = self.inner.lock(ctx)?;
            if inner.state != QueueState::Running {
                return_errno_with_message!(Errno::ESRCH, "queue is shutting down");
            }
            if inner.lane_vps.is_empty() {
                let params = VpParams {
                    is_user: true,
                    ..VpParams::default()
                };
                let vp = self.pool.acquire(&params, Box::new(|| {}))?;
                let queue: Arc<dyn Any + Send + Sync> = self.clone();
                vp.set_dispatch_binding(Some(DispatchBinding {
                    queue: Arc::downgrade(&queue),
                    lane: 0,
                }));
                inner.lane_vps.push(vp);
            }
        }
        self.enqueue(ctx, WorkItem {
            func,
            is_user: true,
        })
    }

    fn enqueue(&self, ctx: &SchedCtx, item: WorkItem) -> Result<()> {
        let mut inner = self.inner.lock(ctx)?;
        if inner.state != QueueState::Running {
            return_errno_with_message!(Errno::ESRCH, "queue is shutting down");
        }
        inner.items.push_back(item);
        Ok(())
    }

    /// Runs queued items on the calling VP until the queue is empty.
    /// Returns how many items ran.
    pub fn drain(&self, ctx: &SchedCtx) -> Result<usize> {
        let mut executed = 0;
        loop {
            let item = {
                let mut inner = self.inner.lock(ctx)?;
                let Some(item) = inner.items.pop_front() else {
                    break;
                };
                if item.is_user {
                    inner.active_vps.push(ctx.vp().clone());
                }
                item
            };

            if item.is_user {
                ctx.vp().begin_user_callout();
                (item.func)(ctx);
                ctx.vp().end_user_callout();
                let mut inner = self.inner.lock(ctx)?;
                inner
                    .active_vps
                    .retain(|vp| !Arc::ptr_eq(vp, ctx.vp()));
            } else {
                (item.func)(ctx);
            }
            executed += 1;
        }
        Ok(executed)
    }

    /// Terminates the queue: flushes pending work, aborts in-flight user
    /// callouts and relinquishes the queue's VPs. The queue stops accepting
    /// work.
    pub fn terminate(&self, ctx: &SchedCtx) -> Result<()> {
        let (active, lanes) = {
            let mut inner = self.inner.lock(ctx)?;
            if inner.state == QueueState::Terminated {
                return Ok(());
            }
            inner.state = QueueState::Terminating;
            inner.items.clear();
            (
                core::mem::take(&mut inner.active_vps),
                core::mem::take(&mut inner.lane_vps),
            )
        };

        for vp in &active {
            self.sched.abort_user_callout(vp);
        }
        for vp in lanes {
            self.pool.relinquish(&self.sched, vp);
        }

        let mut inner = self.inner.lock(ctx)?;
        inner.state = QueueState::Terminated;
        self.state_cv.wake_and_unlock(ctx, inner, true);
        Ok(())
    }

    /// Blocks until the queue has reached the `Terminated` state.
    pub fn wait_for_termination_completed(&self, ctx: &SchedCtx) -> Result<()> {
        let mut inner = self.inner.lock(ctx)?;
        while inner.state != QueueState::Terminated {
            let (reacquired, outcome) = self.state_cv.wait(ctx, inner, QUANTUMS_INFINITY);
            inner = reacquired;
            outcome?;
        }
        Ok(())
    }
}
