// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use intrusive_collections::{intrusive_adapter, LinkedListAtomicLink};

use crate::clock::{Quantums, QUANTUMS_INFINITY};
use crate::config::{DEFAULT_KERNEL_STACK_SIZE, DEFAULT_USER_STACK_SIZE};
use crate::prelude::*;
use crate::sched::wait::WaitQueue;
use crate::sync::SpinLock;

/// A virtual processor id. Id 0 is reserved to mean "no VP".
pub type Vpid = u32;

pub const PRIORITY_HIGHEST: u8 = 63;
pub const PRIORITY_REALTIME: u8 = 56;
pub const PRIORITY_NORMAL: u8 = 42;
pub const PRIORITY_LOWEST: u8 = 0;
pub const PRIORITY_COUNT: usize = 64;

// The top and bottom two priorities are reserved for the boot and idle VPs.
pub const PRIORITIES_RESERVED_HIGH: u8 = 2;
pub const PRIORITIES_RESERVED_LOW: u8 = 2;

/// The highest signal number.
pub const SIGNAL_MAX: u32 = 32;

/// Computes the number of consecutive quantums a VP may run for at the given
/// effective priority. Lower priorities get longer slices.
pub const fn quantum_allowance_for(priority: u8) -> u8 {
    ((PRIORITY_HIGHEST - priority) >> 3) + 1
}

/// The scheduling state of a VP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedState {
    /// Able to run; sitting on the ready queue.
    Ready = 0,
    /// Currently running.
    Running = 1,
    /// Blocked on a wait queue.
    Waiting = 2,
}

impl SchedState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            _ => Self::Waiting,
        }
    }
}

/// The lifecycle state of a VP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Sitting in the reuse pool.
    Relinquished = 0,
    /// Assigned to an owner and in use.
    Acquired = 1,
    /// In the process of terminating.
    Terminating = 2,
}

impl LifecycleState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Relinquished,
            1 => Self::Acquired,
            _ => Self::Terminating,
        }
    }
}

/// Why a waiting VP was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    None = 0,
    /// The awaited event happened.
    Finished = 1,
    /// The wait deadline passed.
    Timeout = 2,
    /// The wait was aborted externally.
    Interrupted = 3,
}

impl WakeReason {
    pub(super) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Finished,
            2 => Self::Timeout,
            _ => Self::Interrupted,
        }
    }
}

bitflags::bitflags! {
    /// VP flags.
    pub struct VpFlags: u8 {
        /// The current wait may be aborted with `Interrupted`.
        const INTERRUPTIBLE_WAIT = 0x01;
        /// A call-as-user invocation is in progress.
        const CALLOUT_IN_PROGRESS = 0x02;
        /// The in-progress call-as-user invocation has been aborted and is
        /// unwinding.
        const CALLOUT_ABORTED = 0x04;
        /// The VP has been handed to the finalizer.
        const TERMINATED = 0x08;
    }
}

/// The operations accepted by [`Vp::set_signal_mask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskOp {
    /// Add the given signals to the mask.
    Block,
    /// Remove the given signals from the mask.
    Unblock,
    /// Replace the mask.
    SetMask,
}

/// The closure a VP runs once it is started, together with its stack
/// configuration.
pub struct VpClosure {
    pub func: Box<dyn FnOnce() + Send>,
    pub kernel_stack_size: usize,
    pub user_stack_size: usize,
    pub is_user: bool,
}

impl VpClosure {
    pub fn new(func: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            func,
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            user_stack_size: DEFAULT_USER_STACK_SIZE,
            is_user: false,
        }
    }
}

/// A dispatch queue binding. The VP refers back to the queue that owns it by
/// weak reference only.
pub struct DispatchBinding {
    pub queue: Weak<dyn Any + Send + Sync>,
    pub lane: i8,
}

static NEXT_VPID: AtomicU32 = AtomicU32::new(1);

fn alloc_vpid() -> Vpid {
    NEXT_VPID.fetch_add(1, Ordering::Relaxed)
}

/// A virtual processor.
///
/// The embedded links place the VP on at most one ready-or-wait list, the
/// timeout queue, and one owner list (the reuse pool while relinquished). The
/// scheduling fields are atomics so list walks can read them without taking
/// a per-VP lock; they are only written under the queue and scheduler locks.
pub struct Vp {
    vpid: Vpid,

    // A VP is either on the ready queue or on a wait queue, never both. The
    // same link also carries the VP on the finalizer queue once it is dead.
    pub(super) rewa_link: LinkedListAtomicLink,
    pub(super) timeout_link: LinkedListAtomicLink,
    pub(super) owner_link: LinkedListAtomicLink,

    base_priority: AtomicU8,
    effective_priority: AtomicU8,
    quantum_allowance: AtomicU8,
    sched_state: AtomicU8,
    lifecycle: AtomicU8,
    suspension_count: AtomicU8,
    flags: AtomicU8,
    wakeup_reason: AtomicU8,

    wait_start_time: AtomicU64,
    suspension_time: AtomicU64,
    pub(super) timeout_deadline: AtomicU64,
    pub(super) timeout_armed: AtomicU8,
    // The wait queue this VP is blocked on; null when not waiting. Used by
    // the timeout drain and by signal delivery to find the queue to pull the
    // VP off of. Invariant: a wait queue outlives all waits entered on it.
    waiting_on: AtomicPtr<WaitQueue>,

    pending_signals: AtomicU32,
    signal_mask: AtomicU32,

    closure: SpinLock<Option<VpClosure>>,
    dispatch_binding: SpinLock<Option<DispatchBinding>>,
}

intrusive_adapter!(pub VpRunAdapter = Arc<Vp>: Vp { rewa_link: LinkedListAtomicLink });
intrusive_adapter!(pub VpTimeoutAdapter = Arc<Vp>: Vp { timeout_link: LinkedListAtomicLink });
intrusive_adapter!(pub VpOwnerAdapter = Arc<Vp>: Vp { owner_link: LinkedListAtomicLink });

impl Vp {
    pub fn new(priority: u8) -> Arc<Self> {
        debug_assert!(priority <= PRIORITY_HIGHEST);
        Arc::new(Self {
            vpid: alloc_vpid(),
            rewa_link: LinkedListAtomicLink::new(),
            timeout_link: LinkedListAtomicLink::new(),
            owner_link: LinkedListAtomicLink::new(),
            base_priority: AtomicU8::new(priority),
            effective_priority: AtomicU8::new(priority),
            quantum_allowance: AtomicU8::new(quantum_allowance_for(priority)),
            sched_state: AtomicU8::new(SchedState::Ready as u8),
            lifecycle: AtomicU8::new(LifecycleState::Acquired as u8),
            suspension_count: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            wakeup_reason: AtomicU8::new(WakeReason::None as u8),
            wait_start_time: AtomicU64::new(0),
            suspension_time: AtomicU64::new(0),
            timeout_deadline: AtomicU64::new(QUANTUMS_INFINITY),
            timeout_armed: AtomicU8::new(0),
            waiting_on: AtomicPtr::new(core::ptr::null_mut()),
            pending_signals: AtomicU32::new(0),
            signal_mask: AtomicU32::new(0),
            closure: SpinLock::new(None),
            dispatch_binding: SpinLock::new(None),
        })
    }

    pub fn vpid(&self) -> Vpid {
        self.vpid
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority.load(Ordering::Relaxed)
    }

    pub(super) fn set_base_priority(&self, priority: u8) {
        self.base_priority.store(priority, Ordering::Relaxed);
    }

    pub fn effective_priority(&self) -> u8 {
        self.effective_priority.load(Ordering::Relaxed)
    }

    pub(super) fn set_effective_priority(&self, priority: u8) {
        self.effective_priority.store(priority, Ordering::Relaxed);
    }

    pub fn quantum_allowance(&self) -> u8 {
        self.quantum_allowance.load(Ordering::Relaxed)
    }

    pub(super) fn set_quantum_allowance(&self, allowance: u8) {
        self.quantum_allowance.store(allowance, Ordering::Relaxed);
    }

    pub fn sched_state(&self) -> SchedState {
        SchedState::from_raw(self.sched_state.load(Ordering::Acquire))
    }

    pub(super) fn set_sched_state(&self, state: SchedState) {
        self.sched_state.store(state as u8, Ordering::Release);
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        LifecycleState::from_raw(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn set_lifecycle_state(&self, state: LifecycleState) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    pub fn suspension_count(&self) -> u8 {
        self.suspension_count.load(Ordering::Acquire)
    }

    pub(super) fn set_suspension_count(&self, count: u8) {
        self.suspension_count.store(count, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_count() > 0
    }

    pub fn flags(&self) -> VpFlags {
        VpFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(super) fn set_flag(&self, flag: VpFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(super) fn clear_flag(&self, flag: VpFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn wakeup_reason(&self) -> WakeReason {
        WakeReason::from_raw(self.wakeup_reason.load(Ordering::Acquire))
    }

    pub(super) fn set_wakeup_reason(&self, reason: WakeReason) {
        self.wakeup_reason.store(reason as u8, Ordering::Release);
    }

    pub(super) fn wait_start_time(&self) -> Quantums {
        self.wait_start_time.load(Ordering::Relaxed)
    }

    pub(super) fn set_wait_start_time(&self, now: Quantums) {
        self.wait_start_time.store(now, Ordering::Relaxed);
    }

    pub(super) fn set_suspension_time(&self, now: Quantums) {
        self.suspension_time.store(now, Ordering::Relaxed);
    }

    pub(super) fn waiting_on(&self) -> *mut WaitQueue {
        self.waiting_on.load(Ordering::Acquire)
    }

    pub(super) fn set_waiting_on(&self, queue: *mut WaitQueue) {
        self.waiting_on.store(queue, Ordering::Release);
    }

    /// Whether an abort of a call-as-user invocation is pending on this VP.
    pub fn is_user_callout_aborted(&self) -> bool {
        self.flags()
            .contains(VpFlags::CALLOUT_IN_PROGRESS | VpFlags::CALLOUT_ABORTED)
    }

    /// Marks entry into a call-as-user invocation. Invocations do not nest.
    pub fn begin_user_callout(&self) {
        debug_assert!(!self.flags().contains(VpFlags::CALLOUT_IN_PROGRESS));
        self.set_flag(VpFlags::CALLOUT_IN_PROGRESS);
    }

    /// Marks the return from a call-as-user invocation and clears a pending
    /// abort.
    pub fn end_user_callout(&self) {
        self.clear_flag(VpFlags::CALLOUT_IN_PROGRESS | VpFlags::CALLOUT_ABORTED);
    }

    pub fn pending_signals(&self) -> u32 {
        self.pending_signals.load(Ordering::Acquire)
    }

    pub fn signal_mask(&self) -> u32 {
        self.signal_mask.load(Ordering::Acquire)
    }

    pub(super) fn add_pending_signal(&self, signo: u32) {
        self.pending_signals
            .fetch_or(1 << (signo - 1), Ordering::AcqRel);
    }

    /// Consumes and returns the pending signal set.
    pub fn take_pending_signals(&self) -> u32 {
        self.pending_signals.swap(0, Ordering::AcqRel)
    }

    /// Atomically updates the signal mask and returns the previous mask.
    pub fn set_signal_mask(&self, op: SigMaskOp, mask: u32) -> u32 {
        match op {
            SigMaskOp::Block => self.signal_mask.fetch_or(mask, Ordering::AcqRel),
            SigMaskOp::Unblock => self.signal_mask.fetch_and(!mask, Ordering::AcqRel),
            SigMaskOp::SetMask => self.signal_mask.swap(mask, Ordering::AcqRel),
        }
    }

    /// Sets the closure the VP runs when started. Only legal while the VP is
    /// not runnable.
    pub fn set_closure(&self, closure: VpClosure) -> Result<()> {
        if self.sched_state() == SchedState::Running {
            return_errno_with_message!(Errno::EBUSY, "VP is running");
        }
        *self.closure.lock() = Some(closure);
        Ok(())
    }

    /// Takes the configured closure, if any.
    pub fn take_closure(&self) -> Option<VpClosure> {
        self.closure.lock().take()
    }

    pub fn set_dispatch_binding(&self, binding: Option<DispatchBinding>) {
        *self.dispatch_binding.lock() = binding;
    }

    pub fn dispatch_queue(&self) -> Option<Weak<dyn Any + Send + Sync>> {
        self.dispatch_binding
            .lock()
            .as_ref()
            .map(|b| b.queue.clone())
    }

    // Resets the per-acquisition state when the VP goes back to the pool.
    pub(super) fn reset_for_reuse(&self) {
        self.pending_signals.store(0, Ordering::Release);
        self.signal_mask.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        self.wakeup_reason
            .store(WakeReason::None as u8, Ordering::Release);
        *self.closure.lock() = None;
        *self.dispatch_binding.lock() = None;
        self.set_lifecycle_state(LifecycleState::Relinquished);
    }
}

impl Debug for Vp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vp")
            .field("vpid", &self.vpid)
            .field("base", &self.base_priority())
            .field("effective", &self.effective_priority())
            .field("state", &self.sched_state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quantum_allowance_grows_as_priority_drops() {
        assert_eq!(quantum_allowance_for(PRIORITY_HIGHEST), 1);
        assert_eq!(quantum_allowance_for(PRIORITY_NORMAL), 3);
        assert_eq!(quantum_allowance_for(PRIORITY_LOWEST), 8);
    }

    #[test]
    fn signal_mask_ops_follow_posix() {
        let vp = Vp::new(PRIORITY_NORMAL);
        assert_eq!(vp.set_signal_mask(SigMaskOp::Block, 0b0110), 0);
        assert_eq!(vp.signal_mask(), 0b0110);
        assert_eq!(vp.set_signal_mask(SigMaskOp::Unblock, 0b0010), 0b0110);
        assert_eq!(vp.signal_mask(), 0b0100);
        assert_eq!(vp.set_signal_mask(SigMaskOp::SetMask, 0b1000), 0b0100);
        assert_eq!(vp.signal_mask(), 0b1000);
    }

    #[test]
    fn vpids_are_unique() {
        let a = Vp::new(PRIORITY_NORMAL);
        let b = Vp::new(PRIORITY_NORMAL);
        assert_ne!(a.vpid(), b.vpid());
        assert!(a.vpid() > 0);
    }
}
