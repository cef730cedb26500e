// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use intrusive_collections::LinkedList;

use crate::clock::{MonotonicClock, Quantums, QUANTUMS_INFINITY, QUANTUMS_PER_QUARTER_SECOND, QUANTUMS_PER_SECOND};
use crate::prelude::*;
use crate::sched::runqueue::ReadyQueue;
use crate::sched::vp::{
    quantum_allowance_for, LifecycleState, SchedState, Vp, VpFlags, VpRunAdapter,
    VpTimeoutAdapter, WakeReason, PRIORITY_HIGHEST, PRIORITY_LOWEST, SIGNAL_MAX,
};
use crate::sched::wait::{self, WaitQueue};
use crate::sync::SpinLock;

// Terminated VPs accumulate on the finalizer queue until the boot VP gets
// around to destroying them. Once this many are pending, the boot VP is woken
// early instead of waiting for its heartbeat.
const FINALIZE_NOW_THRESHOLD: usize = 4;

struct SchedInner {
    ready: ReadyQueue,
    timeouts: LinkedList<VpTimeoutAdapter>,
    running: Option<Arc<Vp>>,
    finalizer: LinkedList<VpRunAdapter>,
    finalizer_count: usize,
}

/// The virtual processor scheduler.
///
/// All queue state lives behind one lock, the single-CPU stand-in for a
/// preemption-disabled critical section. Blocking operations park the
/// caller's execution context on the VP's wakeup word; the policy machinery
/// (quantum accounting, demotion, boosting, timeout expiry) is driven
/// explicitly through [`Scheduler::on_timer_tick`].
pub struct Scheduler {
    clock: Arc<MonotonicClock>,
    inner: SpinLock<SchedInner>,

    /// Long delays park here until their deadline passes.
    sleep_queue: WaitQueue,
    /// The boot VP waits here for finalization work.
    scheduler_wait_queue: WaitQueue,

    boot_vp: spin::Once<Arc<Vp>>,
    idle_vp: spin::Once<Arc<Vp>>,

    cooperation_disable_count: AtomicUsize,
    context_switches: AtomicU64,
    quantums_per_quarter: AtomicU64,
}

impl Scheduler {
    pub fn new(clock: Arc<MonotonicClock>) -> Self {
        Self {
            clock,
            inner: SpinLock::new(SchedInner {
                ready: ReadyQueue::new(),
                timeouts: LinkedList::new(VpTimeoutAdapter::new()),
                running: None,
                finalizer: LinkedList::new(VpRunAdapter::new()),
                finalizer_count: 0,
            }),
            sleep_queue: WaitQueue::new(),
            scheduler_wait_queue: WaitQueue::new(),
            boot_vp: spin::Once::new(),
            idle_vp: spin::Once::new(),
            cooperation_disable_count: AtomicUsize::new(0),
            context_switches: AtomicU64::new(0),
            quantums_per_quarter: AtomicU64::new(QUANTUMS_PER_QUARTER_SECOND),
        }
    }

    /// Creates the boot and idle VPs and makes the boot VP the running one.
    ///
    /// The boot VP grandfathers in the initial thread of execution and later
    /// serves as the finalizer; the idle VP runs only when nothing else is
    /// ready.
    pub fn bootstrap(&self) -> (Arc<Vp>, Arc<Vp>) {
        let boot = Vp::new(PRIORITY_HIGHEST);
        let idle = Vp::new(PRIORITY_LOWEST);

        boot.set_sched_state(SchedState::Running);
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.running.is_none());
            inner.running = Some(boot.clone());
            self.enqueue_ready_locked(&mut inner, &idle, PRIORITY_LOWEST);
        }

        self.boot_vp.call_once(|| boot.clone());
        self.idle_vp.call_once(|| idle.clone());
        (boot, idle)
    }

    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.clock
    }

    /// The VP currently marked running.
    pub fn current(&self) -> Option<Arc<Vp>> {
        self.inner.lock().running.clone()
    }

    pub fn idle_vp(&self) -> Option<Arc<Vp>> {
        self.idle_vp.get().cloned()
    }

    pub fn context_switch_count(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Overrides how many quantums make up a quarter second, the unit of the
    /// wakeup priority boost.
    pub fn set_quantums_per_quarter(&self, quantums: u64) {
        self.quantums_per_quarter
            .store(quantums.max(1), Ordering::Relaxed);
    }

    pub fn disable_cooperation(&self) {
        self.cooperation_disable_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restore_cooperation(&self) {
        self.cooperation_disable_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn is_cooperation_enabled(&self) -> bool {
        self.cooperation_disable_count.load(Ordering::Relaxed) == 0
    }

    /// Adds a VP to the scheduler, making it eligible for running at its
    /// base priority.
    pub fn add_vp(&self, vp: &Arc<Vp>) {
        let mut inner = self.inner.lock();
        let base = vp.base_priority();
        self.enqueue_ready_locked(&mut inner, vp, base);
    }

    /// Returns the best ready VP without dequeuing it.
    pub fn highest_priority_ready(&self) -> Option<Arc<Vp>> {
        self.inner.lock().ready.peek_highest()
    }

    // Adds `vp` to the ready queue at the given effective priority and
    // resets its time slice accordingly.
    fn enqueue_ready_locked(&self, inner: &mut SchedInner, vp: &Arc<Vp>, effective: u8) {
        debug_assert!(!vp.rewa_link.is_linked());
        debug_assert_eq!(vp.suspension_count(), 0);

        vp.set_sched_state(SchedState::Ready);
        vp.set_effective_priority(effective);
        vp.set_quantum_allowance(quantum_allowance_for(effective));
        vp.set_wait_start_time(self.clock.now());
        inner.ready.push(vp.clone());
    }

    fn cancel_timeout_locked(&self, inner: &mut SchedInner, vp: &Vp) {
        if vp.timeout_armed.swap(0, Ordering::AcqRel) == 0 {
            return;
        }
        let mut cursor = inner.timeouts.front_mut();
        loop {
            let found = match cursor.get() {
                None => break,
                Some(v) => core::ptr::eq(v, vp),
            };
            if found {
                cursor.remove();
                break;
            }
            cursor.move_next();
        }
        vp.timeout_deadline.store(QUANTUMS_INFINITY, Ordering::Release);
    }

    fn arm_timeout_locked(&self, inner: &mut SchedInner, vp: &Arc<Vp>, deadline: Quantums) {
        vp.timeout_deadline.store(deadline, Ordering::Release);
        vp.timeout_armed.store(1, Ordering::Release);

        let mut cursor = inner.timeouts.front_mut();
        loop {
            let stop = match cursor.get() {
                None => true,
                Some(v) => v.timeout_deadline.load(Ordering::Acquire) > deadline,
            };
            if stop {
                break;
            }
            cursor.move_next();
        }
        cursor.insert_before(vp.clone());
    }

    /// The timer interrupt: advances the clock, wakes every VP whose
    /// deadline has passed, and charges the running VP's time slice. When
    /// the slice is used up, the VP's effective priority decays by one and
    /// the best ready VP takes over if it is strictly better.
    pub fn on_timer_tick(&self) {
        self.clock.on_tick();
        let now = self.clock.now();

        // First pass: move every VP with an expired timeout back to the
        // ready queue.
        loop {
            let expired = {
                let mut inner = self.inner.lock();
                let mut cursor = inner.timeouts.front_mut();
                let pop = match cursor.get() {
                    None => false,
                    Some(v) => v.timeout_deadline.load(Ordering::Acquire) <= now,
                };
                if pop {
                    cursor.remove()
                } else {
                    None
                }
            };
            let Some(vp) = expired else { break };
            vp.timeout_armed.store(0, Ordering::Release);
            let queue = vp.waiting_on();
            if !queue.is_null() {
                // SAFETY: a wait queue outlives every wait entered on it.
                let queue = unsafe { &*queue };
                self.wake_one(queue, &vp, WakeReason::Timeout, false);
            }
        }

        // Second pass: time slice accounting for the running VP.
        let Some(cur) = self.current() else {
            return;
        };
        let allowance = cur.quantum_allowance().saturating_sub(1);
        cur.set_quantum_allowance(allowance);
        if allowance > 0 {
            return;
        }

        // The slice has expired. Decay the priority, then check whether a
        // strictly better VP is ready; if not, keep running.
        let demoted = cur.effective_priority().saturating_sub(1).max(PRIORITY_LOWEST);
        cur.set_effective_priority(demoted);
        cur.set_quantum_allowance(quantum_allowance_for(demoted));

        let mut inner = self.inner.lock();
        let Some(best) = inner.ready.peek_highest() else {
            return;
        };
        if best.effective_priority() <= cur.effective_priority() {
            return;
        }

        let best = inner.ready.pop_highest().unwrap();
        let base = cur.base_priority();
        self.enqueue_ready_locked(&mut inner, &cur, base);
        best.set_sched_state(SchedState::Running);
        inner.running = Some(best);
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Puts the calling VP on the given wait queue until a waker delivers a
    /// reason, the deadline passes, or the wait is interrupted.
    pub fn wait_on(
        &self,
        cur: &Arc<Vp>,
        queue: &WaitQueue,
        deadline: Quantums,
        interruptible: bool,
    ) -> Result<()> {
        self.wait_on_if(cur, queue, deadline, interruptible, || true)
            .map(|_| ())
    }

    /// Like [`Scheduler::wait_on`], but re-examines `should_wait` after the
    /// VP has entered the wait queue and backs out of the wait if it returns
    /// false. This closes the check-then-wait race for the synchronization
    /// primitives: the waker observes either the not-yet-published condition
    /// or the enqueued waiter, never neither.
    ///
    /// Returns `Ok(true)` if the VP actually waited and was woken with
    /// `Finished`, and `Ok(false)` if the wait was backed out of.
    pub fn wait_on_if(
        &self,
        cur: &Arc<Vp>,
        queue: &WaitQueue,
        deadline: Quantums,
        interruptible: bool,
        should_wait: impl FnOnce() -> bool,
    ) -> Result<bool> {
        debug_assert_ne!(cur.sched_state(), SchedState::Waiting);

        // A pending abort of a call-as-user invocation refuses entry into
        // any new wait up front.
        if cur.is_user_callout_aborted() {
            return_errno!(Errno::EINTR);
        }

        let now = self.clock.now();
        if deadline != QUANTUMS_INFINITY && deadline <= now {
            return_errno!(Errno::ETIMEDOUT);
        }

        self.enter_wait(cur, queue, deadline, interruptible, now);

        if !should_wait() && self.leave_wait(cur, queue) {
            return Ok(false);
        }

        // Park until a waker stores a reason. A waiter with an armed
        // deadline also delivers its own timeout so deadline waits complete
        // even when no timer tick reaches the scheduler.
        let reason = loop {
            let reason = cur.wakeup_reason();
            if reason != WakeReason::None {
                break reason;
            }
            if deadline != QUANTUMS_INFINITY && self.clock.now() >= deadline {
                self.wake_one(queue, cur, WakeReason::Timeout, false);
                continue;
            }
            core::hint::spin_loop();
        };

        self.resume_after_wait(cur);

        match reason {
            WakeReason::Finished => Ok(true),
            WakeReason::Timeout => Err(Error::new(Errno::ETIMEDOUT)),
            _ => Err(Error::new(Errno::EINTR)),
        }
    }

    // Inserts `cur` into the wait queue and hands the CPU to the best ready
    // VP in the driver model.
    fn enter_wait(
        &self,
        cur: &Arc<Vp>,
        queue: &WaitQueue,
        deadline: Quantums,
        interruptible: bool,
        now: Quantums,
    ) {
        let mut list = queue.list();
        wait::insert_sorted(&mut list, cur.clone());
        cur.set_sched_state(SchedState::Waiting);
        cur.set_waiting_on(queue as *const WaitQueue as *mut WaitQueue);
        cur.set_wait_start_time(now);
        cur.set_wakeup_reason(WakeReason::None);
        if interruptible {
            cur.set_flag(VpFlags::INTERRUPTIBLE_WAIT);
        } else {
            cur.clear_flag(VpFlags::INTERRUPTIBLE_WAIT);
        }

        let mut inner = self.inner.lock();
        if deadline != QUANTUMS_INFINITY {
            self.arm_timeout_locked(&mut inner, cur, deadline);
        }
        if inner
            .running
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(running, cur))
        {
            inner.running = inner.ready.pop_highest();
            if let Some(next) = &inner.running {
                next.set_sched_state(SchedState::Running);
            }
            self.context_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Backs out of a wait entered by `enter_wait`. Returns false if a waker
    // got there first; the caller then consumes the wakeup normally.
    fn leave_wait(&self, cur: &Arc<Vp>, queue: &WaitQueue) -> bool {
        let mut list = queue.list();
        if wait::remove_vp(&mut list, cur).is_none() {
            return false;
        }
        let mut inner = self.inner.lock();
        self.cancel_timeout_locked(&mut inner, cur);
        cur.set_waiting_on(core::ptr::null_mut());
        cur.clear_flag(VpFlags::INTERRUPTIBLE_WAIT);
        cur.set_sched_state(SchedState::Running);
        if inner.running.is_none() {
            inner.running = Some(cur.clone());
        }
        true
    }

    // Re-establishes the invariant that a VP resuming from a wait is not on
    // the ready queue.
    fn resume_after_wait(&self, cur: &Arc<Vp>) {
        let mut inner = self.inner.lock();
        if cur.sched_state() == SchedState::Ready && cur.rewa_link.is_linked() {
            inner.ready.remove(cur);
        }
        cur.set_sched_state(SchedState::Running);
        if inner.running.is_none() {
            inner.running = Some(cur.clone());
        }
    }

    /// Wakes `vp` from the given wait queue.
    ///
    /// Does nothing if the VP is not waiting, or if the reason is
    /// `Interrupted` and the VP sits in a non-interruptible wait. A woken VP
    /// receives a priority boost proportional to the time it spent waiting.
    pub fn wake_one(
        &self,
        queue: &WaitQueue,
        vp: &Arc<Vp>,
        reason: WakeReason,
        allow_csw: bool,
    ) -> bool {
        {
            let mut list = queue.list();

            if vp.sched_state() != SchedState::Waiting {
                return false;
            }
            if reason == WakeReason::Interrupted
                && !vp.flags().contains(VpFlags::INTERRUPTIBLE_WAIT)
            {
                return false;
            }
            if wait::remove_vp(&mut list, vp).is_none() {
                return false;
            }

            let mut inner = self.inner.lock();
            self.cancel_timeout_locked(&mut inner, vp);
            vp.set_waiting_on(core::ptr::null_mut());
            vp.clear_flag(VpFlags::INTERRUPTIBLE_WAIT);

            if vp.suspension_count() == 0 {
                // Boost the effective priority in proportion to the time the
                // VP spent waiting, one level per quarter second.
                let now = self.clock.now();
                let quantums_per_quarter = self.quantums_per_quarter.load(Ordering::Relaxed);
                let quarters_slept =
                    now.saturating_sub(vp.wait_start_time()) / quantums_per_quarter;
                let boost = quarters_slept.min(PRIORITY_HIGHEST as u64) as u8;
                let boosted = vp
                    .effective_priority()
                    .saturating_add(boost)
                    .min(PRIORITY_HIGHEST);
                self.enqueue_ready_locked(&mut inner, vp, boosted);
            } else {
                // Suspended: just mark it ready so that resuming it will put
                // it back on the ready queue.
                vp.set_sched_state(SchedState::Ready);
            }
            vp.set_wakeup_reason(reason);
        }

        if allow_csw {
            self.maybe_switch_to(vp);
        }
        true
    }

    /// Wakes up to `count` waiters, front of the queue first.
    pub fn wake_some(
        &self,
        queue: &WaitQueue,
        count: usize,
        reason: WakeReason,
        allow_csw: bool,
    ) -> usize {
        let candidates = {
            let list = queue.list();
            wait::snapshot(&list)
        };

        let mut woken = 0;
        for vp in &candidates {
            if woken == count {
                break;
            }
            if self.wake_one(queue, vp, reason, allow_csw) {
                woken += 1;
            }
        }
        woken
    }

    /// Wakes every waiter with reason `Finished`.
    pub fn wake_all(&self, queue: &WaitQueue, allow_csw: bool) -> usize {
        self.wake_some(queue, usize::MAX, WakeReason::Finished, allow_csw)
    }

    /// Makes every waiter ready without triggering a context switch. Safe to
    /// call from interrupt context.
    pub fn wake_all_from_irq(&self, queue: &WaitQueue) {
        self.wake_some(queue, usize::MAX, WakeReason::Finished, false);
    }

    /// Context-switches to `vp` if it is the best ready VP and at least as
    /// good as the running one. Voluntary, so it only happens while
    /// cooperation is enabled.
    pub fn maybe_switch_to(&self, vp: &Arc<Vp>) {
        if !self.is_cooperation_enabled() {
            return;
        }
        if vp.sched_state() != SchedState::Ready || vp.is_suspended() {
            return;
        }

        let mut inner = self.inner.lock();
        let Some(best) = inner.ready.peek_highest() else {
            return;
        };
        if !Arc::ptr_eq(&best, vp) {
            return;
        }

        match inner.running.clone() {
            None => {
                inner.ready.remove(vp);
                vp.set_sched_state(SchedState::Running);
                inner.running = Some(vp.clone());
                self.context_switches.fetch_add(1, Ordering::Relaxed);
            }
            Some(running) => {
                if vp.effective_priority() < running.effective_priority() {
                    return;
                }
                inner.ready.remove(vp);
                let base = running.base_priority();
                self.enqueue_ready_locked(&mut inner, &running, base);
                vp.set_sched_state(SchedState::Running);
                inner.running = Some(vp.clone());
                self.context_switches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Yields the remainder of the current quantum.
    pub fn yield_now(&self, cur: &Arc<Vp>) {
        let mut inner = self.inner.lock();
        let base = cur.base_priority();
        self.enqueue_ready_locked(&mut inner, cur, base);
        let next = inner.ready.pop_highest().unwrap();
        next.set_sched_state(SchedState::Running);
        if !Arc::ptr_eq(&next, cur) {
            self.context_switches.fetch_add(1, Ordering::Relaxed);
        }
        inner.running = Some(next);
    }

    /// Suspends a VP. Supports nesting; the transition from zero takes the
    /// VP off whatever list it is on and, if it was running, forces a
    /// switch.
    pub fn suspend(&self, vp: &Arc<Vp>) -> Result<()> {
        let count = vp.suspension_count();
        if count == u8::MAX {
            return_errno_with_message!(Errno::EINVAL, "too many nested suspensions");
        }
        vp.set_suspension_count(count + 1);
        if count > 0 {
            return Ok(());
        }

        vp.set_suspension_time(self.clock.now());
        match vp.sched_state() {
            SchedState::Ready => {
                let mut inner = self.inner.lock();
                inner.ready.remove(vp);
            }
            SchedState::Running => {
                let mut inner = self.inner.lock();
                if inner
                    .running
                    .as_ref()
                    .is_some_and(|running| Arc::ptr_eq(running, vp))
                {
                    inner.running = inner.ready.pop_highest();
                    if let Some(next) = &inner.running {
                        next.set_sched_state(SchedState::Running);
                    }
                    self.context_switches.fetch_add(1, Ordering::Relaxed);
                }
                vp.set_sched_state(SchedState::Ready);
            }
            SchedState::Waiting => {
                let queue = vp.waiting_on();
                if !queue.is_null() {
                    // SAFETY: a wait queue outlives every wait entered on it.
                    let queue = unsafe { &*queue };
                    let mut list = queue.list();
                    wait::remove_vp(&mut list, vp);
                }
                let mut inner = self.inner.lock();
                self.cancel_timeout_locked(&mut inner, vp);
                vp.set_waiting_on(core::ptr::null_mut());
                vp.clear_flag(VpFlags::INTERRUPTIBLE_WAIT);
                vp.set_sched_state(SchedState::Ready);
            }
        }
        Ok(())
    }

    /// Resumes a suspended VP. With `force`, the suspension count drops to
    /// zero regardless of nesting depth.
    pub fn resume(&self, vp: &Arc<Vp>, force: bool) {
        let count = vp.suspension_count();
        if count == 0 {
            return;
        }
        let new_count = if force { 0 } else { count - 1 };
        vp.set_suspension_count(new_count);
        if new_count > 0 {
            return;
        }

        {
            let mut inner = self.inner.lock();
            let base = vp.base_priority();
            self.enqueue_ready_locked(&mut inner, vp, base);
        }
        self.maybe_switch_to(vp);
    }

    /// Changes the base priority of a VP. A running VP keeps its current
    /// quantum; a ready or waiting VP picks up the new priority when it is
    /// next enqueued.
    pub fn set_priority(&self, vp: &Arc<Vp>, priority: u8) -> Result<()> {
        if priority > PRIORITY_HIGHEST {
            return_errno_with_message!(Errno::EINVAL, "priority out of range");
        }
        vp.set_base_priority(priority);
        if vp.sched_state() == SchedState::Running {
            vp.set_effective_priority(priority);
            vp.set_quantum_allowance(quantum_allowance_for(priority));
        }
        Ok(())
    }

    /// Hands the calling VP over to the finalizer. The VP must not sit on
    /// any queue. Wakes the boot VP when enough corpses have piled up.
    pub fn terminate_vp(&self, vp: &Arc<Vp>) {
        vp.set_lifecycle_state(LifecycleState::Terminating);
        vp.set_flag(VpFlags::TERMINATED);

        let wake_boot = {
            let mut inner = self.inner.lock();
            debug_assert!(!vp.rewa_link.is_linked());
            inner.finalizer.push_back(vp.clone());
            inner.finalizer_count += 1;

            if inner
                .running
                .as_ref()
                .is_some_and(|running| Arc::ptr_eq(running, vp))
            {
                inner.running = inner.ready.pop_highest();
                if let Some(next) = &inner.running {
                    next.set_sched_state(SchedState::Running);
                }
                self.context_switches.fetch_add(1, Ordering::Relaxed);
            }
            inner.finalizer_count >= FINALIZE_NOW_THRESHOLD
        };

        if wake_boot {
            if let Some(boot) = self.boot_vp.get().cloned() {
                self.wake_one(&self.scheduler_wait_queue, &boot, WakeReason::Interrupted, true);
            }
        }
    }

    /// How many dead VPs await finalization.
    pub fn finalizer_pending(&self) -> usize {
        self.inner.lock().finalizer_count
    }

    /// Drains the finalizer queue. Dropping the returned handles destroys
    /// the VPs.
    pub fn finalize_dead_vps(&self) -> Vec<Arc<Vp>> {
        let mut inner = self.inner.lock();
        let mut dead = Vec::with_capacity(inner.finalizer_count);
        while let Some(vp) = inner.finalizer.pop_front() {
            dead.push(vp);
        }
        inner.finalizer_count = 0;
        dead
    }

    /// One round of the boot VP's service loop: waits for finalization work
    /// (or the one-second heartbeat) and drains the finalizer queue.
    pub fn boot_service_once(&self, cur: &Arc<Vp>) -> Vec<Arc<Vp>> {
        while self.finalizer_pending() == 0 {
            let deadline = self.clock.deadline_after(QUANTUMS_PER_SECOND);
            let _ = self.wait_on(cur, &self.scheduler_wait_queue, deadline, true);
        }
        self.finalize_dead_vps()
    }

    /// Blocks the calling VP for at least `quantums` quantums.
    pub fn delay(&self, cur: &Arc<Vp>, quantums: Quantums) {
        let deadline = self.clock.deadline_after(quantums);
        let _ = self.wait_on(cur, &self.sleep_queue, deadline, false);
    }

    /// Sends a signal to a VP. The signal is recorded as pending; if it is
    /// unmasked and the VP sits in an interruptible wait, the wait is
    /// aborted.
    pub fn send_signal(&self, vp: &Arc<Vp>, signo: u32) -> Result<()> {
        if signo == 0 || signo > SIGNAL_MAX {
            return_errno_with_message!(Errno::EINVAL, "bad signal number");
        }
        vp.add_pending_signal(signo);
        if vp.signal_mask() & (1 << (signo - 1)) != 0 {
            return Ok(());
        }
        self.interrupt_wait(vp);
        Ok(())
    }

    /// Aborts an in-flight call-as-user invocation. Idempotent; any current
    /// or future interruptible wait of the VP returns `Interrupted` until
    /// the invocation has unwound.
    pub fn abort_user_callout(&self, vp: &Arc<Vp>) {
        if !vp.flags().contains(VpFlags::CALLOUT_IN_PROGRESS) {
            return;
        }
        vp.set_flag(VpFlags::CALLOUT_ABORTED);
        self.interrupt_wait(vp);
    }

    fn interrupt_wait(&self, vp: &Arc<Vp>) {
        if vp.sched_state() != SchedState::Waiting
            || !vp.flags().contains(VpFlags::INTERRUPTIBLE_WAIT)
        {
            return;
        }
        let queue = vp.waiting_on();
        if !queue.is_null() {
            // SAFETY: a wait queue outlives every wait entered on it.
            let queue = unsafe { &*queue };
            self.wake_one(queue, vp, WakeReason::Interrupted, true);
        }
    }
}
