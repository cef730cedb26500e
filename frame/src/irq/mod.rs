// SPDX-License-Identifier: MPL-2.0

//! The interrupt controller.
//!
//! The controller keeps one priority-sorted handler table per IRQ line.
//! Handlers are either direct closures, invoked in interrupt context, or
//! counting semaphores that receive one release per interrupt. Handler
//! tables are rebuilt on mutation and swapped in atomically with respect to
//! dispatch, and an IRQ source is enabled in the chip exactly while its
//! table is non-empty.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::prelude::*;
use crate::sched::Scheduler;
use crate::sync::{Semaphore, SpinLock};

/// The number of IRQ lines the controller manages.
pub const IRQ_COUNT: usize = 16;

/// An IRQ line number.
pub type IrqId = usize;

/// The identity of a registered interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

pub const IRQ_HANDLER_PRIORITY_HIGHEST: i32 = i8::MAX as i32;
pub const IRQ_HANDLER_PRIORITY_LOWEST: i32 = i8::MIN as i32;

/// The chip-level enable/disable hooks for IRQ sources.
pub trait IrqChip: Send + Sync {
    fn enable_line(&self, irq: IrqId);
    fn disable_line(&self, irq: IrqId);
}

/// A chip that ignores enable/disable requests. Stands in for the real
/// chipset glue in tests.
pub struct NopChip;

impl IrqChip for NopChip {
    fn enable_line(&self, _irq: IrqId) {}
    fn disable_line(&self, _irq: IrqId) {}
}

enum HandlerKind {
    /// Invoked in interrupt context.
    Direct(Box<dyn Fn() + Send + Sync>),
    /// Receives one release per interrupt, through the interrupt-safe
    /// release path.
    Semaphore(Arc<Semaphore>),
}

struct Handler {
    id: HandlerId,
    priority: i8,
    enabled: core::sync::atomic::AtomicBool,
    kind: HandlerKind,
}

type HandlerTable = SmallVec<[Arc<Handler>; 2]>;

struct ControllerInner {
    tables: [HandlerTable; IRQ_COUNT],
    next_id: u32,
}

/// The central registry of interrupt handlers.
pub struct InterruptController {
    inner: SpinLock<ControllerInner>,
    chip: Box<dyn IrqChip>,
    sched: Arc<Scheduler>,
    servicing_count: AtomicUsize,
    spurious_count: AtomicU64,
}

impl InterruptController {
    pub fn new(chip: Box<dyn IrqChip>, sched: Arc<Scheduler>) -> Self {
        Self {
            inner: SpinLock::new(ControllerInner {
                tables: core::array::from_fn(|_| SmallVec::new()),
                next_id: 1,
            }),
            chip,
            sched,
            servicing_count: AtomicUsize::new(0),
            spurious_count: AtomicU64::new(0),
        }
    }

    /// Registers a direct handler for `irq`. The closure runs in interrupt
    /// context every time the interrupt fires. Handlers start out disabled.
    pub fn add_direct_handler(
        &self,
        irq: IrqId,
        priority: i32,
        closure: impl Fn() + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        self.add_handler(irq, priority, HandlerKind::Direct(Box::new(closure)))
    }

    /// Registers a counting semaphore that receives one release per
    /// occurrence of `irq`. Handlers start out disabled.
    pub fn add_semaphore_handler(
        &self,
        irq: IrqId,
        priority: i32,
        semaphore: Arc<Semaphore>,
    ) -> Result<HandlerId> {
        self.add_handler(irq, priority, HandlerKind::Semaphore(semaphore))
    }

    fn add_handler(&self, irq: IrqId, priority: i32, kind: HandlerKind) -> Result<HandlerId> {
        if irq >= IRQ_COUNT {
            return_errno_with_message!(Errno::EINVAL, "bad IRQ number");
        }
        let priority = priority
            .clamp(IRQ_HANDLER_PRIORITY_LOWEST, IRQ_HANDLER_PRIORITY_HIGHEST)
            as i8;

        let mut inner = self.inner.lock();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;

        let handler = Arc::new(Handler {
            id,
            priority,
            enabled: core::sync::atomic::AtomicBool::new(false),
            kind,
        });

        // Build the replacement table and swap it in whole, so dispatch
        // never observes a partially edited table. Equal priorities keep
        // their insertion order.
        let mut table: HandlerTable = inner.tables[irq].clone();
        let pos = table
            .iter()
            .position(|h| h.priority < priority)
            .unwrap_or(table.len());
        table.insert(pos, handler);
        let was_empty = inner.tables[irq].is_empty();
        inner.tables[irq] = table;

        if was_empty {
            self.chip.enable_line(irq);
            log::debug!("irq: line {} enabled", irq);
        }
        Ok(id)
    }

    /// Removes a handler. Unknown ids are ignored.
    pub fn remove_handler(&self, id: HandlerId) -> Result<()> {
        let mut inner = self.inner.lock();
        for irq in 0..IRQ_COUNT {
            let Some(pos) = inner.tables[irq].iter().position(|h| h.id == id) else {
                continue;
            };
            let mut table: HandlerTable = inner.tables[irq].clone();
            table.remove(pos);
            let now_empty = table.is_empty();
            inner.tables[irq] = table;
            if now_empty {
                self.chip.disable_line(irq);
                log::debug!("irq: line {} disabled", irq);
            }
            break;
        }
        Ok(())
    }

    /// Enables or disables a handler. Disabled handlers ignore interrupt
    /// requests.
    pub fn set_handler_enabled(&self, id: HandlerId, enabled: bool) -> Result<()> {
        let inner = self.inner.lock();
        let handler = Self::find_locked(&inner, id)?;
        handler.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    pub fn is_handler_enabled(&self, id: HandlerId) -> Result<bool> {
        let inner = self.inner.lock();
        let handler = Self::find_locked(&inner, id)?;
        Ok(handler.enabled.load(Ordering::Acquire))
    }

    fn find_locked(inner: &ControllerInner, id: HandlerId) -> Result<Arc<Handler>> {
        for table in &inner.tables {
            if let Some(handler) = table.iter().find(|h| h.id == id) {
                return Ok(handler.clone());
            }
        }
        return_errno_with_message!(Errno::EINVAL, "unknown interrupt handler")
    }

    /// Invokes the handlers registered for `irq`, in priority order. Called
    /// by the low-level interrupt prologue.
    pub fn dispatch(&self, irq: IrqId) {
        if irq >= IRQ_COUNT {
            return;
        }
        self.servicing_count.fetch_add(1, Ordering::Acquire);

        let table: HandlerTable = self.inner.lock().tables[irq].clone();
        if table.is_empty() {
            self.spurious_count.fetch_add(1, Ordering::Relaxed);
        }
        for handler in &table {
            if !handler.enabled.load(Ordering::Acquire) {
                continue;
            }
            match &handler.kind {
                HandlerKind::Direct(closure) => closure(),
                HandlerKind::Semaphore(sema) => sema.release_from_irq(&self.sched, 1),
            }
        }

        self.servicing_count.fetch_sub(1, Ordering::Release);
    }

    /// Whether the caller runs in interrupt context.
    pub fn is_servicing_interrupt(&self) -> bool {
        self.servicing_count.load(Ordering::Acquire) != 0
    }

    /// How many interrupt requests arrived on lines with no handlers.
    pub fn spurious_interrupt_count(&self) -> u64 {
        self.spurious_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::MonotonicClock;
    use core::sync::atomic::AtomicU32;

    struct RecordingChip {
        enabled: SpinLock<Vec<IrqId>>,
        disabled: SpinLock<Vec<IrqId>>,
    }

    impl RecordingChip {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                enabled: SpinLock::new(Vec::new()),
                disabled: SpinLock::new(Vec::new()),
            })
        }
    }

    impl IrqChip for Arc<RecordingChip> {
        fn enable_line(&self, irq: IrqId) {
            self.enabled.lock().push(irq);
        }
        fn disable_line(&self, irq: IrqId) {
            self.disabled.lock().push(irq);
        }
    }

    fn controller() -> (InterruptController, Arc<RecordingChip>) {
        let chip = RecordingChip::new();
        let sched = Arc::new(Scheduler::new(Arc::new(MonotonicClock::new())));
        (
            InterruptController::new(Box::new(chip.clone()), sched),
            chip,
        )
    }

    #[test]
    fn line_enablement_follows_table_occupancy() {
        let (intc, chip) = controller();

        let a = intc.add_direct_handler(3, 0, || {}).unwrap();
        let b = intc.add_direct_handler(3, 0, || {}).unwrap();
        assert_eq!(*chip.enabled.lock(), vec![3]);

        intc.remove_handler(a).unwrap();
        assert!(chip.disabled.lock().is_empty());
        intc.remove_handler(b).unwrap();
        assert_eq!(*chip.disabled.lock(), vec![3]);
    }

    #[test]
    fn handlers_run_in_priority_order_with_stable_ties() {
        let (intc, _) = controller();
        let order = Arc::new(SpinLock::new(Vec::new()));

        let mut ids = Vec::new();
        for (priority, tag) in [(10, 'a'), (20, 'b'), (10, 'c')] {
            let order = order.clone();
            let id = intc
                .add_direct_handler(5, priority, move || order.lock().push(tag))
                .unwrap();
            ids.push(id);
        }
        for id in &ids {
            intc.set_handler_enabled(*id, true).unwrap();
        }

        intc.dispatch(5);
        assert_eq!(*order.lock(), vec!['b', 'a', 'c']);
    }

    #[test]
    fn disabled_handlers_are_skipped() {
        let (intc, _) = controller();
        let hits = Arc::new(AtomicU32::new(0));
        let id = {
            let hits = hits.clone();
            intc.add_direct_handler(1, 0, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
        };

        // Handlers start out disabled.
        intc.dispatch(1);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        intc.set_handler_enabled(id, true).unwrap();
        assert!(intc.is_handler_enabled(id).unwrap());
        intc.dispatch(1);
        intc.dispatch(1);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        intc.set_handler_enabled(id, false).unwrap();
        intc.dispatch(1);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn semaphore_handlers_release_one_permit_per_interrupt() {
        let (intc, _) = controller();
        let sema = Arc::new(Semaphore::new(0));
        let id = intc.add_semaphore_handler(7, 0, sema.clone()).unwrap();
        intc.set_handler_enabled(id, true).unwrap();

        intc.dispatch(7);
        intc.dispatch(7);
        assert_eq!(sema.value(), 2);
    }

    #[test]
    fn priorities_are_clamped_into_range() {
        let (intc, _) = controller();
        intc.add_direct_handler(0, 1000, || {}).unwrap();
        intc.add_direct_handler(0, -1000, || {}).unwrap();
        let inner = intc.inner.lock();
        assert_eq!(inner.tables[0][0].priority, i8::MAX);
        assert_eq!(inner.tables[0][1].priority, i8::MIN);
    }

    #[test]
    fn spurious_interrupts_are_counted() {
        let (intc, _) = controller();
        intc.dispatch(9);
        intc.dispatch(9);
        assert_eq!(intc.spurious_interrupt_count(), 2);
        assert!(!intc.is_servicing_interrupt());
    }

    #[test]
    fn bad_irq_number_is_rejected() {
        let (intc, _) = controller();
        let err = intc.add_direct_handler(IRQ_COUNT, 0, || {}).unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
    }
}
