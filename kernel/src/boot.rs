// SPDX-License-Identifier: MPL-2.0

//! Boot-time wiring of the kernel subsystems.
//!
//! All global kernel state is collected into one [`KernelServices`] value
//! that is wired once at boot. Tests build their own instance (with mock
//! pieces where needed) instead of going through the global.

use kestrel_frame::clock::MonotonicClock;
use kestrel_frame::irq::{InterruptController, IrqChip, IrqId};
use kestrel_frame::mm::Allocator;
use kestrel_frame::sched::{Scheduler, Vp, VpPool};
use spin::Once;

use crate::dispatch::DispatchQueue;
use crate::fs::FilesystemManager;
use crate::prelude::*;
use crate::process::{ExecutableLoader, ProcessManager};

/// The IRQ line of the quantum timer.
pub const IRQ_QUANTUM_TIMER: IrqId = 5;

/// The wired-up kernel: every subsystem singleton in one place.
pub struct KernelServices {
    pub clock: Arc<MonotonicClock>,
    pub sched: Arc<Scheduler>,
    pub pool: Arc<VpPool>,
    pub allocator: Arc<Allocator>,
    pub intc: Arc<InterruptController>,
    pub fs_manager: Arc<FilesystemManager>,
    pub processes: Arc<ProcessManager>,
    pub kernel_queue: Arc<DispatchQueue>,
    pub loader: Arc<dyn ExecutableLoader>,
    pub boot_vp: Arc<Vp>,
    pub idle_vp: Arc<Vp>,
}

impl KernelServices {
    /// Wires the kernel together: scheduler with boot and idle VPs, VP
    /// pool, interrupt controller with the quantum timer hooked up, the
    /// filesystem and process registries and the kernel dispatch queue.
    pub fn new(
        allocator: Arc<Allocator>,
        chip: Box<dyn IrqChip>,
        loader: Arc<dyn ExecutableLoader>,
    ) -> Arc<Self> {
        let clock = Arc::new(MonotonicClock::new());
        let sched = Arc::new(Scheduler::new(clock.clone()));
        let (boot_vp, idle_vp) = sched.bootstrap();
        let pool = Arc::new(VpPool::new());
        let intc = Arc::new(InterruptController::new(chip, sched.clone()));

        // The scheduler runs off the quantum timer interrupt.
        {
            let sched = sched.clone();
            let handler = intc
                .add_direct_handler(IRQ_QUANTUM_TIMER, i8::MAX as i32 - 1, move || {
                    sched.on_timer_tick();
                })
                .expect("quantum timer handler");
            intc.set_handler_enabled(handler, true)
                .expect("quantum timer handler");
        }

        let kernel_queue = DispatchQueue::new(sched.clone(), pool.clone());

        Arc::new(Self {
            clock,
            sched,
            pool,
            allocator,
            intc,
            fs_manager: Arc::new(FilesystemManager::new()),
            processes: Arc::new(ProcessManager::new()),
            kernel_queue,
            loader,
            boot_vp,
            idle_vp,
        })
    }

    /// A scheduling context executing as the boot VP.
    pub fn boot_ctx(&self) -> SchedCtx<'_> {
        SchedCtx::new(&self.sched, &self.boot_vp)
    }
}

static KERNEL: Once<Arc<KernelServices>> = Once::new();

/// Wires the kernel at boot. Later calls return the existing instance.
pub fn init(
    allocator: Arc<Allocator>,
    chip: Box<dyn IrqChip>,
    loader: Arc<dyn ExecutableLoader>,
) -> &'static Arc<KernelServices> {
    KERNEL.call_once(|| KernelServices::new(allocator, chip, loader))
}

/// The wired kernel, once [`init`] has run.
pub fn kernel() -> Option<&'static Arc<KernelServices>> {
    KERNEL.get()
}
