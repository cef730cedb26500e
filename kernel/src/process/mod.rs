// SPDX-License-Identifier: MPL-2.0

//! The process model.
//!
//! A process owns its address space, its I/O channel descriptor table, its
//! main dispatch queue and the tombstones of its terminated children. The
//! termination protocol runs asynchronously on the kernel dispatch queue:
//! it tears down the process's own queue, reaps the whole child tree, and
//! only then delivers the process's tombstone to its parent and unregisters
//! it.

mod loader;
mod table;
#[cfg(test)]
mod test;

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use kestrel_frame::clock::QUANTUMS_INFINITY;
use kestrel_frame::config::PAGE_SIZE;
use kestrel_frame::sync::{CondVar, Mutex};

use crate::boot::KernelServices;
use crate::dispatch::DispatchQueue;
use crate::io::IoChannel;
use crate::prelude::*;
use crate::vm::AddressSpace;

pub use loader::{ExecutableLoader, FlatBinaryLoader, LoadedImage};
pub use table::ProcessManager;

/// A process id. Positive for real processes; `-1` stands for "any child"
/// in wait calls.
pub type Pid = i32;

pub const ANY_CHILD: Pid = -1;

/// The combined size limit for the argument and environment tables.
pub const ARG_MAX: usize = 0x10000;

// The bounded child table; running out of slots is a kernel bug, not a
// recoverable condition.
const CHILD_PROC_CAPACITY: usize = 32;

const INITIAL_DESC_TABLE_SIZE: usize = 64;
const DESC_TABLE_INCREMENT: usize = 64;

bitflags::bitflags! {
    pub struct SpawnOptions: u32 {
        /// Do not duplicate the parent's first three descriptors into the
        /// child.
        const NO_DEFAULT_DESCRIPTOR_INHERITANCE = 1 << 0;
    }
}

/// Everything needed to spawn a child process.
pub struct SpawnArgs<'a> {
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
    pub options: SpawnOptions,
    pub image: &'a [u8],
}

/// The launch record placed at the bottom of a process's argument area. The
/// embedded pointers are process-address-space addresses.
#[repr(C)]
pub struct ProcessArguments {
    pub version: u32,
    pub reserved: u32,
    pub arguments_size: usize,
    pub argc: usize,
    pub argv: *mut *mut u8,
    pub envp: *mut *mut u8,
    pub image_base: *mut u8,
}

// The record a parent keeps about a terminated child until it is consumed
// by a wait.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    pid: Pid,
    status: i32,
}

struct ProcState {
    channels: Vec<Option<Arc<IoChannel>>>,
    tombstones: VecDeque<Tombstone>,
    child_pids: [Pid; CHILD_PROC_CAPACITY],
}

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// The process the given VP currently executes for, reached through the
/// VP's dispatch queue binding. `None` for VPs not owned by any process.
pub fn current_process(vp: &kestrel_frame::sched::Vp) -> Option<Arc<Process>> {
    let queue = vp.dispatch_queue()?.upgrade()?;
    let queue = queue.downcast::<DispatchQueue>().ok()?;
    queue.owning_process()
}

pub struct Process {
    pid: Pid,
    ppid: Pid,
    services: Arc<KernelServices>,

    is_terminating: AtomicBool,
    termination_started: AtomicBool,
    exit_code: AtomicI32,

    lock: Mutex<ProcState>,
    tombstone_cv: CondVar,

    main_queue: Arc<DispatchQueue>,
    address_space: AddressSpace,
    image_base: AtomicPtr<u8>,
    arguments_base: AtomicPtr<u8>,
}

impl Process {
    fn create(services: Arc<KernelServices>, ppid: Pid) -> Arc<Self> {
        let main_queue = DispatchQueue::new(services.sched.clone(), services.pool.clone());
        let address_space = AddressSpace::new(services.allocator.clone());

        let process = Arc::new(Self {
            pid: alloc_pid(),
            ppid,
            services,
            is_terminating: AtomicBool::new(false),
            termination_started: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            lock: Mutex::new(ProcState {
                channels: vec![None; INITIAL_DESC_TABLE_SIZE],
                tombstones: VecDeque::new(),
                child_pids: [0; CHILD_PROC_CAPACITY],
            }),
            tombstone_cv: CondVar::new(),
            main_queue,
            address_space,
            image_base: AtomicPtr::new(core::ptr::null_mut()),
            arguments_base: AtomicPtr::new(core::ptr::null_mut()),
        });
        process.main_queue.set_owner(Arc::downgrade(&process));
        process
    }

    /// Creates and registers the root process.
    pub fn create_root(services: &Arc<KernelServices>) -> Arc<Self> {
        let process = Self::create(services.clone(), 0);
        services.processes.register(&process);
        process
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ppid(&self) -> Pid {
        self.ppid
    }

    pub fn is_root(&self) -> bool {
        self.ppid == 0
    }

    pub fn is_terminating(&self) -> bool {
        self.is_terminating.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn main_dispatch_queue(&self) -> &Arc<DispatchQueue> {
        &self.main_queue
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn image_base(&self) -> *mut u8 {
        self.image_base.load(Ordering::Acquire)
    }

    /// The base of the process argument area, a process-address-space
    /// address.
    pub fn arguments_base(&self) -> *mut u8 {
        self.arguments_base.load(Ordering::Acquire)
    }

    //
    // I/O channel descriptors
    //

    /// Registers an I/O channel with the process, returning the lowest free
    /// descriptor. The process holds a strong reference to the channel
    /// until it is unregistered.
    pub fn register_channel(&self, ctx: &SchedCtx, channel: &Arc<IoChannel>) -> Result<i32> {
        let mut state = self.lock.lock(ctx)?;

        let slot = state.channels.iter().position(|c| c.is_none());
        let fd = match slot {
            Some(fd) => fd,
            None => {
                // Table is dense and full: grow it by the fixed increment.
                let fd = state.channels.len();
                state
                    .channels
                    .resize(fd + DESC_TABLE_INCREMENT, None);
                fd
            }
        };
        state.channels[fd] = Some(channel.clone());
        Ok(fd as i32)
    }

    /// Removes a descriptor and hands the strong reference back to the
    /// caller, who closes and releases it.
    pub fn unregister_channel(&self, ctx: &SchedCtx, fd: i32) -> Result<Arc<IoChannel>> {
        let mut state = self.lock.lock(ctx)?;
        let channel = usize::try_from(fd)
            .ok()
            .and_then(|fd| state.channels.get_mut(fd))
            .and_then(|slot| slot.take());
        channel.ok_or(Error::with_message(Errno::EBADF, "no such descriptor"))
    }

    /// A strong reference to the channel behind `fd`.
    pub fn channel_for_descriptor(&self, ctx: &SchedCtx, fd: i32) -> Result<Arc<IoChannel>> {
        let state = self.lock.lock(ctx)?;
        usize::try_from(fd)
            .ok()
            .and_then(|fd| state.channels.get(fd))
            .and_then(|slot| slot.clone())
            .ok_or(Error::with_message(Errno::EBADF, "no such descriptor"))
    }

    fn close_all_channels(&self, ctx: &SchedCtx) {
        let channels: Vec<Arc<IoChannel>> = {
            let Ok(mut state) = self.lock.lock(ctx) else {
                return;
            };
            state
                .channels
                .iter_mut()
                .filter_map(|slot| slot.take())
                .collect()
        };
        for channel in channels {
            // Close errors are advisory on the teardown path.
            let _ = channel.close(ctx);
        }
    }

    //
    // Children
    //

    fn adopt_child(&self, ctx: &SchedCtx, child_pid: Pid) -> Result<()> {
        let mut state = self.lock.lock(ctx)?;
        for slot in state.child_pids.iter_mut() {
            if *slot == 0 {
                *slot = child_pid;
                return Ok(());
            }
        }
        panic!("process {}: child table overflow", self.pid);
    }

    fn abandon_child_locked(state: &mut ProcState, child_pid: Pid) {
        for slot in state.child_pids.iter_mut() {
            if *slot == child_pid {
                *slot = 0;
                break;
            }
        }
    }

    fn any_child_pid(&self, ctx: &SchedCtx) -> Result<Pid> {
        let state = self.lock.lock(ctx)?;
        Ok(state
            .child_pids
            .iter()
            .copied()
            .find(|&pid| pid > 0)
            .unwrap_or(0))
    }

    /// Creates a child process: inherits stdio descriptors (unless opted
    /// out), copies the argument and environment vectors into the child's
    /// address space, loads the executable image and dispatches its entry
    /// point on the child's main queue.
    pub fn spawn_child(&self, ctx: &SchedCtx, args: &SpawnArgs) -> Result<Pid> {
        let child = Process::create(self.services.clone(), self.pid);

        // The child is not visible to anyone yet, so its state can be set
        // up without taking its lock.
        if !args
            .options
            .contains(SpawnOptions::NO_DEFAULT_DESCRIPTOR_INHERITANCE)
        {
            let stdio: Vec<Option<Arc<IoChannel>>> = {
                let state = self.lock.lock(ctx)?;
                state.channels.iter().take(3).cloned().collect()
            };
            let mut child_state = child.lock.lock(ctx)?;
            for (fd, channel) in stdio.into_iter().enumerate() {
                let Some(channel) = channel else { continue };
                child_state.channels[fd] = Some(channel.dup(ctx)?);
            }
        }

        self.adopt_child(ctx, child.pid)?;

        let spawned = self.exec_into(ctx, &child, args);
        if let Err(err) = spawned {
            let mut state = self.lock.lock(ctx)?;
            Self::abandon_child_locked(&mut state, child.pid);
            return Err(err);
        }

        self.services.processes.register(&child);
        log::debug!("process {}: spawned child {}", self.pid, child.pid);
        Ok(child.pid)
    }

    fn exec_into(&self, ctx: &SchedCtx, child: &Arc<Process>, args: &SpawnArgs) -> Result<()> {
        child.copy_in_arguments(args.argv, args.envp)?;

        let image = self.services.loader.load(&child.address_space, args.image)?;
        child.image_base.store(image.image_base, Ordering::Release);

        // Patch the image base into the argument area now that it is known.
        let args_base = child.arguments_base();
        if !args_base.is_null() {
            // SAFETY: `args_base` points at the ProcessArguments record this
            // process wrote in `copy_in_arguments`.
            unsafe {
                (*(args_base as *mut ProcessArguments)).image_base = image.image_base;
            }
        }

        let entry = image.entry_point as usize;
        child
            .main_queue
            .dispatch_user(
                ctx,
                Box::new(move |_ctx| {
                    // In a real system this trampolines into user space at
                    // `entry`; the hosted kernel records the launch.
                    log::trace!("entering user space at {:#x}", entry);
                }),
            )
    }

    // Computes the byte size of one argument table: the pointer slots
    // (including the NULL terminator) plus the NUL-terminated strings.
    fn arg_table_size(table: &[&str]) -> usize {
        let ptrs = (table.len() + 1) * core::mem::size_of::<*mut u8>();
        let strings: usize = table.iter().map(|s| s.len() + 1).sum();
        ptrs + strings
    }

    /// Copies the argument and environment vectors into the process address
    /// space, laying out the [`ProcessArguments`] record, the two pointer
    /// tables and the string pool in one page-aligned allocation.
    fn copy_in_arguments(&self, argv: &[&str], envp: &[&str]) -> Result<()> {
        let nbytes_argv = Self::arg_table_size(argv);
        let nbytes_envp = Self::arg_table_size(envp);
        if nbytes_argv + nbytes_envp > ARG_MAX {
            return_errno_with_message!(Errno::E2BIG, "argument list too long");
        }

        let nbytes = core::mem::size_of::<ProcessArguments>() + nbytes_argv + nbytes_envp;
        let nbytes = nbytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let base = self.address_space.allocate_cleared(nbytes)?;

        // SAFETY: `base` points at `nbytes` fresh zeroed bytes owned by
        // this address space; the layout below stays inside them.
        unsafe {
            let header = base as *mut ProcessArguments;
            let argv_table = base.add(core::mem::size_of::<ProcessArguments>()) as *mut *mut u8;
            let envp_table = argv_table.add(argv.len() + 1);
            let mut string_pool = envp_table.add(envp.len() + 1) as *mut u8;

            for (i, arg) in argv.iter().enumerate() {
                *argv_table.add(i) = string_pool;
                core::ptr::copy_nonoverlapping(arg.as_ptr(), string_pool, arg.len());
                string_pool = string_pool.add(arg.len());
                *string_pool = 0;
                string_pool = string_pool.add(1);
            }
            *argv_table.add(argv.len()) = core::ptr::null_mut();

            for (i, env) in envp.iter().enumerate() {
                *envp_table.add(i) = string_pool;
                core::ptr::copy_nonoverlapping(env.as_ptr(), string_pool, env.len());
                string_pool = string_pool.add(env.len());
                *string_pool = 0;
                string_pool = string_pool.add(1);
            }
            *envp_table.add(envp.len()) = core::ptr::null_mut();

            *header = ProcessArguments {
                version: core::mem::size_of::<ProcessArguments>() as u32,
                reserved: 0,
                arguments_size: nbytes,
                argc: argv.len(),
                argv: argv_table,
                envp: envp_table,
                image_base: core::ptr::null_mut(),
            };
        }

        self.arguments_base.store(base, Ordering::Release);
        Ok(())
    }

    //
    // Termination
    //

    /// Triggers the termination of the process. Only the exit code of the
    /// first call is kept; the heavy lifting happens asynchronously on the
    /// kernel dispatch queue. Terminating the root process is fatal.
    pub fn terminate(self: &Arc<Self>, ctx: &SchedCtx, exit_code: i32) {
        if self.is_root() {
            panic!("attempt to terminate the root process");
        }
        if self.is_terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        self.exit_code.store(exit_code, Ordering::Release);

        let this = self.clone();
        let queued = self.services.kernel_queue.dispatch(
            ctx,
            Box::new(move |ctx| this.do_terminate(ctx)),
        );
        if queued.is_err() {
            log::error!("process {}: kernel queue rejected termination", self.pid);
        }
    }

    /// The asynchronous part of the termination protocol. Idempotent.
    pub fn do_terminate(self: &Arc<Self>, ctx: &SchedCtx) {
        if self.termination_started.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("process {}: terminating", self.pid);

        // Stop all user execution first: flush and abort the main queue,
        // then wait until it has fully unwound.
        let _ = self.main_queue.terminate(ctx);
        let _ = self.main_queue.wait_for_termination_completed(ctx);

        // Reap the whole child tree. A child may be terminating on its own
        // concurrently, so every step is tolerant of losing the race.
        loop {
            let child_pid = match self.any_child_pid(ctx) {
                Ok(pid) if pid > 0 => pid,
                _ => break,
            };
            let Some(child) = self.services.processes.process_for_pid(child_pid) else {
                // Gone already; drop it from the table.
                if let Ok(mut state) = self.lock.lock(ctx) {
                    Self::abandon_child_locked(&mut state, child_pid);
                }
                continue;
            };
            child.is_terminating.swap(true, Ordering::AcqRel);
            child.do_terminate(ctx);
            let _ = self.wait_for_termination_of_child(ctx, ANY_CHILD);
        }

        self.close_all_channels(ctx);
        self.address_space.destroy();

        // Leave the tombstone with the parent. A parent that is itself
        // terminating refuses it; handing the tombstone to the session
        // leader instead remains future work.
        if let Some(parent) = self.services.processes.process_for_pid(self.ppid) {
            if let Err(err) = parent.on_child_did_terminate(ctx, self.pid, self.exit_code()) {
                if err.error() == Errno::ESRCH {
                    log::debug!(
                        "process {}: parent {} is terminating, dropping tombstone",
                        self.pid,
                        self.ppid
                    );
                }
            }
        }

        self.services.processes.unregister(self.pid);
        log::debug!("process {}: terminated", self.pid);
    }

    /// Records the termination of a child: removes it from the child table,
    /// appends a tombstone and wakes every waiter. Refused with `ESRCH`
    /// while this process is itself terminating, so the child can escalate.
    pub fn on_child_did_terminate(
        &self,
        ctx: &SchedCtx,
        child_pid: Pid,
        status: i32,
    ) -> Result<()> {
        if self.is_terminating() {
            return_errno_with_message!(Errno::ESRCH, "parent is terminating");
        }

        let mut state = self.lock.lock(ctx)?;
        Self::abandon_child_locked(&mut state, child_pid);
        state.tombstones.push_back(Tombstone {
            pid: child_pid,
            status,
        });
        self.tombstone_cv.wake_and_unlock(ctx, state, true);
        Ok(())
    }

    /// Waits for the termination of the given child (or of any child with
    /// [`ANY_CHILD`]) and consumes its tombstone. `ECHILD` if there is no
    /// matching child to wait for.
    pub fn wait_for_termination_of_child(
        &self,
        ctx: &SchedCtx,
        pid: Pid,
    ) -> Result<(Pid, i32)> {
        let mut state = self.lock.lock(ctx)?;

        if pid == ANY_CHILD
            && state.tombstones.is_empty()
            && !state.child_pids.iter().any(|&p| p > 0)
        {
            return_errno_with_message!(Errno::ECHILD, "nothing to wait for");
        }

        loop {
            let tombstone = if pid == ANY_CHILD {
                // The oldest recorded tombstone wins.
                state.tombstones.pop_front()
            } else {
                state
                    .tombstones
                    .iter()
                    .position(|t| t.pid == pid)
                    .and_then(|idx| state.tombstones.remove(idx))
            };
            if let Some(tombstone) = tombstone {
                return Ok((tombstone.pid, tombstone.status));
            }

            // A child that is gone from the process registry without having
            // left a tombstone had its delivery refused (this process was
            // already terminating at the time); no tombstone can ever
            // arrive for it, so drop it from the table instead of waiting.
            let stale: Vec<Pid> = state
                .child_pids
                .iter()
                .copied()
                .filter(|&p| p > 0 && self.services.processes.process_for_pid(p).is_none())
                .collect();
            for stale_pid in stale {
                Self::abandon_child_locked(&mut state, stale_pid);
            }

            // No tombstone yet: there must still be something to wait for.
            if pid != ANY_CHILD && !state.child_pids.contains(&pid) {
                return_errno_with_message!(Errno::ECHILD, "no such child");
            }
            if pid == ANY_CHILD
                && state.tombstones.is_empty()
                && !state.child_pids.iter().any(|&p| p > 0)
            {
                return_errno_with_message!(Errno::ECHILD, "no children left");
            }

            let (reacquired, outcome) = self.tombstone_cv.wait(ctx, state, QUANTUMS_INFINITY);
            state = reacquired;
            outcome?;
        }
    }
}

impl Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("ppid", &self.ppid)
            .field("terminating", &self.is_terminating())
            .finish()
    }
}
